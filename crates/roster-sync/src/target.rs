//! Resolve which event a sync writes into, creating a placeholder when none is active.

use chrono::{DateTime, Duration, Utc};
use roster_core::{Event, EventType, SyncStatus};
use roster_storage::{RosterStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

/// Days between placeholder creation and its event date.
pub const PLACEHOLDER_LEAD_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub event: Event,
    pub created: bool,
}

pub fn placeholder_event(event_type: EventType, dataset_id: Option<&str>, now: DateTime<Utc>) -> Event {
    Event {
        id: Uuid::new_v4(),
        code: format!("{}-{}", event_type.code_prefix(), now.format("%Y%m%d%H%M%S")),
        name: format!("{} (auto-created {})", event_type.label(), now.format("%Y-%m-%d")),
        event_type,
        dataset_ids: dataset_id.map(|id| vec![id.to_string()]).unwrap_or_default(),
        active: true,
        sync_status: SyncStatus::Pending,
        last_sync_at: None,
        event_date: Some(now + Duration::days(PLACEHOLDER_LEAD_DAYS)),
        registration_open: true,
        voting_enabled: true,
        created_at: now,
        updated_at: now,
    }
}

/// Latest active event of `event_type`, or a newly created placeholder.
/// The dataset id is recorded on whichever event is returned.
pub async fn resolve_target<S: RosterStore>(
    store: &S,
    event_type: EventType,
    dataset_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ResolvedTarget, StoreError> {
    if let Some(mut event) = store.find_active_event(event_type).await? {
        if let Some(dataset_id) = dataset_id {
            if !event.dataset_ids.iter().any(|d| d == dataset_id) {
                store.attach_dataset(event.id, dataset_id).await?;
                event.dataset_ids.push(dataset_id.to_string());
            }
        }
        info!(event_id = %event.id, code = %event.code, "using active event");
        return Ok(ResolvedTarget {
            event,
            created: false,
        });
    }

    let event = placeholder_event(event_type, dataset_id, now);
    match store.insert_event(&event).await {
        Ok(()) => {
            info!(event_id = %event.id, code = %event.code, "created placeholder event");
            Ok(ResolvedTarget {
                event,
                created: true,
            })
        }
        Err(err) => {
            // A concurrent run may have created one first.
            warn!(error = %err, "placeholder insert failed; re-checking for an active event");
            match store.find_active_event(event_type).await? {
                Some(existing) => {
                    if let Some(dataset_id) = dataset_id {
                        store.attach_dataset(existing.id, dataset_id).await?;
                    }
                    Ok(ResolvedTarget {
                        event: existing,
                        created: false,
                    })
                }
                None => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_storage::MemoryRosterStore;

    #[tokio::test]
    async fn creates_placeholder_when_no_active_event() {
        let store = MemoryRosterStore::new();
        let now = Utc::now();
        let target = resolve_target(&store, EventType::BmmVoting, Some("bmm-2026"), now)
            .await
            .unwrap();
        assert!(target.created);
        let event = &target.event;
        assert!(event.code.starts_with("BMM-"));
        assert!(event.active && event.registration_open && event.voting_enabled);
        assert_eq!(event.event_date, Some(now + Duration::days(30)));
        assert_eq!(event.dataset_ids, vec!["bmm-2026".to_string()]);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn reuses_active_event_and_attaches_dataset_once() {
        let store = MemoryRosterStore::new();
        let now = Utc::now();
        let first = resolve_target(&store, EventType::Survey, Some("a"), now).await.unwrap();
        let second = resolve_target(&store, EventType::Survey, Some("b"), now).await.unwrap();
        let third = resolve_target(&store, EventType::Survey, Some("b"), now).await.unwrap();

        assert!(!second.created && !third.created);
        assert_eq!(second.event.id, first.event.id);
        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].dataset_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn event_types_resolve_independently() {
        let store = MemoryRosterStore::new();
        let now = Utc::now();
        let bmm = resolve_target(&store, EventType::BmmVoting, None, now).await.unwrap();
        let ballot = resolve_target(&store, EventType::Ballot, None, now).await.unwrap();
        assert_ne!(bmm.event.id, ballot.event.id);
        assert!(ballot.event.code.starts_with("BAL-"));
        assert!(bmm.event.dataset_ids.is_empty());
    }
}
