//! In-process roster store for dry runs and tests.
//!
//! Transactions stage writes in an overlay and apply them under one lock on commit.
//! An insert whose natural key was committed by someone else in the meantime is
//! merged as an update of the existing row, which keeps that row's identity.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_core::{Event, EventMember, EventType, JobProgress, Member, RosterUpdate, SyncStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{InsertOutcome, RosterStore, RosterTx, StoreError};

type RowKey = (Uuid, String);

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<Event>,
    rows: HashMap<RowKey, EventMember>,
    row_keys: HashMap<Uuid, RowKey>,
    members: HashMap<String, Member>,
    jobs: HashMap<String, JobProgress>,
    commits_attempted: usize,
    failing_commits: BTreeSet<usize>,
    fail_begin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRosterStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the n-th commit (1-based, counted across all transactions) fail and roll back.
    pub async fn fail_commit_number(&self, ordinal: usize) {
        self.state.lock().await.failing_commits.insert(ordinal);
    }

    /// Make every subsequent `begin` fail, as if the store were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.fail_begin = unavailable;
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    pub async fn members(&self) -> Vec<Member> {
        let state = self.state.lock().await;
        let mut members: Vec<_> = state.members.values().cloned().collect();
        members.sort_by(|a, b| a.membership_number.cmp(&b.membership_number));
        members
    }

    /// Roster rows of one event ordered by membership number.
    pub async fn roster(&self, event_id: Uuid) -> Vec<EventMember> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .rows
            .values()
            .filter(|row| row.event_id == event_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.membership_number.cmp(&b.membership_number));
        rows
    }

    fn event_mut<'a>(state: &'a mut MemoryState, event_id: Uuid) -> Result<&'a mut Event, StoreError> {
        state
            .events
            .iter_mut()
            .find(|event| event.id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    type Tx = MemoryRosterTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        if self.state.lock().await.fail_begin {
            return Err(StoreError::Injected("store unavailable".into()));
        }
        Ok(MemoryRosterTx {
            state: self.state.clone(),
            staged_rows: HashMap::new(),
            staged_keys: HashMap::new(),
            inserted: BTreeSet::new(),
            staged_members: HashMap::new(),
        })
    }

    async fn find_active_event(&self, event_type: EventType) -> Result<Option<Event>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|event| event.active && event.event_type == event_type)
            .max_by_key(|event| event.created_at)
            .cloned())
    }

    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.events.iter().any(|e| e.id == event.id || e.code == event.code) {
            return Err(StoreError::InvalidData(format!(
                "event {} already exists",
                event.code
            )));
        }
        state.events.push(event.clone());
        Ok(())
    }

    async fn attach_dataset(&self, event_id: Uuid, dataset_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let event = Self::event_mut(&mut state, event_id)?;
        if !event.dataset_ids.iter().any(|d| d == dataset_id) {
            event.dataset_ids.push(dataset_id.to_string());
            event.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_event_sync_status(
        &self,
        event_id: Uuid,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let event = Self::event_mut(&mut state, event_id)?;
        event.sync_status = status;
        if synced_at.is_some() {
            event.last_sync_at = synced_at;
        }
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn save_job_progress(&self, progress: &JobProgress) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(progress.job_id.clone(), progress.clone());
        Ok(())
    }

    async fn load_job_progress(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn roster_row(
        &self,
        event_id: Uuid,
        membership_number: &str,
    ) -> Result<Option<EventMember>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .get(&(event_id, membership_number.to_string()))
            .cloned())
    }

    async fn count_roster_rows(&self, event_id: Uuid) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.keys().filter(|(event, _)| *event == event_id).count() as u64)
    }
}

#[derive(Debug)]
pub struct MemoryRosterTx {
    state: Arc<Mutex<MemoryState>>,
    staged_rows: HashMap<RowKey, EventMember>,
    staged_keys: HashMap<Uuid, RowKey>,
    inserted: BTreeSet<Uuid>,
    staged_members: HashMap<String, Member>,
}

#[async_trait]
impl RosterTx for MemoryRosterTx {
    async fn find_roster_row(
        &mut self,
        event_id: Uuid,
        membership_number: &str,
    ) -> Result<Option<EventMember>, StoreError> {
        let key = (event_id, membership_number.to_string());
        if let Some(row) = self.staged_rows.get(&key) {
            return Ok(Some(row.clone()));
        }
        Ok(self.state.lock().await.rows.get(&key).cloned())
    }

    async fn insert_roster_row(&mut self, row: &EventMember) -> Result<InsertOutcome, StoreError> {
        let key = (row.event_id, row.membership_number.clone());
        if self.staged_rows.contains_key(&key) || self.state.lock().await.rows.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        self.staged_keys.insert(row.id, key.clone());
        self.inserted.insert(row.id);
        self.staged_rows.insert(key, row.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_roster_row(
        &mut self,
        row_id: Uuid,
        update: &RosterUpdate,
    ) -> Result<(), StoreError> {
        if let Some(key) = self.staged_keys.get(&row_id) {
            if let Some(row) = self.staged_rows.get_mut(key) {
                row.apply_update(update);
                return Ok(());
            }
        }

        let mut row = {
            let state = self.state.lock().await;
            state
                .row_keys
                .get(&row_id)
                .and_then(|key| state.rows.get(key))
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("roster row {row_id}")))?
        };
        row.apply_update(update);
        let key = (row.event_id, row.membership_number.clone());
        self.staged_keys.insert(row_id, key.clone());
        self.staged_rows.insert(key, row);
        Ok(())
    }

    async fn upsert_member(&mut self, member: &Member) -> Result<Uuid, StoreError> {
        let existing = match self.staged_members.get(&member.membership_number) {
            Some(staged) => Some(staged.clone()),
            None => self
                .state
                .lock()
                .await
                .members
                .get(&member.membership_number)
                .cloned(),
        };
        let merged = match existing {
            Some(existing) => Member {
                id: existing.id,
                created_at: existing.created_at,
                ..member.clone()
            },
            None => member.clone(),
        };
        let id = merged.id;
        self.staged_members
            .insert(merged.membership_number.clone(), merged);
        Ok(id)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.commits_attempted += 1;
        let ordinal = state.commits_attempted;
        if state.failing_commits.contains(&ordinal) {
            return Err(StoreError::Injected(format!("commit #{ordinal} rejected")));
        }

        for (number, member) in self.staged_members {
            state.members.insert(number, member);
        }

        for (key, row) in self.staged_rows {
            let raced = self.inserted.contains(&row.id)
                && state
                    .rows
                    .get(&key)
                    .is_some_and(|existing| existing.id != row.id);
            if raced {
                if let Some(existing) = state.rows.get_mut(&key) {
                    existing.apply_update(&row.to_update());
                }
            } else {
                state.row_keys.insert(row.id, key.clone());
                state.rows.insert(key, row);
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
