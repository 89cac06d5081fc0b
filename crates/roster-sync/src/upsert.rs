//! Record upsert engine: one export record becomes one roster row for the target event.
//!
//! Existing rows only ever receive a [`RosterUpdate`], so identity and workflow
//! columns written at creation stay untouched across syncs.

use chrono::{DateTime, Utc};
use rand::Rng;
use roster_adapters::{map_value, RecordError};
use roster_core::{
    EventMember, Member, MemberDraft, MemberIdentity, Provenance, RosterUpdate, WorkflowState,
};
use roster_storage::{InsertOutcome, RosterTx, StoreError};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
    #[error("roster row for {0} reported a conflict but could not be re-read")]
    ConflictUnresolved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Per-run constants shared by every record of a sync.
#[derive(Debug, Clone)]
pub struct UpsertContext {
    pub event_id: Uuid,
    pub import_batch_id: Uuid,
    pub data_source: String,
    pub link_members: bool,
}

impl UpsertContext {
    fn provenance(&self, now: DateTime<Utc>) -> Provenance {
        Provenance {
            data_source: self.data_source.clone(),
            import_batch_id: self.import_batch_id,
            last_imported_at: now,
        }
    }
}

/// Fresh token plus a six digit, zero-padded verification code.
pub fn new_identity() -> MemberIdentity {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    MemberIdentity {
        token: Uuid::new_v4(),
        verification_code: format!("{code:06}"),
    }
}

pub async fn upsert_record<T: RosterTx>(
    tx: &mut T,
    ctx: &UpsertContext,
    raw: &JsonValue,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, UpsertError> {
    let draft = map_value(raw)?;
    upsert_draft(tx, ctx, draft, now).await
}

pub async fn upsert_draft<T: RosterTx>(
    tx: &mut T,
    ctx: &UpsertContext,
    draft: MemberDraft,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, UpsertError> {
    let member_id = if ctx.link_members {
        Some(tx.upsert_member(&canonical_member(&draft, now)).await?)
    } else {
        None
    };

    let MemberDraft {
        membership_number,
        name,
        contact,
        profile,
    } = draft;
    let update = RosterUpdate {
        member_id,
        name,
        contact,
        profile,
        provenance: ctx.provenance(now),
    };

    if let Some(existing) = tx.find_roster_row(ctx.event_id, &membership_number).await? {
        tx.update_roster_row(existing.id, &update).await?;
        return Ok(UpsertOutcome::Updated);
    }

    let row = new_row(ctx.event_id, membership_number, &update, now);
    match tx.insert_roster_row(&row).await? {
        InsertOutcome::Inserted => Ok(UpsertOutcome::Created),
        InsertOutcome::Conflict => {
            debug!(
                membership_number = %row.membership_number,
                "roster row created concurrently; updating instead"
            );
            let existing = tx
                .find_roster_row(ctx.event_id, &row.membership_number)
                .await?
                .ok_or_else(|| UpsertError::ConflictUnresolved(row.membership_number.clone()))?;
            tx.update_roster_row(existing.id, &update).await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

fn new_row(
    event_id: Uuid,
    membership_number: String,
    update: &RosterUpdate,
    now: DateTime<Utc>,
) -> EventMember {
    EventMember {
        id: Uuid::new_v4(),
        event_id,
        member_id: update.member_id,
        membership_number,
        name: update.name.clone(),
        contact: update.contact.clone(),
        identity: new_identity(),
        workflow: WorkflowState::default(),
        profile: update.profile.clone(),
        provenance: update.provenance.clone(),
        created_at: now,
        updated_at: now,
    }
}

fn canonical_member(draft: &MemberDraft, now: DateTime<Utc>) -> Member {
    Member {
        id: Uuid::new_v4(),
        membership_number: draft.membership_number.clone(),
        name: draft.name.clone(),
        email: draft
            .contact
            .primary_email
            .clone()
            .filter(|_| draft.contact.has_valid_email),
        mobile: draft
            .contact
            .telephone_mobile
            .clone()
            .filter(|_| draft.contact.has_valid_mobile),
        created_at: now,
        updated_at: now,
    }
}
