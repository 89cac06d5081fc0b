//! Core domain model for the membership roster sync: events, canonical members,
//! per-event roster rows and sync job progress.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod profile;

pub use profile::{MemberProfile, ProfileField};

pub const CRATE_NAME: &str = "roster-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum persisted as snake_case text.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// Kind of meeting or voting occasion a roster belongs to.
    EventType, "event type" {
        GeneralMeeting => "general_meeting",
        SpecialConference => "special_conference",
        Survey => "survey",
        BmmVoting => "bmm_voting",
        Ballot => "ballot",
        Annual => "annual",
        Workshop => "workshop",
        UnionMeeting => "union_meeting",
    }
);

impl EventType {
    pub fn label(&self) -> &'static str {
        match self {
            EventType::GeneralMeeting => "General Meeting",
            EventType::SpecialConference => "Special Conference",
            EventType::Survey => "Survey",
            EventType::BmmVoting => "BMM Voting",
            EventType::Ballot => "Ballot",
            EventType::Annual => "Annual Meeting",
            EventType::Workshop => "Workshop",
            EventType::UnionMeeting => "Union Meeting",
        }
    }

    pub fn code_prefix(&self) -> &'static str {
        match self {
            EventType::GeneralMeeting => "GM",
            EventType::SpecialConference => "SC",
            EventType::Survey => "SRV",
            EventType::BmmVoting => "BMM",
            EventType::Ballot => "BAL",
            EventType::Annual => "ANN",
            EventType::Workshop => "WS",
            EventType::UnionMeeting => "UM",
        }
    }
}

text_enum!(
    /// Outcome of the most recent sync that targeted an event.
    SyncStatus, "sync status" {
        Pending => "pending",
        InProgress => "in_progress",
        Success => "success",
        Failed => "failed",
        Partial => "partial",
    }
);

text_enum!(
    RegistrationStatus, "registration status" {
        NotStarted => "not_started",
        Registered => "registered",
        Declined => "declined",
    }
);

text_enum!(
    BmmStage, "bmm stage" {
        Invited => "invited",
        PreferenceSubmitted => "preference_submitted",
        Confirmed => "confirmed",
        Attended => "attended",
    }
);

text_enum!(
    TicketStatus, "ticket status" {
        NotIssued => "not_issued",
        Issued => "issued",
        Scanned => "scanned",
    }
);

text_enum!(
    /// Terminal (or running) state of a sync job as seen by progress pollers.
    JobStatus, "job status" {
        Running => "running",
        Success => "success",
        Failed => "failed",
        Partial => "partial",
    }
);

text_enum!(
    SyncStage, "sync stage" {
        Fetch => "fetch",
        Validate => "validate",
        Normalize => "normalize",
        ResolveTarget => "resolve_target",
        BatchProcess => "batch_process",
        Report => "report",
    }
);

impl From<JobStatus> for SyncStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Running => SyncStatus::InProgress,
            JobStatus::Success => SyncStatus::Success,
            JobStatus::Failed => SyncStatus::Failed,
            JobStatus::Partial => SyncStatus::Partial,
        }
    }
}

/// Mapped handoff contract from the export adapter into the upsert engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDraft {
    pub membership_number: String,
    pub name: String,
    pub contact: ContactDetails,
    pub profile: MemberProfile,
}

/// A meeting/voting occasion that roster rows attach to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub event_type: EventType,
    pub dataset_ids: Vec<String>,
    pub active: bool,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub event_date: Option<DateTime<Utc>>,
    pub registration_open: bool,
    pub voting_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Union member independent of any event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub membership_number: String,
    pub name: String,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contact fields paired with their derived validity flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactDetails {
    pub primary_email: Option<String>,
    pub telephone_mobile: Option<String>,
    pub has_valid_email: bool,
    pub has_valid_mobile: bool,
}

/// Values embedded in outbound links and messages. Generated once per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIdentity {
    pub token: Uuid,
    pub verification_code: String,
}

/// Registration/ticketing state owned by other workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub registration_status: RegistrationStatus,
    pub bmm_stage: BmmStage,
    pub ticket_status: TicketStatus,
    pub checked_in: bool,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            registration_status: RegistrationStatus::NotStarted,
            bmm_stage: BmmStage::Invited,
            ticket_status: TicketStatus::NotIssued,
            checked_in: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub data_source: String,
    pub import_batch_id: Uuid,
    pub last_imported_at: DateTime<Utc>,
}

/// A member's participation record in one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMember {
    pub id: Uuid,
    pub event_id: Uuid,
    pub member_id: Option<Uuid>,
    pub membership_number: String,
    pub name: String,
    pub contact: ContactDetails,
    pub identity: MemberIdentity,
    pub workflow: WorkflowState,
    pub profile: MemberProfile,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventMember {
    /// Apply a sync update. Identity and workflow state are never part of an update.
    pub fn apply_update(&mut self, update: &RosterUpdate) {
        self.name = update.name.clone();
        self.contact = update.contact.clone();
        self.profile = update.profile.clone();
        self.provenance = update.provenance.clone();
        if update.member_id.is_some() {
            self.member_id = update.member_id;
        }
        self.updated_at = update.provenance.last_imported_at;
    }

    /// The sync-writable part of this row.
    pub fn to_update(&self) -> RosterUpdate {
        RosterUpdate {
            member_id: self.member_id,
            name: self.name.clone(),
            contact: self.contact.clone(),
            profile: self.profile.clone(),
            provenance: self.provenance.clone(),
        }
    }
}

/// The subset of a roster row a sync is allowed to rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterUpdate {
    pub member_id: Option<Uuid>,
    pub name: String,
    pub contact: ContactDetails,
    pub profile: MemberProfile,
    pub provenance: Provenance,
}

/// Progress record polled by operators, keyed by the logical job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub stage: SyncStage,
    pub event_id: Option<Uuid>,
    pub total_records: u64,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub errored: u64,
    pub failed_chunks: u64,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    pub fn started(job_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Running,
            stage: SyncStage::Fetch,
            event_id: None,
            total_records: 0,
            processed: 0,
            created: 0,
            updated: 0,
            errored: 0,
            failed_chunks: 0,
            message: None,
            started_at: at,
            updated_at: at,
            finished_at: None,
        }
    }
}
