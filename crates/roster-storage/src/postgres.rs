//! Postgres roster store on sqlx.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_core::{
    ContactDetails, Event, EventMember, EventType, JobProgress, Member, MemberIdentity,
    MemberProfile, Provenance, RosterUpdate, SyncStatus, UnknownVariant, WorkflowState,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Acquire, PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::store::{InsertOutcome, RosterStore, RosterTx, StoreError};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const EVENT_COLUMNS: &str = "id, code, name, event_type, dataset_ids, active, sync_status, \
     last_sync_at, event_date, registration_open, voting_enabled, created_at, updated_at";

const ROSTER_COLUMNS: &str = "id, event_id, member_id, membership_number, name, primary_email, \
     telephone_mobile, has_valid_email, has_valid_mobile, token, verification_code, \
     registration_status, bmm_stage, ticket_status, checked_in, profile, data_source, \
     import_batch_id, last_imported_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgRosterStore {
    pool: PgPool,
}

impl PgRosterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("roster schema migrations applied");
        Ok(())
    }
}

fn parse_text<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|err| StoreError::InvalidData(format!("{column}: {err}")))
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_count(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        event_type: parse_text(row, "event_type")?,
        dataset_ids: row.try_get("dataset_ids")?,
        active: row.try_get("active")?,
        sync_status: parse_text(row, "sync_status")?,
        last_sync_at: row.try_get("last_sync_at")?,
        event_date: row.try_get("event_date")?,
        registration_open: row.try_get("registration_open")?,
        voting_enabled: row.try_get("voting_enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn roster_from_row(row: &PgRow) -> Result<EventMember, StoreError> {
    let profile: Json<MemberProfile> = row.try_get("profile")?;
    Ok(EventMember {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        member_id: row.try_get("member_id")?,
        membership_number: row.try_get("membership_number")?,
        name: row.try_get("name")?,
        contact: ContactDetails {
            primary_email: row.try_get("primary_email")?,
            telephone_mobile: row.try_get("telephone_mobile")?,
            has_valid_email: row.try_get("has_valid_email")?,
            has_valid_mobile: row.try_get("has_valid_mobile")?,
        },
        identity: MemberIdentity {
            token: row.try_get("token")?,
            verification_code: row.try_get("verification_code")?,
        },
        workflow: WorkflowState {
            registration_status: parse_text(row, "registration_status")?,
            bmm_stage: parse_text(row, "bmm_stage")?,
            ticket_status: parse_text(row, "ticket_status")?,
            checked_in: row.try_get("checked_in")?,
        },
        profile: profile.0,
        provenance: Provenance {
            data_source: row.try_get("data_source")?,
            import_batch_id: row.try_get("import_batch_id")?,
            last_imported_at: row.try_get("last_imported_at")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<JobProgress, StoreError> {
    Ok(JobProgress {
        job_id: row.try_get("job_id")?,
        status: parse_text(row, "status")?,
        stage: parse_text(row, "stage")?,
        event_id: row.try_get("event_id")?,
        total_records: read_count(row, "total_records")?,
        processed: read_count(row, "processed")?,
        created: read_count(row, "created")?,
        updated: read_count(row, "updated")?,
        errored: read_count(row, "errored")?,
        failed_chunks: read_count(row, "failed_chunks")?,
        message: row.try_get("message")?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl RosterStore for PgRosterStore {
    type Tx = PgRosterTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(PgRosterTx { tx })
    }

    async fn find_active_event(&self, event_type: EventType) -> Result<Option<Event>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
              WHERE active AND event_type = $1 \
              ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(event_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events
                (id, code, name, event_type, dataset_ids, active, sync_status, last_sync_at,
                 event_date, registration_open, voting_enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event.id)
        .bind(&event.code)
        .bind(&event.name)
        .bind(event.event_type.as_str())
        .bind(&event.dataset_ids)
        .bind(event.active)
        .bind(event.sync_status.as_str())
        .bind(event.last_sync_at)
        .bind(event.event_date)
        .bind(event.registration_open)
        .bind(event.voting_enabled)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attach_dataset(&self, event_id: Uuid, dataset_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
               SET dataset_ids = CASE WHEN $2 = ANY(dataset_ids) THEN dataset_ids
                                      ELSE array_append(dataset_ids, $2) END,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(dataset_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    async fn set_event_sync_status(
        &self,
        event_id: Uuid,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
               SET sync_status = $2,
                   last_sync_at = COALESCE($3, last_sync_at),
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(synced_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event {event_id}")));
        }
        Ok(())
    }

    async fn save_job_progress(&self, progress: &JobProgress) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs
                (job_id, status, stage, event_id, total_records, processed, created, updated,
                 errored, failed_chunks, message, started_at, updated_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (job_id) DO UPDATE SET
                status = excluded.status,
                stage = excluded.stage,
                event_id = excluded.event_id,
                total_records = excluded.total_records,
                processed = excluded.processed,
                created = excluded.created,
                updated = excluded.updated,
                errored = excluded.errored,
                failed_chunks = excluded.failed_chunks,
                message = excluded.message,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(&progress.job_id)
        .bind(progress.status.as_str())
        .bind(progress.stage.as_str())
        .bind(progress.event_id)
        .bind(count(progress.total_records))
        .bind(count(progress.processed))
        .bind(count(progress.created))
        .bind(count(progress.updated))
        .bind(count(progress.errored))
        .bind(count(progress.failed_chunks))
        .bind(&progress.message)
        .bind(progress.started_at)
        .bind(progress.updated_at)
        .bind(progress.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_job_progress(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, status, stage, event_id, total_records, processed, created, updated,
                   errored, failed_chunks, message, started_at, updated_at, finished_at
              FROM sync_jobs
             WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn roster_row(
        &self,
        event_id: Uuid,
        membership_number: &str,
    ) -> Result<Option<EventMember>, StoreError> {
        let sql = format!(
            "SELECT {ROSTER_COLUMNS} FROM event_members \
              WHERE event_id = $1 AND membership_number = $2"
        );
        let row = sqlx::query(&sql)
            .bind(event_id)
            .bind(membership_number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(roster_from_row).transpose()
    }

    async fn count_roster_rows(&self, event_id: Uuid) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_members WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }
}

/// Chunk transaction. Every write runs inside its own savepoint, so a failing
/// statement rolls back only that write and the chunk stays usable.
pub struct PgRosterTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RosterTx for PgRosterTx {
    async fn find_roster_row(
        &mut self,
        event_id: Uuid,
        membership_number: &str,
    ) -> Result<Option<EventMember>, StoreError> {
        let sql = format!(
            "SELECT {ROSTER_COLUMNS} FROM event_members \
              WHERE event_id = $1 AND membership_number = $2"
        );
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        let row = sqlx::query(&sql)
            .bind(event_id)
            .bind(membership_number)
            .fetch_optional(&mut *savepoint)
            .await?;
        savepoint.commit().await?;
        row.as_ref().map(roster_from_row).transpose()
    }

    async fn insert_roster_row(&mut self, row: &EventMember) -> Result<InsertOutcome, StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO event_members
                (id, event_id, member_id, membership_number, name, primary_email,
                 telephone_mobile, has_valid_email, has_valid_mobile, token, verification_code,
                 registration_status, bmm_stage, ticket_status, checked_in, profile, data_source,
                 import_batch_id, last_imported_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            ON CONFLICT (event_id, membership_number) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.event_id)
        .bind(row.member_id)
        .bind(&row.membership_number)
        .bind(&row.name)
        .bind(&row.contact.primary_email)
        .bind(&row.contact.telephone_mobile)
        .bind(row.contact.has_valid_email)
        .bind(row.contact.has_valid_mobile)
        .bind(row.identity.token)
        .bind(&row.identity.verification_code)
        .bind(row.workflow.registration_status.as_str())
        .bind(row.workflow.bmm_stage.as_str())
        .bind(row.workflow.ticket_status.as_str())
        .bind(row.workflow.checked_in)
        .bind(Json(&row.profile))
        .bind(&row.provenance.data_source)
        .bind(row.provenance.import_batch_id)
        .bind(row.provenance.last_imported_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *savepoint)
        .await?;
        savepoint.commit().await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Conflict)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn update_roster_row(
        &mut self,
        row_id: Uuid,
        update: &RosterUpdate,
    ) -> Result<(), StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        let result = sqlx::query(
            r#"
            UPDATE event_members
               SET member_id = COALESCE($2, member_id),
                   name = $3,
                   primary_email = $4,
                   telephone_mobile = $5,
                   has_valid_email = $6,
                   has_valid_mobile = $7,
                   profile = $8,
                   data_source = $9,
                   import_batch_id = $10,
                   last_imported_at = $11,
                   updated_at = $11
             WHERE id = $1
            "#,
        )
        .bind(row_id)
        .bind(update.member_id)
        .bind(&update.name)
        .bind(&update.contact.primary_email)
        .bind(&update.contact.telephone_mobile)
        .bind(update.contact.has_valid_email)
        .bind(update.contact.has_valid_mobile)
        .bind(Json(&update.profile))
        .bind(&update.provenance.data_source)
        .bind(update.provenance.import_batch_id)
        .bind(update.provenance.last_imported_at)
        .execute(&mut *savepoint)
        .await?;
        savepoint.commit().await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("roster row {row_id}")));
        }
        Ok(())
    }

    async fn upsert_member(&mut self, member: &Member) -> Result<Uuid, StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO members (id, membership_number, name, email, mobile, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (membership_number) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                mobile = excluded.mobile,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(member.id)
        .bind(&member.membership_number)
        .bind(&member.name)
        .bind(&member.email)
        .bind(&member.mobile)
        .bind(member.created_at)
        .bind(member.updated_at)
        .fetch_one(&mut *savepoint)
        .await?;
        savepoint.commit().await?;
        Ok(id)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
