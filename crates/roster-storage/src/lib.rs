//! Export fetching, payload archiving and roster persistence.

pub mod archive;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use archive::{ArchivedPayload, PayloadArchive};
pub use http::{
    decode_body, redact_url, FetchError, FetchedPayload, HttpClientConfig, HttpFetcher,
    RetryDisposition, RetryPolicy,
};
pub use memory::{MemoryRosterStore, MemoryRosterTx};
pub use postgres::{PgRosterStore, PgRosterTx, MIGRATOR};
pub use store::{InsertOutcome, RosterStore, RosterTx, StoreError};

pub const CRATE_NAME: &str = "roster-storage";
