//! Import orchestration: parse an export, extract listings, resolve broker
//! identities and persist everything through a [`PersistenceGateway`].
//!
//! [`PersistenceGateway`]: crm_storage::PersistenceGateway

use thiserror::Error;

pub mod config;
pub mod identity;
pub mod pipeline;
pub mod report;

pub use config::ImportConfig;
pub use identity::{
    reconcile_broker, CanonicalSender, IdentityAccumulator, IdentityCollision, IdentityResolver,
    Reconciled,
};
pub use pipeline::{platform_message_id, ImportPipeline, ImportSummary, RecordError};
pub use report::{render_brief, write_reports, ReportedProperty};

pub const CRATE_NAME: &str = "crm-import";

/// Errors that stop a run before anything is persisted.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("source file {path} is unavailable: {source}")]
    SourceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown source format {0:?} (expected whatsapp or csv)")]
    UnknownFormat(String),
}
