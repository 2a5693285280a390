//! Persistence gateway for brokers, properties and messages, plus the
//! content-addressed archive used for imported transcripts.

use async_trait::async_trait;
use crm_core::{
    BrokerRecord, BrokerUpdate, MessageRecord, NewBroker, NewMessage, NewProperty, PropertyRecord,
};
use thiserror::Error;
use uuid::Uuid;

pub mod artifacts;
pub mod memory;
pub mod postgres;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use memory::MemoryGateway;
pub use postgres::PgGateway;

pub const CRATE_NAME: &str = "crm-storage";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// A broker with this phone already exists.
    #[error("broker with phone {phone} already exists")]
    Conflict { phone: String },
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Backend(err.into())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// CRM persistence as seen by the importer.
///
/// Broker rows are keyed by canonical phone; `create_broker` must report a
/// duplicate phone as [`GatewayError::Conflict`] so callers can fall back to
/// a lookup.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn find_broker_by_phone(&self, phone: &str) -> GatewayResult<Option<BrokerRecord>>;

    async fn create_broker(&self, broker: NewBroker) -> GatewayResult<BrokerRecord>;

    /// Raises `last_activity` and appends to notes; other fields are untouched.
    async fn update_broker(&self, phone: &str, update: BrokerUpdate)
        -> GatewayResult<BrokerRecord>;

    async fn create_property(&self, property: NewProperty) -> GatewayResult<PropertyRecord>;

    async fn create_message(&self, message: NewMessage) -> GatewayResult<MessageRecord>;

    async fn increment_broker_property_count(&self, broker_id: Uuid) -> GatewayResult<()>;
}

/// Appends `note` to an existing ` | `-joined notes string unless already present.
pub(crate) fn append_note(existing: Option<&str>, note: &str) -> Option<String> {
    match existing.filter(|s| !s.is_empty()) {
        None => Some(note.to_string()),
        Some(current) if current.split(" | ").any(|part| part == note) => {
            Some(current.to_string())
        }
        Some(current) => Some(format!("{current} | {note}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_append_without_duplicates() {
        assert_eq!(append_note(None, "a").as_deref(), Some("a"));
        assert_eq!(append_note(Some(""), "a").as_deref(), Some("a"));
        assert_eq!(append_note(Some("a"), "b").as_deref(), Some("a | b"));
        assert_eq!(append_note(Some("a | b"), "b").as_deref(), Some("a | b"));
    }

    #[test]
    fn conflict_error_names_the_phone() {
        let err = GatewayError::Conflict {
            phone: "201012345678".into(),
        };
        assert_eq!(err.to_string(), "broker with phone 201012345678 already exists");
    }
}
