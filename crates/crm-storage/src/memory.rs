//! In-process gateway used for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crm_core::{
    BrokerRecord, BrokerUpdate, MessageRecord, NewBroker, NewMessage, NewProperty, PropertyRecord,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{append_note, GatewayError, GatewayResult, PersistenceGateway};

#[derive(Debug, Default)]
struct Tables {
    brokers: BTreeMap<String, BrokerRecord>,
    properties: Vec<PropertyRecord>,
    messages: Vec<MessageRecord>,
}

/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Brokers ordered by phone.
    pub async fn brokers(&self) -> Vec<BrokerRecord> {
        self.tables.read().await.brokers.values().cloned().collect()
    }

    pub async fn properties(&self) -> Vec<PropertyRecord> {
        self.tables.read().await.properties.clone()
    }

    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.tables.read().await.messages.clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn find_broker_by_phone(&self, phone: &str) -> GatewayResult<Option<BrokerRecord>> {
        Ok(self.tables.read().await.brokers.get(phone).cloned())
    }

    async fn create_broker(&self, broker: NewBroker) -> GatewayResult<BrokerRecord> {
        let mut tables = self.tables.write().await;
        if tables.brokers.contains_key(&broker.phone) {
            return Err(GatewayError::Conflict {
                phone: broker.phone,
            });
        }
        let record = BrokerRecord {
            id: Uuid::new_v4(),
            phone: broker.phone.clone(),
            name: broker.name,
            status: broker.status,
            last_activity: broker.last_activity,
            total_properties: 0,
            notes: broker.notes,
            preferred_contact_method: broker.preferred_contact_method,
            created_at: Utc::now(),
        };
        tables.brokers.insert(broker.phone, record.clone());
        Ok(record)
    }

    async fn update_broker(
        &self,
        phone: &str,
        update: BrokerUpdate,
    ) -> GatewayResult<BrokerRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .brokers
            .get_mut(phone)
            .ok_or_else(|| GatewayError::NotFound {
                entity: "broker",
                key: phone.to_string(),
            })?;
        if let Some(seen) = update.last_activity {
            record.last_activity = Some(record.last_activity.map_or(seen, |cur| cur.max(seen)));
        }
        if let Some(note) = update.append_note.as_deref() {
            record.notes = append_note(record.notes.as_deref(), note);
        }
        Ok(record.clone())
    }

    async fn create_property(&self, property: NewProperty) -> GatewayResult<PropertyRecord> {
        let mut tables = self.tables.write().await;
        if !tables.brokers.values().any(|b| b.id == property.owner_id) {
            return Err(GatewayError::NotFound {
                entity: "broker",
                key: property.owner_id.to_string(),
            });
        }
        let record = PropertyRecord {
            id: Uuid::new_v4(),
            owner_id: property.owner_id,
            status: property.status,
            date_posted: property.date_posted,
            extracted_from_message: property.extracted_from_message,
            details: property.details,
            created_at: Utc::now(),
        };
        tables.properties.push(record.clone());
        Ok(record)
    }

    async fn create_message(&self, message: NewMessage) -> GatewayResult<MessageRecord> {
        let mut tables = self.tables.write().await;
        let record = MessageRecord {
            id: Uuid::new_v4(),
            broker_id: message.broker_id,
            content: message.content,
            message_date: message.message_date,
            message_time: message.message_time,
            platform: message.platform,
            platform_message_id: message.platform_message_id,
            message_type: message.message_type,
            language: message.language,
            contains_property_info: message.contains_property_info,
            extracted_property_id: message.extracted_property_id,
            created_at: Utc::now(),
        };
        tables.messages.push(record.clone());
        Ok(record)
    }

    async fn increment_broker_property_count(&self, broker_id: Uuid) -> GatewayResult<()> {
        let mut tables = self.tables.write().await;
        let broker = tables
            .brokers
            .values_mut()
            .find(|b| b.id == broker_id)
            .ok_or_else(|| GatewayError::NotFound {
                entity: "broker",
                key: broker_id.to_string(),
            })?;
        broker.total_properties += 1;
        Ok(())
    }
}
