//! Postgres-backed gateway.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::{
    BrokerRecord, BrokerUpdate, MessageRecord, NewBroker, NewMessage, NewProperty, PropertyRecord,
};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{GatewayError, GatewayResult, PersistenceGateway};

const BROKER_COLUMNS: &str = "id, phone, name, status, last_activity, total_properties, notes, \
                              preferred_contact_method, created_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Reads a SCREAMING_SNAKE_CASE text column back into its enum.
fn enum_column<T: DeserializeOwned>(row: &PgRow, column: &str) -> GatewayResult<T> {
    let text: String = row.try_get(column)?;
    serde_json::from_value(serde_json::Value::String(text.clone()))
        .with_context(|| format!("unknown {column} value {text:?}"))
        .map_err(GatewayError::from)
}

fn broker_from_row(row: &PgRow) -> GatewayResult<BrokerRecord> {
    Ok(BrokerRecord {
        id: row.try_get("id")?,
        phone: row.try_get("phone")?,
        name: row.try_get("name")?,
        status: enum_column(row, "status")?,
        last_activity: row.try_get("last_activity")?,
        total_properties: row.try_get("total_properties")?,
        notes: row.try_get("notes")?,
        preferred_contact_method: row.try_get("preferred_contact_method")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn find_broker_by_phone(&self, phone: &str) -> GatewayResult<Option<BrokerRecord>> {
        let row = sqlx::query(&format!("SELECT {BROKER_COLUMNS} FROM brokers WHERE phone = $1"))
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(broker_from_row).transpose()
    }

    async fn create_broker(&self, broker: NewBroker) -> GatewayResult<BrokerRecord> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO brokers (id, phone, name, status, last_activity, notes, preferred_contact_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {BROKER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&broker.phone)
        .bind(&broker.name)
        .bind(broker.status.as_str())
        .bind(broker.last_activity)
        .bind(&broker.notes)
        .bind(&broker.preferred_contact_method)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => broker_from_row(&row),
            Err(err) if is_unique_violation(&err) => {
                debug!(phone = %broker.phone, "broker insert hit unique phone");
                Err(GatewayError::Conflict {
                    phone: broker.phone,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_broker(
        &self,
        phone: &str,
        update: BrokerUpdate,
    ) -> GatewayResult<BrokerRecord> {
        // GREATEST skips NULLs, so a missing stored or incoming value keeps the other.
        let row = sqlx::query(&format!(
            r#"
            UPDATE brokers
               SET last_activity = GREATEST(last_activity, $2),
                   notes = CASE
                       WHEN $3::text IS NULL THEN notes
                       WHEN notes IS NULL OR notes = '' THEN $3
                       WHEN $3 = ANY(string_to_array(notes, ' | ')) THEN notes
                       ELSE notes || ' | ' || $3
                   END
             WHERE phone = $1
            RETURNING {BROKER_COLUMNS}
            "#
        ))
        .bind(phone)
        .bind(update.last_activity)
        .bind(update.append_note.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => broker_from_row(&row),
            None => Err(GatewayError::NotFound {
                entity: "broker",
                key: phone.to_string(),
            }),
        }
    }

    async fn create_property(&self, property: NewProperty) -> GatewayResult<PropertyRecord> {
        let id = Uuid::new_v4();
        let details = &property.details;
        let features = serde_json::to_value(&details.features).context("encoding features")?;
        let row = sqlx::query(
            r#"
            INSERT INTO properties (
                id, owner_id, title, description, property_type, listing_type, status,
                price, currency, area, location, floor, bedrooms, bathrooms, negotiable,
                features, date_posted, extracted_from_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(property.owner_id)
        .bind(&details.title)
        .bind(&details.description)
        .bind(details.property_type.as_str())
        .bind(details.listing_type.as_str())
        .bind(property.status.as_str())
        .bind(details.price)
        .bind(&details.currency)
        .bind(details.area)
        .bind(&details.location)
        .bind(details.floor)
        .bind(details.bedrooms.map(|n| n as i32))
        .bind(details.bathrooms.map(|n| n as i32))
        .bind(details.negotiable)
        .bind(features)
        .bind(property.date_posted)
        .bind(property.extracted_from_message)
        .fetch_one(&self.pool)
        .await?;

        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(PropertyRecord {
            id,
            owner_id: property.owner_id,
            status: property.status,
            date_posted: property.date_posted,
            extracted_from_message: property.extracted_from_message,
            details: property.details,
            created_at,
        })
    }

    async fn create_message(&self, message: NewMessage) -> GatewayResult<MessageRecord> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO messages (
                id, broker_id, content, message_date, message_time, platform,
                platform_message_id, message_type, language, contains_property_info,
                extracted_property_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(message.broker_id)
        .bind(&message.content)
        .bind(message.message_date)
        .bind(&message.message_time)
        .bind(message.platform.as_str())
        .bind(&message.platform_message_id)
        .bind(message.message_type.as_str())
        .bind(&message.language)
        .bind(message.contains_property_info)
        .bind(message.extracted_property_id)
        .fetch_one(&self.pool)
        .await?;

        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(MessageRecord {
            id,
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
            created_at,
        })
    }

    async fn increment_broker_property_count(&self, broker_id: Uuid) -> GatewayResult<()> {
        let result = sqlx::query(
            "UPDATE brokers SET total_properties = total_properties + 1 WHERE id = $1",
        )
        .bind(broker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound {
                entity: "broker",
                key: broker_id.to_string(),
            });
        }
        Ok(())
    }
}
