//! Core domain model for the broker CRM chat importer.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crm-core";

/// Currency assumed for extracted prices when the text names none.
pub const DEFAULT_CURRENCY: &str = "EGP";

/// Where a message was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Whatsapp,
    Csv,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Whatsapp => "WHATSAPP",
            Platform::Csv => "CSV",
        }
    }
}

/// One transcript line group, as produced by a source parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub timestamp: NaiveDateTime,
    /// Date exactly as printed in the source.
    pub date_text: String,
    /// Time exactly as printed in the source.
    pub time_text: String,
    pub sender_raw: String,
    /// Separate phone column, when the source format carries one.
    pub phone_hint: Option<String>,
    pub text: String,
    /// 1-based line (or row) the message header was read from.
    pub source_line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingType {
    #[default]
    ForSale,
    ForRent,
    Wanted,
}

impl ListingType {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingType::ForSale => "FOR_SALE",
            ListingType::ForRent => "FOR_RENT",
            ListingType::Wanted => "WANTED",
        }
    }

    /// Arabic label used in generated titles.
    pub fn label(self) -> &'static str {
        match self {
            ListingType::ForSale => "للبيع",
            ListingType::ForRent => "للإيجار",
            ListingType::Wanted => "مطلوب",
        }
    }
}

impl fmt::Display for ListingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyType {
    #[default]
    Apartment,
    Villa,
    House,
    Office,
    Shop,
    Land,
    Warehouse,
}

impl PropertyType {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::Apartment => "APARTMENT",
            PropertyType::Villa => "VILLA",
            PropertyType::House => "HOUSE",
            PropertyType::Office => "OFFICE",
            PropertyType::Shop => "SHOP",
            PropertyType::Land => "LAND",
            PropertyType::Warehouse => "WAREHOUSE",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PropertyType::Apartment => "شقة",
            PropertyType::Villa => "فيلا",
            PropertyType::House => "منزل",
            PropertyType::Office => "مكتب",
            PropertyType::Shop => "محل",
            PropertyType::Land => "قطعة أرض",
            PropertyType::Warehouse => "مخزن",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate listing parsed out of a single message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedProperty {
    pub title: String,
    pub description: String,
    pub property_type: PropertyType,
    pub listing_type: ListingType,
    /// Absolute currency units.
    pub price: Option<f64>,
    pub currency: String,
    /// Square meters.
    pub area: Option<f64>,
    pub location: Option<String>,
    pub floor: Option<i32>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub negotiable: bool,
    pub features: BTreeSet<String>,
}

/// Canonical, phone-keyed sender accumulated over one import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerIdentity {
    pub phone: String,
    pub name: String,
    pub last_activity: NaiveDateTime,
    /// Properties attributed to this broker during the run.
    pub total_properties: u32,
    pub notes: Vec<String>,
    /// True when the phone was synthesized from a display name.
    pub synthetic_phone: bool,
}

impl BrokerIdentity {
    pub fn notes_text(&self) -> Option<String> {
        if self.notes.is_empty() {
            None
        } else {
            Some(self.notes.join(" | "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerStatus {
    #[default]
    Active,
    Inactive,
}

impl BrokerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerStatus::Active => "ACTIVE",
            BrokerStatus::Inactive => "INACTIVE",
        }
    }
}

/// Broker row as held by the persistence gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub id: Uuid,
    pub phone: String,
    pub name: String,
    pub status: BrokerStatus,
    pub last_activity: Option<NaiveDateTime>,
    pub total_properties: i64,
    pub notes: Option<String>,
    pub preferred_contact_method: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBroker {
    pub phone: String,
    pub name: String,
    pub status: BrokerStatus,
    pub last_activity: Option<NaiveDateTime>,
    pub notes: Option<String>,
    pub preferred_contact_method: String,
}

impl NewBroker {
    pub fn from_identity(identity: &BrokerIdentity) -> Self {
        Self {
            phone: identity.phone.clone(),
            name: identity.name.clone(),
            status: BrokerStatus::Active,
            last_activity: Some(identity.last_activity),
            notes: identity.notes_text(),
            preferred_contact_method: "WHATSAPP".to_string(),
        }
    }
}

/// Partial update applied by import reconciliation.
///
/// Only activity and provenance are ever touched; name, counts and other
/// broker-owned fields stay as the CRM has them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BrokerUpdate {
    /// Raised to this value if later than the stored one.
    pub last_activity: Option<NaiveDateTime>,
    pub append_note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyStatus {
    #[default]
    Available,
    Sold,
    Rented,
}

impl PropertyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyStatus::Available => "AVAILABLE",
            PropertyStatus::Sold => "SOLD",
            PropertyStatus::Rented => "RENTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProperty {
    pub owner_id: Uuid,
    pub owner_phone: String,
    pub status: PropertyStatus,
    pub date_posted: NaiveDateTime,
    pub extracted_from_message: bool,
    pub details: ExtractedProperty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: PropertyStatus,
    pub date_posted: NaiveDateTime,
    pub extracted_from_message: bool,
    pub details: ExtractedProperty,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Image => "IMAGE",
        }
    }
}

/// Persisted form of a [`RawMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub broker_id: Uuid,
    pub content: String,
    pub message_date: NaiveDateTime,
    pub message_time: String,
    pub platform: Platform,
    pub platform_message_id: String,
    pub message_type: MessageType,
    pub language: String,
    pub contains_property_info: bool,
    pub extracted_property_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub broker_id: Uuid,
    pub content: String,
    pub message_date: NaiveDateTime,
    pub message_time: String,
    pub platform: Platform,
    pub platform_message_id: String,
    pub message_type: MessageType,
    pub language: String,
    pub contains_property_info: bool,
    pub extracted_property_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 12, 15)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn enums_serialize_as_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ListingType::ForRent).unwrap(),
            "\"FOR_RENT\""
        );
        assert_eq!(
            serde_json::to_string(&PropertyType::Warehouse).unwrap(),
            "\"WAREHOUSE\""
        );
        assert_eq!(serde_json::to_string(&Platform::Whatsapp).unwrap(), "\"WHATSAPP\"");
        assert_eq!(ListingType::default(), ListingType::ForSale);
        assert_eq!(PropertyType::default(), PropertyType::Apartment);
    }

    #[test]
    fn new_broker_carries_identity_provenance() {
        let identity = BrokerIdentity {
            phone: "201012345678".into(),
            name: "سمسار 5678".into(),
            last_activity: at(10),
            total_properties: 3,
            notes: vec!["batch a".into(), "batch b".into()],
            synthetic_phone: false,
        };
        let new = NewBroker::from_identity(&identity);
        assert_eq!(new.phone, "201012345678");
        assert_eq!(new.last_activity, Some(at(10)));
        assert_eq!(new.notes.as_deref(), Some("batch a | batch b"));
        assert_eq!(new.status, BrokerStatus::Active);
    }
}
