use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use crm_core::{
    ExtractedProperty, MessageType, NewMessage, NewProperty, Platform, PropertyStatus, RawMessage,
};
use crm_ingest::{
    detect_language, format_for_id, format_for_path, Extraction, ExtractionRules, Extractor,
    SourceFormat,
};
use crm_storage::{ArtifactStore, PersistenceGateway};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::identity::{
    reconcile_broker, IdentityAccumulator, IdentityCollision, IdentityResolver, Reconciled,
};
use crate::report::{write_reports, ReportedProperty};
use crate::ImportError;

/// One persistence call that failed; the run carried on without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    /// `broker <phone>`, `property line <n>` or `message line <n>`.
    pub record: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub source: String,
    pub format: String,
    pub batch_marker: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub messages_parsed: usize,
    /// Skipped message counts keyed by reason (`system`, `media`, ...).
    pub messages_skipped: BTreeMap<String, usize>,
    pub property_messages: usize,
    pub brokers_resolved: usize,
    pub brokers_created: usize,
    pub brokers_matched: usize,
    pub properties_created: usize,
    pub messages_persisted: usize,
    pub errors: Vec<RecordError>,
    pub collisions: Vec<IdentityCollision>,
    pub reports_dir: Option<String>,
}

impl ImportSummary {
    pub fn skipped_total(&self) -> usize {
        self.messages_skipped.values().sum()
    }
}

/// A message that passed the filters, ready for persistence.
struct StagedMessage {
    raw: RawMessage,
    phone: String,
    property: Option<ExtractedProperty>,
}

/// Stable fingerprint of a message inside its source export.
pub fn platform_message_id(timestamp: NaiveDateTime, sender: &str, content: &str) -> String {
    ArtifactStore::sha256_hex(format!("{timestamp}|{sender}|{content}").as_bytes())
}

fn provenance_note(platform: Platform, source: &Path, marker: &str) -> String {
    let origin = match platform {
        Platform::Whatsapp => "مستورد من مجموعة واتساب",
        Platform::Csv => "مستورد من ملف CSV",
    };
    let file = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source.display().to_string());
    format!("{origin} - {file} - {marker}")
}

pub struct ImportPipeline {
    config: ImportConfig,
    gateway: Arc<dyn PersistenceGateway>,
    extractor: Extractor,
    resolver: IdentityResolver,
    archive: ArtifactStore,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig, gateway: Arc<dyn PersistenceGateway>) -> Result<Self> {
        let rules = ExtractionRules::load(config.rules_path.as_deref())?;
        Ok(Self::with_rules(config, gateway, rules))
    }

    pub fn with_rules(
        config: ImportConfig,
        gateway: Arc<dyn PersistenceGateway>,
        rules: ExtractionRules,
    ) -> Self {
        let extractor = Extractor::new(rules).with_currency(config.currency.clone());
        let resolver = IdentityResolver::new(config.country_code.clone());
        let archive = ArtifactStore::new(config.archive_dir.clone());
        Self {
            config,
            gateway,
            extractor,
            resolver,
            archive,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn resolve_format(&self, path: &Path, format_id: Option<&str>) -> Result<Box<dyn SourceFormat>> {
        match format_id {
            Some(id) => format_for_id(id, self.config.date_order)
                .ok_or_else(|| ImportError::UnknownFormat(id.to_string()).into()),
            None => Ok(format_for_path(path, self.config.date_order)),
        }
    }

    /// Imports one export file. Only an unreadable source or an unusable
    /// archive directory fails the run; persistence and report failures are
    /// collected per record in the summary.
    pub async fn run(&self, path: &Path, format_id: Option<&str>) -> Result<ImportSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", %run_id, source = %path.display());
        self.run_inner(run_id, path, format_id).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        path: &Path,
        format_id: Option<&str>,
    ) -> Result<ImportSummary> {
        let started_at = Utc::now();
        let format = self.resolve_format(path, format_id)?;
        let bytes = fs::read(path)
            .await
            .map_err(|source| ImportError::SourceUnavailable {
                path: path.display().to_string(),
                source,
            })?;
        let text = String::from_utf8_lossy(&bytes);

        let batch_marker = if self.config.dry_run {
            ArtifactStore::sha256_hex(&bytes)[..12].to_string()
        } else {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("txt");
            let stored = self
                .archive
                .store_bytes(started_at, format.format_id(), ext, &bytes)
                .await
                .with_context(|| format!("archiving {}", path.display()))?;
            if stored.deduplicated {
                info!(hash = %stored.content_hash, "source was imported before");
            }
            stored.batch_marker().to_string()
        };
        let note = provenance_note(format.platform(), path, &batch_marker);

        // Stage: parse, filter, extract and resolve before touching storage.
        let mut messages_parsed = 0usize;
        let mut messages_skipped: BTreeMap<String, usize> = BTreeMap::new();
        let mut identities = IdentityAccumulator::new();
        let mut staged = Vec::new();
        for raw in format.messages(&text) {
            messages_parsed += 1;
            let property = match self.extractor.extract(&raw.text) {
                Extraction::Skipped { reason } => {
                    *messages_skipped.entry(reason.as_str().to_string()).or_default() += 1;
                    continue;
                }
                Extraction::NoProperty => None,
                Extraction::Property { property, .. } => Some(property),
            };
            let sender = self
                .resolver
                .canonicalize(&raw.sender_raw, raw.phone_hint.as_deref());
            identities.observe(&sender, raw.timestamp, &note);
            if property.is_some() {
                identities.record_property(&sender.phone);
            }
            staged.push(StagedMessage {
                raw,
                phone: sender.phone,
                property,
            });
        }
        if messages_parsed == 0 {
            warn!("no messages found in source");
        }
        for collision in identities.collisions() {
            warn!(
                phone = %collision.phone,
                kept = %collision.kept_name,
                other = %collision.other_name,
                "display names share a synthetic phone"
            );
        }

        let mut errors = Vec::new();
        let mut brokers_created = 0usize;
        let mut brokers_matched = 0usize;
        let mut broker_ids: HashMap<String, Uuid> = HashMap::new();
        for identity in identities.identities() {
            match reconcile_broker(self.gateway.as_ref(), identity).await {
                Ok((record, outcome)) => {
                    match outcome {
                        Reconciled::Created => brokers_created += 1,
                        Reconciled::Matched => brokers_matched += 1,
                    }
                    broker_ids.insert(identity.phone.clone(), record.id);
                }
                Err(err) => {
                    warn!(phone = %identity.phone, error = %err, "broker reconciliation failed");
                    errors.push(RecordError {
                        record: format!("broker {}", identity.phone),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut property_messages = 0usize;
        let mut properties_created = 0usize;
        let mut messages_persisted = 0usize;
        let mut reported = Vec::new();
        for message in staged {
            let line = message.raw.source_line;
            if message.property.is_some() {
                property_messages += 1;
            }
            let Some(&broker_id) = broker_ids.get(&message.phone) else {
                errors.push(RecordError {
                    record: format!("message line {line}"),
                    reason: format!("broker {} unavailable", message.phone),
                });
                continue;
            };

            let mut property_id = None;
            if let Some(details) = message.property.clone() {
                let new_property = NewProperty {
                    owner_id: broker_id,
                    owner_phone: message.phone.clone(),
                    status: PropertyStatus::Available,
                    date_posted: message.raw.timestamp,
                    extracted_from_message: true,
                    details,
                };
                match self.gateway.create_property(new_property).await {
                    Ok(record) => {
                        properties_created += 1;
                        property_id = Some(record.id);
                        reported.push(ReportedProperty {
                            line,
                            broker_phone: message.phone.clone(),
                            property_id: record.id,
                            property: record.details,
                        });
                        if let Err(err) = self.gateway.increment_broker_property_count(broker_id).await {
                            warn!(line, phone = %message.phone, error = %err, "property count not incremented");
                            errors.push(RecordError {
                                record: format!("broker {}", message.phone),
                                reason: err.to_string(),
                            });
                        }
                    }
                    Err(err) => {
                        warn!(line, phone = %message.phone, error = %err, "property create failed");
                        errors.push(RecordError {
                            record: format!("property line {line}"),
                            reason: err.to_string(),
                        });
                    }
                }
            }

            let raw = &message.raw;
            let new_message = NewMessage {
                broker_id,
                content: raw.text.clone(),
                message_date: raw.timestamp,
                message_time: raw.time_text.clone(),
                platform: format.platform(),
                platform_message_id: platform_message_id(raw.timestamp, &raw.sender_raw, &raw.text),
                message_type: if self.extractor.has_attachment(&raw.text) {
                    MessageType::Image
                } else {
                    MessageType::Text
                },
                language: detect_language(&raw.text).to_string(),
                contains_property_info: message.property.is_some(),
                extracted_property_id: property_id,
            };
            match self.gateway.create_message(new_message).await {
                Ok(_) => messages_persisted += 1,
                Err(err) => {
                    warn!(line, phone = %message.phone, error = %err, "message create failed");
                    errors.push(RecordError {
                        record: format!("message line {line}"),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut summary = ImportSummary {
            run_id,
            source: path.display().to_string(),
            format: format.format_id().to_string(),
            batch_marker,
            started_at,
            finished_at: Utc::now(),
            messages_parsed,
            messages_skipped,
            property_messages,
            brokers_resolved: identities.len(),
            brokers_created,
            brokers_matched,
            properties_created,
            messages_persisted,
            errors,
            collisions: identities.collisions().to_vec(),
            reports_dir: None,
        };

        if self.config.write_reports {
            match write_reports(&self.config.reports_dir, &summary, &reported).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => {
                    warn!(
                        dir = %self.config.reports_dir.display(),
                        error = %err,
                        "run reports not written"
                    );
                    summary.errors.push(RecordError {
                        record: "reports".to_string(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }

        info!(
            parsed = summary.messages_parsed,
            skipped = summary.skipped_total(),
            brokers = summary.brokers_resolved,
            properties = summary.properties_created,
            messages = summary.messages_persisted,
            errors = summary.errors.len(),
            "import finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crm_core::{
        BrokerRecord, BrokerUpdate, ListingType, MessageRecord, NewBroker, PropertyRecord,
        PropertyType,
    };
    use crm_storage::{GatewayError, GatewayResult, MemoryGateway};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ImportConfig {
        ImportConfig {
            reports_dir: dir.path().join("reports"),
            archive_dir: dir.path().join("artifacts"),
            ..ImportConfig::default()
        }
    }

    fn write_source(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    const CHAT: &str = "\
12/15/24, 10:30 AM - +201012345678: شقة للبيع في الحي 5 - 120 متر - 1.5 مليون
12/15/24, 10:45 AM - أبو محمد: صباح الخير
12/15/24, 11:00 AM - 201012345678: <Media omitted>
12/15/24, 6:10 PM - 201012345678: فيلا للإيجار المجاورة 3
مساحة 400 متر
12/15/24, 6:20 PM - +20 155 000 1111: ادفع بيتكوين واكسب ارباح يومية
";

    #[tokio::test]
    async fn scenario_transcript_persists_brokers_properties_and_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "chat.txt", CHAT);
        let gw = MemoryGateway::new();
        let pipeline = ImportPipeline::new(config(&dir), Arc::new(gw.clone())).unwrap();

        let summary = pipeline.run(&path, None).await.unwrap();
        assert_eq!(summary.format, "whatsapp");
        assert_eq!(summary.messages_parsed, 5);
        assert_eq!(summary.skipped_total(), 2);
        assert_eq!(summary.messages_skipped.get("media"), Some(&1));
        assert_eq!(summary.messages_skipped.get("spam"), Some(&1));
        assert_eq!(summary.property_messages, 2);
        assert_eq!(summary.brokers_created, 2);
        assert_eq!(summary.properties_created, 2);
        assert_eq!(summary.messages_persisted, 3);
        assert!(summary.errors.is_empty());

        let brokers = gw.brokers().await;
        assert_eq!(brokers.len(), 2);
        let broker = gw.find_broker_by_phone("201012345678").await.unwrap().unwrap();
        assert_eq!(broker.total_properties, 2);
        assert_eq!(broker.name, "سمسار 5678");
        assert_eq!(broker.last_activity.unwrap().format("%H:%M").to_string(), "18:10");
        let note = broker.notes.unwrap();
        assert!(note.starts_with("مستورد من مجموعة واتساب - chat.txt - "));
        assert!(note.ends_with(&summary.batch_marker));

        let properties = gw.properties().await;
        assert_eq!(properties[0].details.listing_type, ListingType::ForSale);
        assert_eq!(properties[0].details.price, Some(1_500_000.0));
        assert_eq!(properties[1].details.property_type, PropertyType::Villa);
        assert_eq!(properties[1].details.area, Some(400.0));

        let messages = gw.messages().await;
        assert_eq!(messages[0].extracted_property_id, Some(properties[0].id));
        assert!(messages[0].contains_property_info);
        assert_eq!(messages[0].language, "ar");
        assert_eq!(messages[0].message_time, "10:30 AM");
        assert_eq!(messages[1].extracted_property_id, None);
        assert_eq!(messages[1].platform_message_id.len(), 64);

        let reports = std::path::PathBuf::from(summary.reports_dir.unwrap());
        assert!(reports.join("import_summary.json").exists());
        assert!(reports.join("import_brief.md").exists());
        assert!(dir.path().join("artifacts").exists());
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate_brokers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "chat.txt", CHAT);
        let gw = MemoryGateway::new();
        let pipeline = ImportPipeline::new(config(&dir), Arc::new(gw.clone())).unwrap();

        let first = pipeline.run(&path, None).await.unwrap();
        let second = pipeline.run(&path, None).await.unwrap();
        assert_eq!(first.batch_marker, second.batch_marker);
        assert_eq!(second.brokers_created, 0);
        assert_eq!(second.brokers_matched, 2);
        assert_eq!(gw.brokers().await.len(), 2);
        // Messages and properties are not deduplicated across runs.
        assert_eq!(gw.messages().await.len(), 6);
        let broker = gw.find_broker_by_phone("201012345678").await.unwrap().unwrap();
        assert_eq!(broker.notes.unwrap().matches(" | ").count(), 0);
    }

    #[tokio::test]
    async fn missing_source_aborts_before_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let gw = MemoryGateway::new();
        let pipeline = ImportPipeline::new(config(&dir), Arc::new(gw.clone())).unwrap();

        let err = pipeline
            .run(&dir.path().join("missing.txt"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::SourceUnavailable { .. })
        ));
        assert!(gw.brokers().await.is_empty());
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "chat.txt", CHAT);
        let pipeline =
            ImportPipeline::new(config(&dir), Arc::new(MemoryGateway::new())).unwrap();
        let err = pipeline.run(&path, Some("telegram")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::UnknownFormat(_))
        ));
    }

    #[tokio::test]
    async fn empty_transcript_is_an_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "empty.txt", "nothing to see\n");
        let cfg = ImportConfig {
            write_reports: false,
            dry_run: true,
            ..config(&dir)
        };
        let summary = ImportPipeline::new(cfg, Arc::new(MemoryGateway::new()))
            .unwrap()
            .run(&path, None)
            .await
            .unwrap();
        assert_eq!(summary.messages_parsed, 0);
        assert_eq!(summary.brokers_resolved, 0);
        assert_eq!(summary.reports_dir, None);
        assert!(!dir.path().join("artifacts").exists());
    }

    #[tokio::test]
    async fn report_failure_still_returns_the_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "chat.txt", CHAT);
        let blocker = write_source(&dir, "reports-file", "not a directory");
        let cfg = ImportConfig {
            reports_dir: blocker,
            ..config(&dir)
        };
        let gw = MemoryGateway::new();
        let summary = ImportPipeline::new(cfg, Arc::new(gw.clone()))
            .unwrap()
            .run(&path, None)
            .await
            .unwrap();

        assert_eq!(summary.reports_dir, None);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].record, "reports");
        assert_eq!(summary.properties_created, 2);
        assert_eq!(gw.brokers().await.len(), 2);
        assert_eq!(gw.messages().await.len(), 3);
    }

    /// Fails property creation for villas; everything else passes through.
    struct FlakyGateway {
        inner: MemoryGateway,
    }

    #[async_trait]
    impl PersistenceGateway for FlakyGateway {
        async fn find_broker_by_phone(&self, phone: &str) -> GatewayResult<Option<BrokerRecord>> {
            self.inner.find_broker_by_phone(phone).await
        }
        async fn create_broker(&self, broker: NewBroker) -> GatewayResult<BrokerRecord> {
            self.inner.create_broker(broker).await
        }
        async fn update_broker(&self, phone: &str, update: BrokerUpdate) -> GatewayResult<BrokerRecord> {
            self.inner.update_broker(phone, update).await
        }
        async fn create_property(&self, property: NewProperty) -> GatewayResult<PropertyRecord> {
            if property.details.property_type == PropertyType::Villa {
                return Err(GatewayError::Backend(anyhow::anyhow!("connection reset")));
            }
            self.inner.create_property(property).await
        }
        async fn create_message(&self, message: NewMessage) -> GatewayResult<MessageRecord> {
            self.inner.create_message(message).await
        }
        async fn increment_broker_property_count(&self, broker_id: Uuid) -> GatewayResult<()> {
            self.inner.increment_broker_property_count(broker_id).await
        }
    }

    #[tokio::test]
    async fn persistence_failures_are_isolated_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "chat.txt", CHAT);
        let inner = MemoryGateway::new();
        let gw = FlakyGateway {
            inner: inner.clone(),
        };
        let summary = ImportPipeline::new(config(&dir), Arc::new(gw))
            .unwrap()
            .run(&path, None)
            .await
            .unwrap();

        assert_eq!(summary.properties_created, 1);
        assert_eq!(summary.messages_persisted, 3);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].record, "property line 4");
        assert!(summary.errors[0].reason.contains("connection reset"));

        let messages = inner.messages().await;
        assert!(messages[2].contains_property_info);
        assert_eq!(messages[2].extracted_property_id, None);
    }

    /// Lookup never sees the row, so every create after the first conflicts.
    struct StaleLookupGateway {
        inner: MemoryGateway,
    }

    #[async_trait]
    impl PersistenceGateway for StaleLookupGateway {
        async fn find_broker_by_phone(&self, _phone: &str) -> GatewayResult<Option<BrokerRecord>> {
            Ok(None)
        }
        async fn create_broker(&self, broker: NewBroker) -> GatewayResult<BrokerRecord> {
            self.inner.create_broker(broker).await
        }
        async fn update_broker(&self, phone: &str, update: BrokerUpdate) -> GatewayResult<BrokerRecord> {
            self.inner.update_broker(phone, update).await
        }
        async fn create_property(&self, property: NewProperty) -> GatewayResult<PropertyRecord> {
            self.inner.create_property(property).await
        }
        async fn create_message(&self, message: NewMessage) -> GatewayResult<MessageRecord> {
            self.inner.create_message(message).await
        }
        async fn increment_broker_property_count(&self, broker_id: Uuid) -> GatewayResult<()> {
            self.inner.increment_broker_property_count(broker_id).await
        }
    }

    #[tokio::test]
    async fn duplicate_broker_conflict_counts_as_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(&dir, "chat.txt", CHAT);
        let inner = MemoryGateway::new();
        let pipeline = ImportPipeline::new(
            config(&dir),
            Arc::new(StaleLookupGateway {
                inner: inner.clone(),
            }),
        )
        .unwrap();

        pipeline.run(&path, None).await.unwrap();
        let second = pipeline.run(&path, None).await.unwrap();
        assert!(second.errors.is_empty());
        assert_eq!(second.brokers_matched, 2);
        assert_eq!(inner.brokers().await.len(), 2);
    }

    #[tokio::test]
    async fn csv_rows_use_phone_column_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_source(
            &dir,
            "brokers.csv",
            "date,time,name,description,phone\n12/16/24,9:00 AM,أبو محمد,فيلا, 300 متر, 5 مليون,01011112222\n",
        );
        let gw = MemoryGateway::new();
        let summary = ImportPipeline::new(config(&dir), Arc::new(gw.clone()))
            .unwrap()
            .run(&path, None)
            .await
            .unwrap();
        assert_eq!(summary.format, "csv");
        let broker = gw.find_broker_by_phone("201011112222").await.unwrap().unwrap();
        assert_eq!(broker.name, "أبو محمد");
        assert!(broker.notes.unwrap().starts_with("مستورد من ملف CSV - brokers.csv"));
        let property = &gw.properties().await[0];
        assert_eq!(property.details.price, Some(5_000_000.0));
        assert_eq!(gw.messages().await[0].platform, Platform::Csv);
    }

    #[test]
    fn message_fingerprint_is_stable() {
        let at = chrono::NaiveDate::from_ymd_opt(2024, 12, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(
            platform_message_id(at, "+201012345678", "شقة"),
            platform_message_id(at, "+201012345678", "شقة")
        );
        assert_ne!(
            platform_message_id(at, "+201012345678", "شقة"),
            platform_message_id(at, "+201012345678", "فيلا")
        );
    }
}
