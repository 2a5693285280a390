//! Per-run report files under `<reports_dir>/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crm_core::ExtractedProperty;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::pipeline::ImportSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ReportedProperty {
    pub line: usize,
    pub broker_phone: String,
    pub property_id: Uuid,
    pub property: ExtractedProperty,
}

fn format_price(property: &ExtractedProperty) -> String {
    match property.price {
        Some(price) => format!("{price:.0} {}", property.currency),
        None => "-".to_string(),
    }
}

pub fn render_brief(summary: &ImportSummary, properties: &[ReportedProperty]) -> String {
    let skipped = if summary.messages_skipped.is_empty() {
        "- none".to_string()
    } else {
        summary
            .messages_skipped
            .iter()
            .map(|(reason, count)| format!("- {reason}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let errors = if summary.errors.is_empty() {
        "- none".to_string()
    } else {
        summary
            .errors
            .iter()
            .map(|e| format!("- {}: {}", e.record, e.reason))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let listings = properties
        .iter()
        .map(|p| {
            format!(
                "| {} | {} | {} | {} | {} |",
                p.line,
                p.broker_phone,
                p.property.listing_type,
                p.property.property_type,
                format_price(&p.property)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Import Brief\n\n- Run ID: `{}`\n- Source: {} ({})\n- Batch: `{}`\n- Started: {}\n- Finished: {}\n\n\
         ## Counts\n- Messages parsed: {}\n- Property messages: {}\n- Brokers: {} ({} created, {} matched)\n\
         - Properties created: {}\n- Messages persisted: {}\n- Identity collisions: {}\n\n\
         ## Skipped\n{}\n\n## Errors\n{}\n\n## Listings\n| Line | Broker | Listing | Type | Price |\n|---|---|---|---|---|\n{}\n",
        summary.run_id,
        summary.source,
        summary.format,
        summary.batch_marker,
        summary.started_at,
        summary.finished_at,
        summary.messages_parsed,
        summary.property_messages,
        summary.brokers_resolved,
        summary.brokers_created,
        summary.brokers_matched,
        summary.properties_created,
        summary.messages_persisted,
        summary.collisions.len(),
        skipped,
        errors,
        listings,
    )
}

/// Writes `import_summary.json` and `import_brief.md`; returns the run directory.
pub async fn write_reports(
    reports_root: &Path,
    summary: &ImportSummary,
    properties: &[ReportedProperty],
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("import_brief.md"), render_brief(summary, properties))
        .await
        .context("writing import_brief.md")?;

    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "properties": properties,
    }))
    .context("serializing import summary")?;
    fs::write(reports_dir.join("import_summary.json"), json)
        .await
        .context("writing import_summary.json")?;

    Ok(reports_dir)
}
