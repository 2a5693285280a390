//! Source format adapters + heuristic listing extraction.

use std::path::Path;

use crm_core::{Platform, RawMessage};

pub mod csv;
pub mod extract;
pub mod rules;
pub mod transcript;

pub use csv::{parse_csv_export, CsvMessages};
pub use extract::{detect_language, Extraction, Extractor, Magnitude, PropertyCue, SkipReason};
pub use rules::{ExtractionRules, FeatureRule, RulesError};
pub use transcript::{parse_clock, parse_transcript, ChatMessages, DateOrder};

pub const CRATE_NAME: &str = "crm-ingest";

/// A textual export format that can be split into [`RawMessage`]s.
///
/// Implementations return a lazy iterator over the input; calling
/// `messages` again restarts from the first record.
pub trait SourceFormat: Send + Sync {
    fn format_id(&self) -> &'static str;
    fn platform(&self) -> Platform;
    fn messages<'a>(&self, input: &'a str) -> Box<dyn Iterator<Item = RawMessage> + 'a>;
}

#[derive(Debug, Clone, Copy)]
struct WhatsappTranscriptFormat {
    date_order: DateOrder,
}

#[derive(Debug, Clone, Copy)]
struct CsvExportFormat {
    date_order: DateOrder,
}

impl SourceFormat for WhatsappTranscriptFormat {
    fn format_id(&self) -> &'static str {
        "whatsapp"
    }

    fn platform(&self) -> Platform {
        Platform::Whatsapp
    }

    fn messages<'a>(&self, input: &'a str) -> Box<dyn Iterator<Item = RawMessage> + 'a> {
        Box::new(parse_transcript(input, self.date_order))
    }
}

impl SourceFormat for CsvExportFormat {
    fn format_id(&self) -> &'static str {
        "csv"
    }

    fn platform(&self) -> Platform {
        Platform::Csv
    }

    fn messages<'a>(&self, input: &'a str) -> Box<dyn Iterator<Item = RawMessage> + 'a> {
        Box::new(parse_csv_export(input, self.date_order))
    }
}

pub fn whatsapp_format(date_order: DateOrder) -> impl SourceFormat {
    WhatsappTranscriptFormat { date_order }
}

pub fn csv_format(date_order: DateOrder) -> impl SourceFormat {
    CsvExportFormat { date_order }
}

pub fn format_for_id(format_id: &str, date_order: DateOrder) -> Option<Box<dyn SourceFormat>> {
    match format_id {
        "whatsapp" | "chat" | "txt" => Some(Box::new(WhatsappTranscriptFormat { date_order })),
        "csv" => Some(Box::new(CsvExportFormat { date_order })),
        _ => None,
    }
}

/// Picks a format from the file extension; anything that is not `.csv` is
/// read as a chat transcript.
pub fn format_for_path(path: impl AsRef<Path>, date_order: DateOrder) -> Box<dyn SourceFormat> {
    let is_csv = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if is_csv {
        Box::new(CsvExportFormat { date_order })
    } else {
        Box::new(WhatsappTranscriptFormat { date_order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_registry_resolves_by_id_and_extension() {
        assert_eq!(
            format_for_id("csv", DateOrder::MonthFirst).unwrap().format_id(),
            "csv"
        );
        assert_eq!(
            format_for_id("whatsapp", DateOrder::MonthFirst).unwrap().platform(),
            Platform::Whatsapp
        );
        assert!(format_for_id("telegram", DateOrder::MonthFirst).is_none());

        assert_eq!(
            format_for_path("exports/Chat.CSV", DateOrder::MonthFirst).format_id(),
            "csv"
        );
        assert_eq!(
            format_for_path("WhatsApp Chat with الحي العاشر.txt", DateOrder::MonthFirst).format_id(),
            "whatsapp"
        );
    }

    #[test]
    fn trait_objects_restart_from_the_first_record() {
        let input = "1/2/24, 9:00 AM - +201000000001: أ\n1/2/24, 9:05 AM - +201000000002: ب\n";
        let format = whatsapp_format(DateOrder::MonthFirst);
        assert_eq!(format.messages(input).count(), 2);
        assert_eq!(format.messages(input).count(), 2);
    }
}
