//! Flat `date,time,name,description,phone` exports.

use std::iter::Enumerate;
use std::str::Lines;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use crm_core::RawMessage;
use tracing::warn;

use crate::transcript::{parse_clock, DateOrder};

/// Sentinel some exporters write for a missing description.
const NULL_SENTINEL: &str = "null";

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Whether a line leaves a quoted field open. Escaped `""` pairs cancel out.
fn toggles_quotes(line: &str) -> bool {
    line.matches('"').count() % 2 == 1
}

fn is_header_row(fields: &[String]) -> bool {
    fields
        .first()
        .map(|f| f.trim().eq_ignore_ascii_case("date"))
        .unwrap_or(false)
}

fn parse_row_date(text: &str, date_order: DateOrder) -> Option<NaiveDate> {
    let text = text.trim();
    if text.contains('/') {
        return date_order.parse_slash_date(text);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

fn null_to_empty(value: &str) -> String {
    let value = value.trim();
    if value.eq_ignore_ascii_case(NULL_SENTINEL) {
        String::new()
    } else {
        value.to_string()
    }
}

/// Lazy iterator over the rows of a CSV export.
#[derive(Debug, Clone)]
pub struct CsvMessages<'a> {
    lines: Enumerate<Lines<'a>>,
    date_order: DateOrder,
}

impl<'a> CsvMessages<'a> {
    /// Next logical record with its starting line number. Quoted fields may
    /// span physical lines; the line breaks stay in the field.
    fn next_record(&mut self) -> Option<(usize, String)> {
        let (idx, first) = self.lines.next()?;
        let mut record = first.to_string();
        let mut in_quotes = toggles_quotes(first);
        while in_quotes {
            let Some((_, line)) = self.lines.next() else {
                warn!(row = idx + 1, "csv record ends inside an open quote");
                break;
            };
            record.push('\n');
            record.push_str(line);
            in_quotes ^= toggles_quotes(line);
        }
        Some((idx + 1, record))
    }

    fn row_to_message(&self, fields: Vec<String>, row_no: usize) -> Option<RawMessage> {
        if fields.len() < 4 {
            warn!(row = row_no, columns = fields.len(), "csv row skipped: too few columns");
            return None;
        }
        let name = null_to_empty(&fields[2]);
        let phone = if fields.len() >= 5 {
            Some(null_to_empty(&fields[fields.len() - 1])).filter(|p| !p.is_empty())
        } else {
            None
        };
        if name.is_empty() && phone.is_none() {
            return None;
        }
        // Unquoted commas inside the description spill into extra columns.
        let description_end = if fields.len() >= 5 { fields.len() - 1 } else { fields.len() };
        let description = null_to_empty(&fields[3..description_end].join(","));

        let date_text = fields[0].trim().to_string();
        let time_text = fields[1].trim().to_string();
        let Some(date) = parse_row_date(&date_text, self.date_order) else {
            warn!(row = row_no, date = %date_text, "csv row skipped: unparseable date");
            return None;
        };
        let time = parse_clock(&time_text).unwrap_or(NaiveTime::MIN);

        Some(RawMessage {
            timestamp: NaiveDateTime::new(date, time),
            date_text,
            time_text,
            sender_raw: if name.is_empty() { phone.clone().unwrap_or_default() } else { name },
            phone_hint: phone,
            text: description,
            source_line: row_no,
        })
    }
}

impl<'a> Iterator for CsvMessages<'a> {
    type Item = RawMessage;

    fn next(&mut self) -> Option<RawMessage> {
        while let Some((row_no, record)) = self.next_record() {
            let record = record.trim_start_matches('\u{feff}');
            if record.trim().is_empty() {
                continue;
            }
            let fields = split_row(record);
            if is_header_row(&fields) {
                continue;
            }
            if let Some(message) = self.row_to_message(fields, row_no) {
                return Some(message);
            }
        }
        None
    }
}

pub fn parse_csv_export(input: &str, date_order: DateOrder) -> CsvMessages<'_> {
    CsvMessages {
        lines: input.lines().enumerate(),
        date_order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Vec<RawMessage> {
        parse_csv_export(input, DateOrder::MonthFirst).collect()
    }

    #[test]
    fn reads_rows_after_header() {
        let input = "\
Date,Time,Name,Description,Phone
12/15/24,10:30 AM,أبو محمد,شقة للبيع في الحي 5,01012345678
12/15/24,11:00 AM,Sara,null,+201099998888
";
        let rows = parse(input);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sender_raw, "أبو محمد");
        assert_eq!(rows[0].phone_hint.as_deref(), Some("01012345678"));
        assert_eq!(rows[0].text, "شقة للبيع في الحي 5");
        assert_eq!(rows[0].source_line, 2);
        assert_eq!(rows[1].text, "");
        assert_eq!(
            rows[1].timestamp,
            NaiveDate::from_ymd_opt(2024, 12, 15)
                .unwrap()
                .and_hms_opt(11, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn description_commas_are_preserved() {
        let rows = parse("1/2/24,9:00 AM,Ali,فيلا, 300 متر, 5 مليون,01011112222\n");
        assert_eq!(rows[0].text, "فيلا, 300 متر, 5 مليون");
        assert_eq!(rows[0].phone_hint.as_deref(), Some("01011112222"));

        let quoted = parse("1/2/24,9:00 AM,Ali,\"محل, ناصية \"\"مميز\"\"\",01011112222\n");
        assert_eq!(quoted[0].text, "محل, ناصية \"مميز\"");
    }

    #[test]
    fn quoted_description_may_span_lines() {
        let input = "\
Date,Time,Name,Description,Phone
12/16/24,9:10 AM,Ali,\"شقة للبيع
120 متر\",01098765432
12/16/24,9:20 AM,Sara,محل للإيجار,01011112222
";
        let rows = parse(input);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text, "شقة للبيع\n120 متر");
        assert_eq!(rows[0].phone_hint.as_deref(), Some("01098765432"));
        assert_eq!(rows[0].source_line, 2);
        assert_eq!(rows[1].sender_raw, "Sara");
        assert_eq!(rows[1].source_line, 4);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let input = "\
garbage
13/45/24,9:00 AM,Ali,text,0100
1/2/24,9:00 AM,null,text,null
2024-01-03,,Omar,أرض للبيع
";
        let rows = parse(input);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sender_raw, "Omar");
        assert_eq!(rows[0].phone_hint, None);
        assert_eq!(rows[0].timestamp.time(), NaiveTime::MIN);
    }
}
