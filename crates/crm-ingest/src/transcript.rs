//! Chat export transcript parsing.
//!
//! Each message starts with a header line `<date>, <time> - <sender>: <text>`;
//! any other non-blank line continues the previous message. Header lines
//! without a `sender:` part are group events (member added, encryption
//! notice, ...) and close the message in progress without being emitted.

use std::iter::Enumerate;
use std::str::Lines;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use crm_core::RawMessage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the two leading numbers of a slash date are read.
///
/// Exports are locale dependent; the default is month/day/year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    #[default]
    MonthFirst,
    DayFirst,
}

impl DateOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mdy" | "month_first" | "us" => Some(DateOrder::MonthFirst),
            "dmy" | "day_first" | "eu" => Some(DateOrder::DayFirst),
            _ => None,
        }
    }

    /// Two-digit years are taken as 20YY.
    pub fn resolve(self, first: u32, second: u32, year: i32) -> Option<NaiveDate> {
        let year = if year < 100 { year + 2000 } else { year };
        let (month, day) = match self {
            DateOrder::MonthFirst => (first, second),
            DateOrder::DayFirst => (second, first),
        };
        NaiveDate::from_ymd_opt(year, month, day)
    }

    /// Parses `a/b/yy` or `a/b/yyyy`.
    pub fn parse_slash_date(self, text: &str) -> Option<NaiveDate> {
        let mut parts = text.trim().split('/');
        let first = parts.next()?.trim().parse().ok()?;
        let second = parts.next()?.trim().parse().ok()?;
        let year = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        self.resolve(first, second, year)
    }
}

fn header_regex() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(
            r"^(\d{1,2}/\d{1,2}/\d{2,4}),?\s+(\d{1,2}:\d{2}(?::\d{2})?(?:\s?[AaPp]\.?[Mm]\.?)?)\s+-\s+(.*)$",
        )
        .expect("static header pattern")
    })
}

fn sender_regex() -> &'static Regex {
    static SENDER: OnceLock<Regex> = OnceLock::new();
    SENDER.get_or_init(|| Regex::new(r"^([^:]+):\s*(.*)$").expect("static sender pattern"))
}

/// Parses a printed clock time in 12- or 24-hour form.
pub fn parse_clock(text: &str) -> Option<NaiveTime> {
    let mut cleaned = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
        .replace('.', "");
    if (cleaned.ends_with("AM") || cleaned.ends_with("PM")) && !cleaned.contains(' ') {
        let split_at = cleaned.len() - 2;
        cleaned.insert(split_at, ' ');
    }
    ["%I:%M %p", "%I:%M:%S %p", "%H:%M", "%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&cleaned, fmt).ok())
}

fn strip_marks(line: &str) -> &str {
    line.trim_start_matches(|c: char| matches!(c, '\u{feff}' | '\u{200e}' | '\u{200f}'))
}

enum LineKind<'a> {
    Header(RawMessage),
    SystemEvent,
    Body(&'a str),
}

fn classify_line(line: &str, line_no: usize, date_order: DateOrder) -> LineKind<'_> {
    let line = strip_marks(line);
    let Some(caps) = header_regex().captures(line) else {
        return LineKind::Body(line.trim());
    };
    let date_text = &caps[1];
    let time_text = caps[2].trim();
    let (Some(date), Some(time)) = (date_order.parse_slash_date(date_text), parse_clock(time_text))
    else {
        debug!(line = line_no, "header-like line with invalid date/time kept as body text");
        return LineKind::Body(line.trim());
    };

    let rest = &caps[3];
    let Some(sender_caps) = sender_regex().captures(rest) else {
        debug!(line = line_no, "group event line dropped");
        return LineKind::SystemEvent;
    };

    LineKind::Header(RawMessage {
        timestamp: NaiveDateTime::new(date, time),
        date_text: date_text.to_string(),
        time_text: time_text.to_string(),
        sender_raw: sender_caps[1].trim().to_string(),
        phone_hint: None,
        text: sender_caps[2].trim().to_string(),
        source_line: line_no,
    })
}

/// Lazy iterator over the messages of one transcript, in transcript order.
#[derive(Debug, Clone)]
pub struct ChatMessages<'a> {
    lines: Enumerate<Lines<'a>>,
    current: Option<RawMessage>,
    date_order: DateOrder,
}

impl<'a> Iterator for ChatMessages<'a> {
    type Item = RawMessage;

    fn next(&mut self) -> Option<RawMessage> {
        for (idx, line) in self.lines.by_ref() {
            match classify_line(line, idx + 1, self.date_order) {
                LineKind::Header(message) => {
                    if let Some(done) = self.current.replace(message) {
                        return Some(done);
                    }
                }
                LineKind::SystemEvent => {
                    if let Some(done) = self.current.take() {
                        return Some(done);
                    }
                }
                LineKind::Body(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if let Some(current) = self.current.as_mut() {
                        current.text.push('\n');
                        current.text.push_str(text);
                    }
                }
            }
        }
        self.current.take()
    }
}

/// Splits a chat export into messages. Lines before the first header are
/// ignored; input without any header yields nothing.
pub fn parse_transcript(input: &str, date_order: DateOrder) -> ChatMessages<'_> {
    ChatMessages {
        lines: input.lines().enumerate(),
        current: None,
        date_order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Vec<RawMessage> {
        parse_transcript(input, DateOrder::MonthFirst).collect()
    }

    #[test]
    fn header_lines_map_one_to_one_in_order() {
        let input = "\
12/15/24, 10:30 AM - +20 10 1234 5678: أول
12/15/24, 10:31 AM - +20 11 1111 2222: ثاني
12/16/24, 1:05 PM - أحمد السمسار: ثالث
";
        let messages = parse(input);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text, "أول");
        assert_eq!(messages[0].sender_raw, "+20 10 1234 5678");
        assert_eq!(messages[2].sender_raw, "أحمد السمسار");
        assert_eq!(messages[2].source_line, 3);
        assert_eq!(
            messages[2].timestamp,
            NaiveDate::from_ymd_opt(2024, 12, 16)
                .unwrap()
                .and_hms_opt(13, 5, 0)
                .unwrap()
        );
        assert_eq!(messages[2].time_text, "1:05 PM");
    }

    #[test]
    fn continuation_lines_join_with_newlines() {
        let input = "\
12/15/24, 10:30 AM - +201012345678: شقة للبيع
مساحة 120 متر

الدور الثالث
12/15/24, 10:40 AM - +201012345678: تم
";
        let messages = parse(input);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "شقة للبيع\nمساحة 120 متر\nالدور الثالث");
    }

    #[test]
    fn empty_header_text_keeps_newline_before_continuations() {
        let input = "\
12/15/24, 10:30 AM - +201012345678:
شقة للبيع
120 متر
";
        let messages = parse(input);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "\nشقة للبيع\n120 متر");
    }

    #[test]
    fn no_headers_yields_empty_sequence() {
        assert!(parse("").is_empty());
        assert!(parse("just some text\nwithout headers\n").is_empty());
    }

    #[test]
    fn preamble_before_first_header_is_dropped() {
        let messages = parse("exported chat\n1/2/24, 9:00 AM - +201000000001: نص\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "نص");
    }

    #[test]
    fn group_events_close_the_open_message() {
        let input = "\
1/2/24, 9:00 AM - +201000000001: شقة للبيع
1/2/24, 9:01 AM - +201000000002 added +201000000003
this line has no open message
1/2/24, 9:02 AM - +201000000003: سلام
";
        let messages = parse(input);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "شقة للبيع");
        assert_eq!(messages[1].text, "سلام");
    }

    #[test]
    fn tolerates_narrow_spaces_marks_and_24h_clock() {
        let input = "\u{200e}3/4/24, 9:15\u{202f}PM - +201000000001: a\n3/4/24, 21:20 - +201000000001: b\r\n";
        let messages = parse(input);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].timestamp.time(), NaiveTime::from_hms_opt(21, 15, 0).unwrap());
        assert_eq!(messages[1].timestamp.time(), NaiveTime::from_hms_opt(21, 20, 0).unwrap());
        assert_eq!(messages[1].text, "b");
    }

    #[test]
    fn date_order_is_configurable() {
        let input = "3/4/24, 9:00 AM - +201000000001: x\n";
        let mdy = parse_transcript(input, DateOrder::MonthFirst).next().unwrap();
        let dmy = parse_transcript(input, DateOrder::DayFirst).next().unwrap();
        assert_eq!(mdy.timestamp.date(), NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(dmy.timestamp.date(), NaiveDate::from_ymd_opt(2024, 4, 3).unwrap());
    }

    #[test]
    fn impossible_dates_are_treated_as_body_text() {
        let input = "1/2/24, 9:00 AM - +201000000001: a\n13/40/24, 9:00 AM - +201000000001: b\n";
        let messages = parse(input);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.ends_with("13/40/24, 9:00 AM - +201000000001: b"));
    }

    #[test]
    fn clock_parsing_variants() {
        assert_eq!(parse_clock("10:30 AM"), NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(parse_clock("10:30pm"), NaiveTime::from_hms_opt(22, 30, 0));
        assert_eq!(parse_clock("12:05 a.m."), NaiveTime::from_hms_opt(0, 5, 0));
        assert_eq!(parse_clock("18:45:10"), NaiveTime::from_hms_opt(18, 45, 10));
        assert_eq!(parse_clock("noon"), None);
        assert_eq!(DateOrder::parse("DMY"), Some(DateOrder::DayFirst));
    }
}
