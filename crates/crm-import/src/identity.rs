//! Sender canonicalization and per-run broker accumulation.
//!
//! The canonical phone is the only broker key. Senders that carry no
//! recoverable number get a synthetic phone derived from their display name,
//! so two different people with the same display name share one identity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use crm_core::{BrokerIdentity, BrokerRecord, BrokerUpdate, NewBroker};
use crm_storage::{GatewayError, PersistenceGateway};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Significant digits of a local mobile number, without trunk prefix.
const NATIONAL_DIGITS: usize = 10;
const INTERNATIONAL_DIGITS: std::ops::RangeInclusive<usize> = 8..=15;
const PLACEHOLDER_NAME: &str = "سمسار";

fn embedded_phone_regex() -> &'static Regex {
    static EMBEDDED: OnceLock<Regex> = OnceLock::new();
    EMBEDDED.get_or_init(|| {
        Regex::new(r"\+?\d[\d\s\u{a0}\u{202f}\-()]{6,}\d").expect("static phone pattern")
    })
}

fn compact(raw: &str) -> String {
    raw.chars()
        .filter(|&c| {
            !(c.is_whitespace()
                || matches!(c, '-' | '(' | ')' | '.' | '\u{200e}' | '\u{200f}' | '\u{202a}'..='\u{202e}'))
        })
        .collect()
}

/// Result of canonicalizing one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSender {
    pub phone: String,
    pub name: String,
    pub synthetic_phone: bool,
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    country_code: String,
}

impl IdentityResolver {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
        }
    }

    /// Canonical phone for a compacted, digits-only candidate.
    fn phone_from_digits(&self, candidate: &str) -> Option<String> {
        let cc = self.country_code.as_str();
        let (mut international, mut digits) = match candidate.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, candidate),
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if let Some(rest) = digits.strip_prefix("00") {
            international = true;
            digits = rest;
        }

        let full_len = cc.len() + NATIONAL_DIGITS;
        let doubled = format!("{cc}{cc}");
        if digits.len() == full_len + cc.len() && digits.starts_with(&doubled) {
            return Some(digits[cc.len()..].to_string());
        }
        if digits.len() == full_len && digits.starts_with(cc) {
            return Some(digits.to_string());
        }
        if digits.len() == NATIONAL_DIGITS + 1 && digits.starts_with('0') {
            return Some(format!("{cc}{}", &digits[1..]));
        }
        if digits.len() == NATIONAL_DIGITS && !digits.starts_with('0') && !international {
            return Some(format!("{cc}{digits}"));
        }
        if international && INTERNATIONAL_DIGITS.contains(&digits.len()) {
            return Some(digits.to_string());
        }
        None
    }

    fn placeholder_name(phone: &str) -> String {
        let tail = &phone[phone.len().saturating_sub(4)..];
        format!("{PLACEHOLDER_NAME} {tail}")
    }

    /// Phone found inside a longer string, plus what remains as a name.
    fn embedded(&self, raw: &str) -> Option<(String, String)> {
        embedded_phone_regex().find_iter(raw).find_map(|m| {
            let phone = self.phone_from_digits(&compact(m.as_str()))?;
            let rest = format!("{}{}", &raw[..m.start()], &raw[m.end()..]);
            let name = rest
                .trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | ':' | '|' | ',' | '~'))
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            Some((phone, name))
        })
    }

    fn synthetic_phone(&self, name: &str) -> String {
        let key = name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let n = u64::from_be_bytes(prefix) % 1_000_000_000;
        // Trunk digit 0 never starts a real mobile number.
        format!("{}0{n:09}", self.country_code)
    }

    pub fn canonicalize(&self, sender_raw: &str, phone_hint: Option<&str>) -> CanonicalSender {
        let raw = sender_raw.trim();

        if let Some(hint) = phone_hint.map(str::trim).filter(|h| !h.is_empty()) {
            let phone = self
                .phone_from_digits(&compact(hint))
                .or_else(|| self.embedded(hint).map(|(phone, _)| phone));
            if let Some(phone) = phone {
                let name = if raw.is_empty() || self.phone_from_digits(&compact(raw)).is_some() {
                    Self::placeholder_name(&phone)
                } else {
                    raw.to_string()
                };
                return CanonicalSender {
                    phone,
                    name,
                    synthetic_phone: false,
                };
            }
        }

        if let Some(phone) = self.phone_from_digits(&compact(raw)) {
            let name = Self::placeholder_name(&phone);
            return CanonicalSender {
                phone,
                name,
                synthetic_phone: false,
            };
        }

        if let Some((phone, name)) = self.embedded(raw) {
            let name = if name.is_empty() {
                Self::placeholder_name(&phone)
            } else {
                name
            };
            return CanonicalSender {
                phone,
                name,
                synthetic_phone: false,
            };
        }

        CanonicalSender {
            phone: self.synthetic_phone(raw),
            name: raw.to_string(),
            synthetic_phone: true,
        }
    }
}

/// Two different display names hashed to the same synthetic phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityCollision {
    pub phone: String,
    pub kept_name: String,
    pub other_name: String,
}

/// Phone-keyed identities seen during one run.
#[derive(Debug, Default)]
pub struct IdentityAccumulator {
    identities: BTreeMap<String, BrokerIdentity>,
    collisions: Vec<IdentityCollision>,
    reported: BTreeSet<(String, String)>,
}

impl IdentityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting. The first name wins; activity keeps the latest
    /// timestamp; notes are appended once each.
    pub fn observe(&mut self, sender: &CanonicalSender, seen_at: NaiveDateTime, note: &str) {
        let identity = self
            .identities
            .entry(sender.phone.clone())
            .or_insert_with(|| BrokerIdentity {
                phone: sender.phone.clone(),
                name: sender.name.clone(),
                last_activity: seen_at,
                total_properties: 0,
                notes: Vec::new(),
                synthetic_phone: sender.synthetic_phone,
            });

        identity.last_activity = identity.last_activity.max(seen_at);
        if !note.is_empty() && !identity.notes.iter().any(|n| n == note) {
            identity.notes.push(note.to_string());
        }

        if sender.synthetic_phone && identity.name != sender.name {
            let key = (sender.phone.clone(), sender.name.clone());
            if self.reported.insert(key) {
                debug!(phone = %sender.phone, "synthetic phone shared by different names");
                self.collisions.push(IdentityCollision {
                    phone: sender.phone.clone(),
                    kept_name: identity.name.clone(),
                    other_name: sender.name.clone(),
                });
            }
        }
    }

    pub fn record_property(&mut self, phone: &str) {
        if let Some(identity) = self.identities.get_mut(phone) {
            identity.total_properties += 1;
        }
    }

    pub fn get(&self, phone: &str) -> Option<&BrokerIdentity> {
        self.identities.get(phone)
    }

    /// Identities in phone order.
    pub fn identities(&self) -> impl Iterator<Item = &BrokerIdentity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn collisions(&self) -> &[IdentityCollision] {
        &self.collisions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciled {
    Created,
    Matched,
}

/// Creates the broker or, when it already exists, raises its activity and
/// appends the run's notes. Name and counters of an existing broker are
/// never touched.
pub async fn reconcile_broker(
    gateway: &dyn PersistenceGateway,
    identity: &BrokerIdentity,
) -> Result<(BrokerRecord, Reconciled), GatewayError> {
    let update = || BrokerUpdate {
        last_activity: Some(identity.last_activity),
        append_note: identity.notes_text(),
    };

    if gateway.find_broker_by_phone(&identity.phone).await?.is_some() {
        let record = gateway.update_broker(&identity.phone, update()).await?;
        return Ok((record, Reconciled::Matched));
    }

    match gateway.create_broker(NewBroker::from_identity(identity)).await {
        Ok(record) => Ok((record, Reconciled::Created)),
        Err(GatewayError::Conflict { phone }) => {
            debug!(%phone, "broker created concurrently; treating as existing");
            let record = gateway.update_broker(&identity.phone, update()).await?;
            Ok((record, Reconciled::Matched))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crm_storage::MemoryGateway;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new("20")
    }

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 12, 15)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn phone_spellings_share_one_canonical_key() {
        let r = resolver();
        for raw in [
            "+201012345678",
            "201012345678",
            "+20 10 1234 5678",
            "01012345678",
            "010-1234-5678",
            "00201012345678",
            "20201012345678",
            "1012345678",
            "\u{200e}+20 101 234 5678",
        ] {
            let sender = r.canonicalize(raw, None);
            assert_eq!(sender.phone, "201012345678", "{raw}");
            assert_eq!(sender.name, "سمسار 5678");
            assert!(!sender.synthetic_phone);
        }
    }

    #[test]
    fn canonicalization_is_deterministic() {
        let r = resolver();
        for raw in ["+201012345678", "أبو أحمد", "Ahmed 01099998888"] {
            assert_eq!(r.canonicalize(raw, None), r.canonicalize(raw, None));
        }
    }

    #[test]
    fn phone_embedded_in_name_is_extracted() {
        let sender = resolver().canonicalize("أحمد العقارات 0101 234 5678", None);
        assert_eq!(sender.phone, "201012345678");
        assert_eq!(sender.name, "أحمد العقارات");

        let sender = resolver().canonicalize("+20 100 111 2222 - Omar", None);
        assert_eq!(sender.phone, "201001112222");
        assert_eq!(sender.name, "Omar");
    }

    #[test]
    fn foreign_numbers_keep_their_country_code() {
        let sender = resolver().canonicalize("+966 50 123 4567", None);
        assert_eq!(sender.phone, "966501234567");
        assert!(!sender.synthetic_phone);
    }

    #[test]
    fn names_without_numbers_get_synthetic_phones() {
        let r = resolver();
        let a = r.canonicalize("أبو محمد", None);
        assert!(a.synthetic_phone);
        assert_eq!(a.name, "أبو محمد");
        assert_eq!(a.phone.len(), 12);
        assert!(a.phone.starts_with("200"));
        assert_eq!(r.canonicalize("  أبو   محمد ", None).phone, a.phone);
        assert_ne!(r.canonicalize("أم محمد", None).phone, a.phone);
    }

    #[test]
    fn phone_hint_takes_priority_over_name() {
        let r = resolver();
        let sender = r.canonicalize("أبو محمد", Some("01012345678"));
        assert_eq!(sender.phone, "201012345678");
        assert_eq!(sender.name, "أبو محمد");
        assert!(!sender.synthetic_phone);

        let unusable = r.canonicalize("أبو محمد", Some("n/a"));
        assert!(unusable.synthetic_phone);
    }

    #[test]
    fn accumulator_merges_sightings() {
        let r = resolver();
        let mut acc = IdentityAccumulator::new();
        acc.observe(&r.canonicalize("+201012345678", None), at(9), "batch a");
        acc.observe(&r.canonicalize("201012345678", None), at(14), "batch a");
        acc.observe(&r.canonicalize("أحمد 01012345678", None), at(11), "batch b");
        acc.record_property("201012345678");

        assert_eq!(acc.len(), 1);
        let identity = acc.get("201012345678").unwrap();
        assert_eq!(identity.last_activity, at(14));
        assert_eq!(identity.name, "سمسار 5678");
        assert_eq!(identity.notes, vec!["batch a".to_string(), "batch b".to_string()]);
        assert_eq!(identity.total_properties, 1);
        assert!(acc.collisions().is_empty());
    }

    #[test]
    fn synthetic_collisions_are_reported_once() {
        let mut acc = IdentityAccumulator::new();
        let first = CanonicalSender {
            phone: "200123456789".into(),
            name: "Sara".into(),
            synthetic_phone: true,
        };
        let other = CanonicalSender {
            name: "Sarah".into(),
            ..first.clone()
        };
        acc.observe(&first, at(9), "");
        acc.observe(&other, at(10), "");
        acc.observe(&other, at(11), "");
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.collisions().len(), 1);
        assert_eq!(acc.collisions()[0].kept_name, "Sara");
        assert!(acc.get("200123456789").unwrap().notes.is_empty());
    }

    #[tokio::test]
    async fn reconcile_creates_then_matches() {
        let gw = MemoryGateway::new();
        let mut identity = BrokerIdentity {
            phone: "201012345678".into(),
            name: "سمسار 5678".into(),
            last_activity: at(10),
            total_properties: 2,
            notes: vec!["batch a".into()],
            synthetic_phone: false,
        };
        let (created, outcome) = reconcile_broker(&gw, &identity).await.unwrap();
        assert_eq!(outcome, Reconciled::Created);
        assert_eq!(created.total_properties, 0);

        identity.name = "اسم آخر".into();
        identity.last_activity = at(8);
        identity.notes = vec!["batch b".into()];
        let (matched, outcome) = reconcile_broker(&gw, &identity).await.unwrap();
        assert_eq!(outcome, Reconciled::Matched);
        assert_eq!(matched.id, created.id);
        assert_eq!(matched.name, "سمسار 5678");
        assert_eq!(matched.last_activity, Some(at(10)));
        assert_eq!(matched.notes.as_deref(), Some("batch a | batch b"));
        assert_eq!(gw.brokers().await.len(), 1);
    }
}
