//! Heuristic listing extraction from free-form (mostly Arabic) message text.
//!
//! Every field is driven by an ordered rule table; the first rule that
//! yields an acceptable value wins. Nothing here fails: a field whose rules
//! do not match is left empty.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use crm_core::{ExtractedProperty, ListingType, PropertyType, DEFAULT_CURRENCY};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rules::ExtractionRules;

/// Listing-type keywords, highest priority first.
const LISTING_RULES: &[(ListingType, &str)] = &[
    (ListingType::ForSale, r"للبيع|لبيع|for sale"),
    (ListingType::ForRent, r"للإيجار|للايجار|للأيجار|إيجار|ايجار|for rent|\brent\b"),
    (ListingType::Wanted, r"مطلوب|wanted"),
];

/// Property-type keywords in precedence order; apartment is also the fallback.
const PROPERTY_TYPE_RULES: &[(PropertyType, &str)] = &[
    (PropertyType::Villa, r"فيلا|فيللا|فيله|قصر|\bvilla\b"),
    (PropertyType::House, r"منزل|\bبيت\b|\bhouse\b|\bhome\b"),
    (PropertyType::Land, r"\bارض\b|\bأرض\b|قطعة|قطعه|\bland\b|\bplot\b"),
    (PropertyType::Office, r"مكتب|\boffice\b"),
    (PropertyType::Shop, r"\bمحل\b|محلات|\bshop\b|\bstore\b"),
    (PropertyType::Warehouse, r"مخزن|مستودع|\bwarehouse\b"),
    (
        PropertyType::Apartment,
        r"شقة|شقه|\bدور\b|الدور|وحدة|وحده|دوبلكس|\bapartment\b|\bflat\b|\bduplex\b",
    ),
];

const AREA_PATTERNS: &[&str] = &[
    r"(\d+(?:[.,]\d+)*)\s*(?:متر|م2|م²|m2|m²|sqm|square met)",
    r"(\d+(?:[.,]\d+)*)\s*م\b",
    r"(?:مساحة|مساحه|المساحة|المساحه|مسطح|\barea\b)\s*:?\s*(\d+(?:[.,]\d+)*)",
];

const MAGNITUDE_TOKENS: &str = r"مليون|ملايين|million|ألف|الف|آلاف|الاف|thousand|k\b";

/// Capture 1 is the number, optional capture 2 a magnitude token.
const PRICE_PATTERNS: &[&str] = &[
    r"(\d+(?:[.,]\d+)*)\s*({magnitude})",
    r"(?:السعر|سعر|بسعر|\bprice\b)\s*:?\s*(\d+(?:[.,]\d+)*)\s*({magnitude})?",
    r"(\d+(?:[.,]\d+)*)\s*(?:جنيه|جنية|ج\.م|egp|دولار|usd|\$)",
    r"مطلوب\s*:?\s*(\d+(?:[.,]\d+)*)",
];

/// (label, pattern); capture 1 is the district number.
const LOCATION_RULES: &[(&str, &str)] = &[
    ("الحي", r"(?:الحي|الحى|حي|حى)\s*(?:رقم\s*)?(\d+)"),
    ("مجاورة", r"(?:المجاورة|المجاوره|مجاورة|مجاوره)\s*(?:رقم\s*)?(\d+)"),
    ("بلوك", r"(?:بلوك|\bblock)\s*(?:رقم\s*)?(\d+)"),
];

const FLOOR_PREFIX: &str = r"(?:الدور|دور|الطابق|طابق)\s*(?:ال)?";

/// Ordinal floor words, checked before bare floor numbers.
const FLOOR_ORDINALS: &[(i32, &str)] = &[
    (0, "ارضي|أرضي|ارضى|أرضى"),
    (1, "اول|أول|اولى|أولى"),
    (2, "تاني|ثاني|تانى|ثانى"),
    (3, "تالت|ثالث"),
];

const FLOOR_NUMBER: &str = r"(?:الدور|دور|الطابق|طابق|\bfloor)\s*(?:رقم\s*)?(\d+)";
const BEDROOM_PATTERN: &str = r"(\d+)\s*(?:غرف|غرفة|غرفه|اوض|أوض|bedrooms?|rooms?|br\b)";
const BATHROOM_PATTERN: &str = r"(\d+)\s*(?:حمامات|حمام|bathrooms?|baths?)";
const USD_PATTERN: &str = r"دولار|\busd\b|\$";

const AREA_RANGE: RangeInclusive<f64> = 20.0..=10_000.0;
const PRICE_RANGE: RangeInclusive<f64> = 10_000.0..=100_000_000.0;

const FALLBACK_TITLE: &str = "عرض عقاري";
const TITLE_PREFIX_CHARS: usize = 30;

/// Why a message was excluded before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    System,
    Media,
    Empty,
    Spam,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::System => "system",
            SkipReason::Media => "media",
            SkipReason::Empty => "empty",
            SkipReason::Spam => "spam",
        }
    }
}

/// The first cue that made a message count as a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyCue {
    ListingKeyword,
    PropertyTypeKeyword,
    AreaOrLocation,
    RealEstateKeyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Magnitude {
    Million,
    Thousand,
}

impl Magnitude {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_lowercase().as_str() {
            "مليون" | "ملايين" | "million" => Some(Magnitude::Million),
            "ألف" | "الف" | "آلاف" | "الاف" | "thousand" | "k" => Some(Magnitude::Thousand),
            _ => None,
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Magnitude::Million => 1_000_000.0,
            Magnitude::Thousand => 1_000.0,
        }
    }

    pub fn apply(self, value: f64) -> f64 {
        (value * self.multiplier()).round()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Extraction {
    Skipped { reason: SkipReason },
    NoProperty,
    Property {
        cue: PropertyCue,
        property: ExtractedProperty,
    },
}

impl Extraction {
    pub fn property(&self) -> Option<&ExtractedProperty> {
        match self {
            Extraction::Property { property, .. } => Some(property),
            _ => None,
        }
    }

    pub fn into_property(self) -> Option<ExtractedProperty> {
        match self {
            Extraction::Property { property, .. } => Some(property),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Extraction::Skipped { reason } => Some(*reason),
            _ => None,
        }
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).expect("static extraction pattern")
}

/// Maps Arabic-Indic and Persian digits and separators to ASCII, lowercased.
fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06f0}'..='\u{06f9}' => char::from(b'0' + (c as u32 - 0x06f0) as u8),
            '\u{066b}' => '.',
            '\u{066c}' => ',',
            _ => c,
        })
        .collect::<String>()
        .to_lowercase()
}

/// Accepts `1,500,000` (grouping) as well as `1,5` (decimal comma).
fn parse_number(raw: &str) -> Option<f64> {
    if !raw.contains(',') {
        return raw.parse().ok();
    }
    let grouped = raw
        .split(',')
        .skip(1)
        .all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()));
    if grouped {
        raw.replace(',', "").parse().ok()
    } else {
        raw.replacen(',', ".", 1).parse().ok()
    }
}

/// One decimal at most, without a trailing `.0`.
fn compact_number(value: f64) -> String {
    let text = format!("{value:.1}");
    text.strip_suffix(".0").map(str::to_string).unwrap_or(text)
}

fn format_price(price: f64, currency: &str) -> String {
    let unit = if currency == "USD" { "دولار" } else { "جنيه" };
    if price >= 1_000_000.0 {
        format!("{} مليون {unit}", compact_number(price / 1_000_000.0))
    } else {
        format!("{} ألف {unit}", compact_number(price / 1_000.0))
    }
}

/// `ar` when the text has Arabic letters, otherwise `en`.
pub fn detect_language(text: &str) -> &'static str {
    if text.chars().any(|c| ('\u{0621}'..='\u{064a}').contains(&c)) {
        "ar"
    } else {
        "en"
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    rules: ExtractionRules,
    currency: String,
    listing: Vec<(ListingType, Regex)>,
    property_types: Vec<(PropertyType, Regex)>,
    areas: Vec<Regex>,
    prices: Vec<Regex>,
    locations: Vec<(&'static str, Regex)>,
    floor_ordinals: Vec<(i32, Regex)>,
    floor_number: Regex,
    bedrooms: Regex,
    bathrooms: Regex,
    usd: Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractionRules::default())
    }
}

impl Extractor {
    pub fn new(rules: ExtractionRules) -> Self {
        Self {
            rules,
            currency: DEFAULT_CURRENCY.to_string(),
            listing: LISTING_RULES.iter().map(|(t, p)| (*t, compile(p))).collect(),
            property_types: PROPERTY_TYPE_RULES.iter().map(|(t, p)| (*t, compile(p))).collect(),
            areas: AREA_PATTERNS.iter().map(|p| compile(p)).collect(),
            prices: PRICE_PATTERNS
                .iter()
                .map(|p| compile(&p.replace("{magnitude}", MAGNITUDE_TOKENS)))
                .collect(),
            locations: LOCATION_RULES.iter().map(|(l, p)| (*l, compile(p))).collect(),
            floor_ordinals: FLOOR_ORDINALS
                .iter()
                .map(|(floor, words)| (*floor, compile(&format!("{FLOOR_PREFIX}(?:{words})"))))
                .collect(),
            floor_number: compile(FLOOR_NUMBER),
            bedrooms: compile(BEDROOM_PATTERN),
            bathrooms: compile(BATHROOM_PATTERN),
            usd: compile(USD_PATTERN),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    fn contains_any(haystack: &str, needles: &[String]) -> bool {
        needles
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()))
    }

    /// System, media and spam filters, applied in that order.
    pub fn skip_reason(&self, text: &str) -> Option<SkipReason> {
        let lower = text.to_lowercase();
        if Self::contains_any(&lower, &self.rules.system_markers) {
            return Some(SkipReason::System);
        }
        if Self::contains_any(&lower, &self.rules.media_markers) {
            return Some(SkipReason::Media);
        }
        if lower.trim().is_empty() {
            return Some(SkipReason::Empty);
        }
        if Self::contains_any(&lower, &self.rules.spam_keywords) {
            return Some(SkipReason::Spam);
        }
        None
    }

    /// Whether the text references an attached file (stored as an image message).
    pub fn has_attachment(&self, text: &str) -> bool {
        Self::contains_any(&text.to_lowercase(), &self.rules.attachment_markers)
    }

    pub fn extract(&self, text: &str) -> Extraction {
        if let Some(reason) = self.skip_reason(text) {
            return Extraction::Skipped { reason };
        }
        let normalized = normalize_text(text);

        let listing = self.listing_type(&normalized);
        let property_type = self.property_type(&normalized);
        let locations = self.locations(&normalized);
        let area_cue = self.areas.iter().any(|re| re.is_match(&normalized));

        let cue = if listing.is_some() {
            PropertyCue::ListingKeyword
        } else if property_type.is_some() {
            PropertyCue::PropertyTypeKeyword
        } else if area_cue || !locations.is_empty() {
            PropertyCue::AreaOrLocation
        } else if Self::contains_any(&normalized, &self.rules.real_estate_keywords) {
            PropertyCue::RealEstateKeyword
        } else {
            return Extraction::NoProperty;
        };

        let area = self.area(&normalized);
        let price = self.price(&normalized);
        let currency = if self.usd.is_match(&normalized) {
            "USD".to_string()
        } else {
            self.currency.clone()
        };
        let location = if locations.is_empty() {
            None
        } else {
            Some(locations.join(", "))
        };

        let title = build_title(
            listing,
            property_type,
            location.as_deref(),
            area,
            price,
            &currency,
            text,
        );

        Extraction::Property {
            cue,
            property: ExtractedProperty {
                title,
                description: text.to_string(),
                property_type: property_type.unwrap_or_default(),
                listing_type: listing.unwrap_or_default(),
                price,
                currency,
                area,
                location,
                floor: self.floor(&normalized),
                bedrooms: first_count(&self.bedrooms, &normalized),
                bathrooms: first_count(&self.bathrooms, &normalized),
                negotiable: Self::contains_any(&normalized, &self.rules.negotiable_keywords),
                features: self.features(&normalized),
            },
        }
    }

    fn listing_type(&self, text: &str) -> Option<ListingType> {
        self.listing
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(t, _)| *t)
    }

    fn property_type(&self, text: &str) -> Option<PropertyType> {
        self.property_types
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(t, _)| *t)
    }

    fn area(&self, text: &str) -> Option<f64> {
        self.areas.iter().find_map(|re| {
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1).and_then(|m| parse_number(m.as_str())))
                .find(|value| AREA_RANGE.contains(value))
        })
    }

    fn price(&self, text: &str) -> Option<f64> {
        self.prices.iter().find_map(|re| {
            re.captures_iter(text)
                .filter_map(|caps| {
                    let value = parse_number(caps.get(1)?.as_str())?;
                    let magnitude = caps.get(2).and_then(|m| Magnitude::from_token(m.as_str()));
                    Some(magnitude.map_or(value, |m| m.apply(value)))
                })
                .find(|value| PRICE_RANGE.contains(value))
        })
    }

    fn locations(&self, text: &str) -> Vec<String> {
        let mut parts: Vec<String> = Vec::new();
        for (label, re) in &self.locations {
            for caps in re.captures_iter(text) {
                let part = format!("{label} {}", &caps[1]);
                if !parts.contains(&part) {
                    parts.push(part);
                }
            }
        }
        for district in &self.rules.districts {
            if text.contains(&district.to_lowercase()) && !parts.contains(district) {
                parts.push(district.clone());
            }
        }
        parts
    }

    fn floor(&self, text: &str) -> Option<i32> {
        self.floor_ordinals
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(floor, _)| *floor)
            .or_else(|| {
                self.floor_number
                    .captures(text)
                    .and_then(|caps| caps[1].parse().ok())
            })
    }

    fn features(&self, text: &str) -> BTreeSet<String> {
        self.rules
            .feature_rules
            .iter()
            .filter(|rule| Self::contains_any(text, &rule.contains_any))
            .map(|rule| rule.tag.clone())
            .collect()
    }
}

fn first_count(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text).and_then(|caps| caps[1].parse().ok())
}

fn build_title(
    listing: Option<ListingType>,
    property_type: Option<PropertyType>,
    location: Option<&str>,
    area: Option<f64>,
    price: Option<f64>,
    currency: &str,
    source: &str,
) -> String {
    let mut head: Vec<&str> = Vec::new();
    if let Some(listing) = listing {
        head.push(listing.label());
    }
    if let Some(property_type) = property_type {
        head.push(property_type.label());
    }

    if head.is_empty() && location.is_none() && area.is_none() && price.is_none() {
        let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
        let prefix: String = collapsed.chars().take(TITLE_PREFIX_CHARS).collect();
        let ellipsis = if collapsed.chars().count() > TITLE_PREFIX_CHARS { "..." } else { "" };
        return format!("{FALLBACK_TITLE} - {prefix}{ellipsis}");
    }
    if head.is_empty() {
        head.push("عقار");
    }

    let mut title = head.join(" - ");
    if let Some(location) = location {
        title.push_str(&format!(" في {location}"));
    }
    if let Some(area) = area {
        title.push_str(&format!(" - {} متر", compact_number(area)));
    }
    if let Some(price) = price {
        title.push_str(&format!(" - {}", format_price(price, currency)));
    }
    title
}
