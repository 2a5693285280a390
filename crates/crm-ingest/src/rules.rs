//! Keyword tables that may be replaced from a YAML file.
//!
//! Precedence tables (listing type, property type, floor ordinals) are
//! compiled into the extractor; the lists here are plain substring sets.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading rules file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRule {
    pub tag: String,
    pub contains_any: Vec<String>,
}

impl FeatureRule {
    fn new(tag: &str, contains_any: &[&str]) -> Self {
        Self {
            tag: tag.to_string(),
            contains_any: contains_any.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Missing sections in a YAML override keep their built-in values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub version: u32,
    pub system_markers: Vec<String>,
    pub media_markers: Vec<String>,
    pub attachment_markers: Vec<String>,
    pub spam_keywords: Vec<String>,
    pub real_estate_keywords: Vec<String>,
    pub negotiable_keywords: Vec<String>,
    pub feature_rules: Vec<FeatureRule>,
    /// Named districts recognized verbatim as locations.
    pub districts: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            version: 1,
            system_markers: strings(&[
                "end-to-end encrypted",
                "created group",
                "added you",
                "you were added",
                "joined using this group's invite link",
                "changed the subject",
                "changed this group's icon",
                "changed the group description",
                "security code changed",
                "مشفرة بين الطرفين",
                "أنشأ المجموعة",
                "أضافك",
            ]),
            media_markers: strings(&[
                "<media omitted>",
                "<تم استبعاد الوسائط>",
                "image omitted",
                "video omitted",
                "audio omitted",
                "sticker omitted",
                "document omitted",
                "gif omitted",
                "this message was deleted",
                "تم حذف هذه الرسالة",
            ]),
            attachment_markers: strings(&["(file attached)", "file attached", "<attached:"]),
            spam_keywords: strings(&[
                "بيتكوين",
                "bitcoin",
                "crypto",
                "كريبتو",
                "عملات رقمية",
                "فوركس",
                "forex",
                "ترويجي",
                "فرصة استثمارية",
                "ارباح يومية",
                "أرباح يومية",
            ]),
            real_estate_keywords: strings(&["عقار", "real estate", "property"]),
            negotiable_keywords: strings(&["تفاوض", "negotiable"]),
            feature_rules: vec![
                FeatureRule::new("خالص الثمن", &["خالص", "fully paid"]),
                FeatureRule::new("مرخص", &["رخصه", "رخصة", "مرخص", "licensed"]),
                FeatureRule::new("توكيل", &["توكيل"]),
                FeatureRule::new("عدادات منفصلة", &["عدادات", "separate meters"]),
                FeatureRule::new("مفتاح متاح", &["مفتاح"]),
                FeatureRule::new("مشطب", &["تشطيب", "متشطب", "مشطب", "finished"]),
                FeatureRule::new("مفروش", &["مفروش", "furnished"]),
                FeatureRule::new("ناصية", &["ناصية", "ناصيه", "corner"]),
                FeatureRule::new("واجهة مميزة", &["واجهة", "واجهه", "frontage"]),
            ],
            districts: strings(&[
                "الاندلس",
                "الأندلس",
                "اليوناني",
                "الايطالي",
                "الإيطالي",
                "المطور",
                "الحي المتميز",
            ]),
        }
    }
}

impl ExtractionRules {
    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, RulesError> {
        serde_yaml::from_str(text).map_err(|source| RulesError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    /// Built-in rules, or the given override file when present.
    pub fn load(path: Option<&Path>) -> Result<Self, RulesError> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => Ok(Self::default()),
        }
    }
}
