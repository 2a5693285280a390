use std::path::PathBuf;

use crm_core::DEFAULT_CURRENCY;
use crm_ingest::DateOrder;
use tracing::warn;

pub const DEFAULT_COUNTRY_CODE: &str = "20";

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub reports_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub date_order: DateOrder,
    /// Prepended to local mobile numbers during canonicalization.
    pub country_code: String,
    pub currency: String,
    pub rules_path: Option<PathBuf>,
    pub write_reports: bool,
    /// Skip the transcript archive; the caller supplies a throwaway gateway.
    pub dry_run: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let date_order = match var("CRM_DATE_ORDER") {
            Some(raw) => DateOrder::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unrecognized CRM_DATE_ORDER; using month/day/year");
                DateOrder::MonthFirst
            }),
            None => DateOrder::default(),
        };
        Self {
            database_url: var("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            reports_dir: var("CRM_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            archive_dir: var("CRM_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            date_order,
            country_code: var("CRM_COUNTRY_CODE")
                .map(|v| v.trim().trim_start_matches('+').to_string())
                .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_string()),
            currency: var("CRM_CURRENCY")
                .map(|v| v.trim().to_ascii_uppercase())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            rules_path: var("CRM_RULES_PATH").map(PathBuf::from),
            write_reports: var("CRM_WRITE_REPORTS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
            dry_run: false,
        }
    }
}
