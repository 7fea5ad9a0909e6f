//! Field-name translation between the remote bid schema and the canonical
//! schema used by the dashboard.
//!
//! The remote store names a handful of columns differently from the
//! spreadsheet the dashboard was built around. The rename table below is the
//! only place that knowledge lives; anything not listed passes through as-is.

use serde_json::{Map, Value};

// ============================================================================
// Canonical field names
// ============================================================================

/// Winning bid amount (remote: `낙찰금액`)
pub const AWARD_AMOUNT: &str = "입찰금액_1순위";
/// Total project amount (remote: `사업금액`)
pub const PROJECT_AMOUNT: &str = "계약 기간 내";
/// Agency that actually procures the service (remote: `채권자명`)
pub const END_USER_AGENCY: &str = "실수요기관";
/// Opening result / winning bidder info (remote: `개찰업체정보`)
pub const BID_RESULT: &str = "입찰결과_1순위";

/// Notice title
pub const TITLE: &str = "공고명";
/// Bid datetime as entered upstream
pub const BID_DATETIME: &str = "입찰일시";
/// Average freight volume (user override)
pub const AVG_VOLUME: &str = "물동량 평균";
/// Service duration in months (user override)
pub const SERVICE_MONTHS: &str = "용역기간(개월)";

/// Override bookkeeping: last modification time
pub const LAST_MODIFIED: &str = "마지막_수정일";
/// Override bookkeeping: who modified the record
pub const MODIFIED_BY: &str = "수정자";

/// Derived row columns
pub const ROW_YEAR: &str = "예상_연도";
pub const ROW_MONTH: &str = "예상_입찰월";
pub const ROW_DATE: &str = "예상_입찰일";
pub const ROW_YEAR_MONTH: &str = "예상_년월";
pub const ROW_ID: &str = "bid_id";
pub const ROW_IS_FORECAST: &str = "is_forecast";

/// Money columns scaled by the forecast growth rate
pub const MONEY_FIELDS: [&str; 2] = [AWARD_AMOUNT, PROJECT_AMOUNT];

/// (external, canonical) pairs
pub const RENAMES: [(&str, &str); 4] = [
    ("낙찰금액", AWARD_AMOUNT),
    ("사업금액", PROJECT_AMOUNT),
    ("채권자명", END_USER_AGENCY),
    ("개찰업체정보", BID_RESULT),
];

// ============================================================================
// Translation
// ============================================================================

/// External field name -> canonical field name. Unknown names pass through.
pub fn to_canonical_name(external: &str) -> &str {
    RENAMES
        .iter()
        .find(|(ext, _)| *ext == external)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(external)
}

/// Canonical field name -> external field name. Unknown names pass through.
pub fn to_external(canonical: &str) -> &str {
    RENAMES
        .iter()
        .find(|(_, can)| *can == canonical)
        .map(|(external, _)| *external)
        .unwrap_or(canonical)
}

/// Rename every key of an external record into the canonical schema.
///
/// If a record somehow carries both the external and the canonical spelling
/// of the same column, the renamed external value wins, matching how the
/// remote value is treated as the source of truth everywhere else.
pub fn to_canonical(external: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(external.len());
    for (key, value) in external {
        let canonical = to_canonical_name(key);
        if canonical != key.as_str() || !out.contains_key(canonical) {
            out.insert(canonical.to_string(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rename_table_both_directions() {
        for (external, canonical) in RENAMES {
            assert_eq!(to_canonical_name(external), canonical);
            assert_eq!(to_external(canonical), external);
            // Round trip through both directions
            assert_eq!(to_external(to_canonical_name(external)), external);
            assert_eq!(to_canonical_name(to_external(canonical)), canonical);
        }
    }

    #[test]
    fn test_unmapped_names_pass_through() {
        for name in [TITLE, BID_DATETIME, AVG_VOLUME, SERVICE_MONTHS, "", "unknown"] {
            assert_eq!(to_canonical_name(name), name);
            assert_eq!(to_external(name), name);
        }
    }

    #[test]
    fn test_canonical_names_are_not_external_names() {
        // A canonical name fed to to_canonical_name must not be renamed again
        for (_, canonical) in RENAMES {
            assert_eq!(to_canonical_name(canonical), canonical);
        }
    }

    #[test]
    fn test_to_canonical_record() {
        let external = json!({
            "낙찰금액": 100,
            "사업금액": 2500,
            "채권자명": "조달청",
            "개찰업체정보": "A사",
            "공고명": "물류 용역",
        });
        let canonical = to_canonical(external.as_object().unwrap());

        assert_eq!(canonical.get(AWARD_AMOUNT), Some(&json!(100)));
        assert_eq!(canonical.get(PROJECT_AMOUNT), Some(&json!(2500)));
        assert_eq!(canonical.get(END_USER_AGENCY), Some(&json!("조달청")));
        assert_eq!(canonical.get(BID_RESULT), Some(&json!("A사")));
        assert_eq!(canonical.get(TITLE), Some(&json!("물류 용역")));
        assert!(!canonical.contains_key("낙찰금액"));
        assert_eq!(canonical.len(), 5);
    }

    #[test]
    fn test_to_canonical_prefers_renamed_value() {
        let external = json!({
            "낙찰금액": 100,
            "입찰금액_1순위": 1,
        });
        let canonical = to_canonical(external.as_object().unwrap());
        assert_eq!(canonical.get(AWARD_AMOUNT), Some(&json!(100)));
        assert_eq!(canonical.len(), 1);
    }
}
