//! Hierarchy flattening: `year -> month -> bid id -> fields` into canonical records
//!
//! The hierarchy path is authoritative for the period. Leaf fields are renamed
//! into the canonical schema and user overrides are layered on top.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::{
    models::{number_value, OverrideRecord, Period, Record},
    schema,
};

/// Datetime layouts seen in bid notices, most specific first
const DATETIME_FORMATS: [&str; 8] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
];

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"];

/// Parse a bid datetime field. Accepts the common notice formats and RFC 3339.
pub fn parse_bid_datetime(value: &Value) -> Option<NaiveDateTime> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

// ============================================================================
// Overrides
// ============================================================================

/// Parsed `/user_inputs` collection
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    by_id: HashMap<String, OverrideRecord>,
    /// Entries that were not objects, plus known fields that were not numeric
    pub malformed: usize,
}

impl Overrides {
    pub fn from_value(raw: &Value) -> Self {
        let mut out = Self::default();
        let Some(entries) = entries(raw) else {
            if !raw.is_null() {
                out.malformed += 1;
            }
            return out;
        };

        for (id, value) in entries {
            match value.as_object() {
                Some(map) => {
                    let (record, invalid) = OverrideRecord::from_map(map);
                    out.malformed += invalid;
                    out.by_id.insert(id, record);
                }
                None => out.malformed += 1,
            }
        }
        out
    }

    pub fn get(&self, id: &str) -> Option<&OverrideRecord> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ============================================================================
// Flattening
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlattenStats {
    /// Leaf entries found under the hierarchy (including malformed ones)
    pub leaves: usize,
    /// Leaves dropped as malformed (bad year/month key, non-object leaf)
    pub skipped: usize,
    pub overrides_applied: usize,
    /// Records whose date fell back to the first day of their period
    pub dates_defaulted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FlattenOutput {
    /// Sorted by (period, id)
    pub records: Vec<Record>,
    pub stats: FlattenStats,
}

/// Children of an object, or of an array with integer keys. Firebase returns
/// mostly-sequential integer keys (months) as arrays with `null` holes.
fn entries(value: &Value) -> Option<Vec<(String, &Value)>> {
    match value {
        Value::Object(map) => Some(map.iter().map(|(k, v)| (k.clone(), v)).collect()),
        Value::Array(items) => Some(
            items
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
        ),
        _ => None,
    }
}

/// Leaves under `value` when it sits `depth` levels above the leaf level
fn leaf_count(value: &Value, depth: usize) -> usize {
    match entries(value) {
        Some(children) if depth > 0 => children.iter().map(|(_, v)| leaf_count(v, depth - 1)).sum(),
        Some(children) => children.len(),
        None => 1,
    }
}

pub fn flatten(hierarchy: &Value, overrides: &Overrides) -> FlattenOutput {
    let mut out = FlattenOutput::default();
    let Some(years) = entries(hierarchy) else {
        return out;
    };

    for (year_key, months_value) in years {
        let Ok(year) = year_key.trim().parse::<i32>() else {
            let lost = leaf_count(months_value, 1);
            out.stats.leaves += lost;
            out.stats.skipped += lost;
            continue;
        };
        let Some(months) = entries(months_value) else {
            out.stats.leaves += 1;
            out.stats.skipped += 1;
            continue;
        };

        for (month_key, bids_value) in months {
            let period = month_key
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|month| Period::new(year, month));
            let Some(period) = period else {
                let lost = leaf_count(bids_value, 0);
                out.stats.leaves += lost;
                out.stats.skipped += lost;
                continue;
            };
            let Some(bids) = entries(bids_value) else {
                out.stats.leaves += 1;
                out.stats.skipped += 1;
                continue;
            };

            for (bid_id, leaf) in bids {
                out.stats.leaves += 1;
                let Some(map) = leaf.as_object() else {
                    out.stats.skipped += 1;
                    continue;
                };

                let mut fields = schema::to_canonical(map);

                if let Some(user) = overrides.get(&bid_id) {
                    for (name, value) in &user.edits {
                        fields.insert(name.clone(), value.clone());
                    }
                    fields.insert(
                        schema::AVG_VOLUME.to_string(),
                        number_value(user.avg_volume.unwrap_or(0.0)),
                    );
                    fields.insert(
                        schema::SERVICE_MONTHS.to_string(),
                        number_value(user.service_months.unwrap_or(0.0)),
                    );
                    out.stats.overrides_applied += 1;
                }

                let date = match fields.get(schema::BID_DATETIME).and_then(parse_bid_datetime) {
                    Some(date) => date,
                    None => {
                        out.stats.dates_defaulted += 1;
                        period.first_day()
                    }
                };

                out.records.push(Record {
                    id: bid_id,
                    period,
                    date,
                    year_month: period.label(),
                    is_forecast: false,
                    fields,
                });
            }
        }
    }

    out.records
        .sort_by(|a, b| a.period.cmp(&b.period).then_with(|| a.id.cmp(&b.id)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_overrides() -> Overrides {
        Overrides::default()
    }

    #[test]
    fn test_single_record_scenario() {
        let hierarchy = json!({"2024": {"1": {"b1": {"낙찰금액": 100, "입찰일시": "2024-01-05"}}}});
        let out = flatten(&hierarchy, &no_overrides());

        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.id, "b1");
        assert_eq!(r.year(), 2024);
        assert_eq!(r.month(), 1);
        assert_eq!(r.number(schema::AWARD_AMOUNT), Some(100.0));
        assert!(r.field("낙찰금액").is_none());
        assert_eq!(r.year_month, "2024-1");
        assert_eq!(r.date.to_string(), "2024-01-05 00:00:00");
        assert!(!r.is_forecast);
    }

    #[test]
    fn test_override_scenario() {
        let hierarchy = json!({"2024": {"1": {"b1": {"낙찰금액": 100, "입찰일시": "2024-01-05"}}}});
        let overrides = Overrides::from_value(&json!({"b1": {"물동량 평균": 50}}));
        let out = flatten(&hierarchy, &overrides);

        let r = &out.records[0];
        assert_eq!(r.number(schema::AVG_VOLUME), Some(50.0));
        // Absent override field defaults to zero
        assert_eq!(r.number(schema::SERVICE_MONTHS), Some(0.0));
        assert_eq!(out.stats.overrides_applied, 1);
    }

    #[test]
    fn test_override_wins_over_base_fields() {
        let hierarchy = json!({"2023": {"7": {"b9": {"물동량 평균": 999, "용역기간(개월)": 6}}}});
        let overrides = Overrides::from_value(&json!({"b9": {"물동량 평균": 12, "용역기간(개월)": "24"}}));
        let r = &flatten(&hierarchy, &overrides).records[0];
        assert_eq!(r.number(schema::AVG_VOLUME), Some(12.0));
        assert_eq!(r.number(schema::SERVICE_MONTHS), Some(24.0));
    }

    #[test]
    fn test_override_edits_layered_on_base() {
        let hierarchy = json!({"2024": {"1": {"b1": {"낙찰금액": 100, "공고명": "A"}}}});
        let overrides = Overrides::from_value(&json!({"b1": {"낙찰금액": 1500, "메모": "x"}}));
        let r = &flatten(&hierarchy, &overrides).records[0];
        assert_eq!(r.number(schema::AWARD_AMOUNT), Some(1500.0));
        assert_eq!(r.title(), Some("A"));
        assert!(r.field("메모").is_none());
    }

    #[test]
    fn test_base_fields_kept_without_override() {
        let hierarchy = json!({"2023": {"7": {"b9": {"물동량 평균": 999}}}});
        let overrides = Overrides::from_value(&json!({"other": {"물동량 평균": 1}}));
        let r = &flatten(&hierarchy, &overrides).records[0];
        assert_eq!(r.number(schema::AVG_VOLUME), Some(999.0));
        assert!(r.field(schema::SERVICE_MONTHS).is_none());
    }

    #[test]
    fn test_path_is_authoritative_for_period() {
        let hierarchy = json!({"2024": {"3": {"b1": {"입찰일시": "2019-11-20 14:00"}}}});
        let r = &flatten(&hierarchy, &no_overrides()).records[0];
        assert_eq!((r.year(), r.month()), (2024, 3));
        assert_eq!(r.year_month, "2024-3");
        // The parsed date is kept as-is
        assert_eq!(r.date.to_string(), "2019-11-20 14:00:00");
    }

    #[test]
    fn test_zero_padded_month_key_normalized() {
        let hierarchy = json!({"2024": {"01": {"b1": {}}, "1": {"b2": {}}}});
        let out = flatten(&hierarchy, &no_overrides());
        assert_eq!(out.records.len(), 2);
        assert!(out.records.iter().all(|r| r.year_month == "2024-1" && r.month() == 1));
    }

    #[test]
    fn test_date_fallback() {
        let hierarchy = json!({"2024": {"2": {
            "bad": {"입찰일시": "next tuesday"},
            "missing": {"공고명": "x"},
        }}});
        let out = flatten(&hierarchy, &no_overrides());
        assert_eq!(out.stats.dates_defaulted, 2);
        for r in &out.records {
            assert_eq!(r.date.to_string(), "2024-02-01 00:00:00");
        }
    }

    #[test]
    fn test_datetime_formats() {
        for (raw, expected) in [
            ("2024-01-05 10:30:00", "2024-01-05 10:30:00"),
            ("2024-01-05 10:30", "2024-01-05 10:30:00"),
            ("2024/01/05 10:30", "2024-01-05 10:30:00"),
            ("2024.01.05", "2024-01-05 00:00:00"),
            ("20240105", "2024-01-05 00:00:00"),
            ("2024-01-05T10:30:00+09:00", "2024-01-05 10:30:00"),
        ] {
            let parsed = parse_bid_datetime(&json!(raw)).unwrap();
            assert_eq!(parsed.to_string(), expected, "format {}", raw);
        }
        assert!(parse_bid_datetime(&json!(20240105)).is_none());
        assert!(parse_bid_datetime(&json!("")).is_none());
    }

    #[test]
    fn test_array_encoded_months() {
        let hierarchy = json!({"2024": [null, {"b1": {"공고명": "jan"}}, null, {"b3": {"공고명": "mar"}}]});
        let out = flatten(&hierarchy, &no_overrides());
        let periods: Vec<(i32, u32)> = out.records.iter().map(|r| (r.year(), r.month())).collect();
        assert_eq!(periods, vec![(2024, 1), (2024, 3)]);
        assert_eq!(out.stats.skipped, 0);
    }

    #[test]
    fn test_malformed_entries_skipped_and_counted() {
        let hierarchy = json!({
            "2024": {
                "1": {"ok": {"공고명": "a"}, "scalar": 5},
                "13": {"x": {}, "y": {}},
                "jan": {"z": {}},
            },
            "twenty": {"1": {"w": {}}},
        });
        let out = flatten(&hierarchy, &no_overrides());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].id, "ok");
        assert_eq!(out.stats.leaves, 6);
        assert_eq!(out.stats.skipped, 5);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(flatten(&Value::Null, &no_overrides()).records.is_empty());
        assert!(flatten(&json!({}), &no_overrides()).records.is_empty());

        let overrides = Overrides::from_value(&Value::Null);
        assert!(overrides.is_empty());
        assert_eq!(overrides.malformed, 0);

        let hierarchy = json!({"2024": {"1": {"b1": {"공고명": "a"}}}});
        let out = flatten(&hierarchy, &overrides);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.stats.overrides_applied, 0);
    }

    #[test]
    fn test_malformed_overrides_counted() {
        let overrides = Overrides::from_value(&json!({
            "b1": "not an object",
            "b2": {"물동량 평균": "lots"},
            "b3": {"물동량 평균": 3},
        }));
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides.malformed, 2);
        assert_eq!(overrides.get("b2").unwrap().avg_volume, None);
    }

    #[test]
    fn test_output_length_matches_leaf_count() {
        let mut years = serde_json::Map::new();
        let mut expected = 0;
        for year in 2020..2024 {
            let mut months = serde_json::Map::new();
            for month in 1..=12u32 {
                let mut bids = serde_json::Map::new();
                for n in 0..(month as usize % 4) {
                    bids.insert(format!("{}-{}-{}", year, month, n), json!({"공고명": n}));
                    expected += 1;
                }
                months.insert(month.to_string(), Value::Object(bids));
            }
            years.insert(year.to_string(), Value::Object(months));
        }

        let out = flatten(&Value::Object(years), &no_overrides());
        assert_eq!(out.records.len(), expected);
        assert_eq!(out.stats.leaves, expected);

        // Sorted by period, then id
        assert!(out
            .records
            .windows(2)
            .all(|w| (w[0].period, &w[0].id) <= (w[1].period, &w[1].id)));
    }
}
