use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::schema;

/// Calendar month a bid is scheduled in (year + 1-based month)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Returns None for months outside 1..=12 or years outside 1..=9999
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if !(1..=9999).contains(&year) || !(1..=12).contains(&month) {
            return None;
        }
        Some(Self { year, month })
    }

    #[inline]
    pub fn year(&self) -> i32 {
        self.year
    }

    #[inline]
    pub fn month(&self) -> u32 {
        self.month
    }

    /// "2024-1" style label (no zero padding)
    pub fn label(&self) -> String {
        format!("{}-{}", self.year, self.month)
    }

    /// Midnight on the first day of the month
    pub fn first_day(&self) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }

    /// Months elapsed since year 0, used for window arithmetic
    #[inline]
    pub fn ordinal(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    pub fn add_years(&self, years: i32) -> Option<Self> {
        Self::new(self.year.checked_add(years)?, self.month)
    }
}

/// Interpret a JSON value as a number. Numeric strings are accepted since the
/// dashboard and older imports store numbers as text.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Build a JSON number from an f64, preferring an integer representation when
/// the value is integral so `100.0` and `100` compare equal downstream.
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ============================================================================
// Records
// ============================================================================

/// One bid, in the canonical schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Remote record id (`bid_id`); synthetic ids for forecast records
    pub id: String,
    /// Authoritative period, taken from the hierarchy path
    pub period: Period,
    /// Bid date, parsed from the bid datetime or the first of the period
    pub date: NaiveDateTime,
    /// "YYYY-M" label
    pub year_month: String,
    /// Set by the forecast generator, never by the flattener
    pub is_forecast: bool,
    /// Canonical field map (renamed, override-merged)
    pub fields: Map<String, Value>,
}

impl Record {
    #[inline]
    pub fn year(&self) -> i32 {
        self.period.year()
    }

    #[inline]
    pub fn month(&self) -> u32 {
        self.period.month()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(as_number)
    }

    pub fn title(&self) -> Option<&str> {
        self.fields.get(schema::TITLE).and_then(Value::as_str)
    }

    /// Flat row: canonical fields plus the derived columns
    pub fn to_row(&self) -> Value {
        let mut row = self.fields.clone();
        row.insert(schema::ROW_YEAR.to_string(), Value::from(self.year()));
        row.insert(schema::ROW_MONTH.to_string(), Value::from(self.month()));
        row.insert(
            schema::ROW_DATE.to_string(),
            Value::from(self.date.format("%Y-%m-%d %H:%M:%S").to_string()),
        );
        row.insert(
            schema::ROW_YEAR_MONTH.to_string(),
            Value::from(self.year_month.clone()),
        );
        row.insert(schema::ROW_ID.to_string(), Value::from(self.id.clone()));
        row.insert(
            schema::ROW_IS_FORECAST.to_string(),
            Value::Bool(self.is_forecast),
        );
        Value::Object(row)
    }
}

/// User-entered supplementary fields for one bid (`/user_inputs/{bid_id}`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideRecord {
    pub avg_volume: Option<f64>,
    pub service_months: Option<f64>,
    pub last_modified: Option<String>,
    pub modified_by: Option<String>,
    /// Other numeric edits, keyed by canonical field name
    pub edits: Map<String, Value>,
}

impl OverrideRecord {
    /// Parse an override map. Returns the record and the number of known
    /// fields that were present but not numeric.
    pub fn from_map(map: &Map<String, Value>) -> (Self, usize) {
        let mut invalid = 0;
        let mut numeric = |name: &str| -> Option<f64> {
            let raw = map.get(name)?;
            let parsed = as_number(raw);
            if parsed.is_none() && !raw.is_null() {
                invalid += 1;
            }
            parsed
        };

        let avg_volume = numeric(schema::AVG_VOLUME);
        let service_months = numeric(schema::SERVICE_MONTHS);

        let edits = map
            .iter()
            .filter(|(name, _)| {
                ![
                    schema::AVG_VOLUME,
                    schema::SERVICE_MONTHS,
                    schema::LAST_MODIFIED,
                    schema::MODIFIED_BY,
                ]
                .contains(&name.as_str())
            })
            .filter_map(|(name, raw)| {
                let value = as_number(raw)?;
                Some((schema::to_canonical_name(name).to_string(), number_value(value)))
            })
            .collect();

        let record = Self {
            avg_volume,
            service_months,
            last_modified: map
                .get(schema::LAST_MODIFIED)
                .and_then(Value::as_str)
                .map(str::to_string),
            modified_by: map
                .get(schema::MODIFIED_BY)
                .and_then(Value::as_str)
                .map(str::to_string),
            edits,
        };
        (record, invalid)
    }
}

// ============================================================================
// Dataset
// ============================================================================

/// A complete materialized dataset: historical records followed by forecasts.
///
/// Immutable once published by the snapshot store; patches produce a new copy.
#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<Record>,
    /// id -> positions (ids are expected unique, but a bid filed under two
    /// months must still be patchable everywhere it appears)
    index: HashMap<String, Vec<usize>>,
    version: u64,
    built_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(records: Vec<Record>) -> Self {
        let mut index: HashMap<String, Vec<usize>> = HashMap::with_capacity(records.len());
        for (pos, record) in records.iter().enumerate() {
            index.entry(record.id.clone()).or_default().push(pos);
        }
        Self {
            records,
            index,
            version: 0,
            built_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    #[inline]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Version assigned by the snapshot store (0 = never published)
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// First record with the given id
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index
            .get(id)
            .and_then(|positions| positions.first())
            .and_then(|&pos| self.records.get(pos))
    }

    /// Set `field` on every record with `id`. Returns false if the id is unknown.
    pub(crate) fn set_field(&mut self, id: &str, field: &str, value: Value) -> bool {
        let Some(positions) = self.index.get(id) else {
            return false;
        };
        for &pos in positions {
            if let Some(record) = self.records.get_mut(pos) {
                record.fields.insert(field.to_string(), value.clone());
            }
        }
        true
    }

    pub fn historical(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| !r.is_forecast)
    }

    pub fn forecasts(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| r.is_forecast)
    }

    pub fn historical_count(&self) -> usize {
        self.historical().count()
    }

    pub fn forecast_count(&self) -> usize {
        self.forecasts().count()
    }

    /// Record count per year (historical and forecast together)
    pub fn counts_by_year(&self) -> BTreeMap<i32, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.year()).or_insert(0) += 1;
        }
        counts
    }

    pub fn latest_historical_period(&self) -> Option<Period> {
        self.historical().map(|r| r.period).max()
    }

    pub fn to_rows(&self) -> Vec<Value> {
        self.records.iter().map(Record::to_row).collect()
    }
}
