//! Forecast augmentation
//!
//! Extends the historical series with synthetic records for future years.
//! Implementations must never emit a record at or before the latest
//! historical period, and must tag every record they emit as a forecast.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

use crate::{
    models::{as_number, number_value, Period, Record},
    schema,
};

const MAX_YEAR: i32 = 9999;

/// Appended to the title of synthetic records for display
pub const FORECAST_TITLE_SUFFIX: &str = " (예측)";

pub trait ForecastGenerator: Send + Sync {
    /// Synthesize records for `years` future years. `historical` is read-only;
    /// an empty input yields an empty output.
    fn generate(&self, historical: &[Record], years: u32) -> Vec<Record>;
}

/// Seasonal projection: the trailing twelve months of history are repeated
/// once per future year, with money fields scaled by the historical
/// year-over-year growth of the total award amount.
#[derive(Debug, Clone)]
pub struct SeasonalForecast {
    pub min_growth: f64,
    pub max_growth: f64,
}

impl Default for SeasonalForecast {
    fn default() -> Self {
        Self {
            min_growth: -0.5,
            max_growth: 1.0,
        }
    }
}

impl SeasonalForecast {
    /// Mean year-over-year growth of total award amount across consecutive
    /// complete years. The latest year only counts once December is present.
    pub fn growth_rate(&self, historical: &[Record], latest: Period) -> f64 {
        let mut totals: BTreeMap<i32, f64> = BTreeMap::new();
        for record in historical.iter().filter(|r| !r.is_forecast) {
            if record.year() == latest.year() && latest.month() < 12 {
                continue;
            }
            if let Some(amount) = record.number(schema::AWARD_AMOUNT) {
                *totals.entry(record.year()).or_insert(0.0) += amount;
            }
        }

        let rates: Vec<f64> = totals
            .iter()
            .zip(totals.iter().skip(1))
            .filter(|((prev_year, prev), (year, _))| **year == **prev_year + 1 && **prev > 0.0)
            .map(|((_, prev), (_, cur))| cur / prev - 1.0)
            .collect();

        if rates.is_empty() {
            return 0.0;
        }
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        mean.clamp(self.min_growth, self.max_growth)
    }
}

/// Same day and time, `years` later; the first of the month when the day
/// does not exist (Feb 29).
fn shift_date(date: NaiveDateTime, period: Period) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(period.year(), period.month(), date.day())
        .map(|d| d.and_time(date.time()))
        .unwrap_or_else(|| period.first_day())
}

impl ForecastGenerator for SeasonalForecast {
    fn generate(&self, historical: &[Record], years: u32) -> Vec<Record> {
        let history: Vec<&Record> = historical.iter().filter(|r| !r.is_forecast).collect();
        let Some(latest) = history.iter().map(|r| r.period).max() else {
            return Vec::new();
        };
        if years == 0 {
            return Vec::new();
        }

        let window_start = latest.ordinal() - 12;
        let template: Vec<&Record> = history
            .iter()
            .copied()
            .filter(|r| r.period.ordinal() > window_start)
            .collect();

        // No period exists past year 9999, so neither do forecasts
        let horizon = years.min(u32::try_from(MAX_YEAR - latest.year()).unwrap_or(0));
        let growth = self.growth_rate(historical, latest);
        let mut out = Vec::with_capacity(template.len() * horizon as usize);

        for k in 1..=horizon {
            let Ok(offset) = i32::try_from(k) else {
                break;
            };
            let factor = (1.0 + growth).powi(offset);

            for source in &template {
                let Some(period) = source.period.add_years(offset) else {
                    continue;
                };

                let mut fields = source.fields.clone();
                for money in schema::MONEY_FIELDS {
                    if let Some(amount) = fields.get(money).and_then(as_number) {
                        fields.insert(money.to_string(), number_value((amount * factor).round()));
                    }
                }
                if let Some(title) = source.title() {
                    fields.insert(
                        schema::TITLE.to_string(),
                        format!("{}{}", title, FORECAST_TITLE_SUFFIX).into(),
                    );
                }

                out.push(Record {
                    id: format!("forecast-{}-{}-{}", period.year(), period.month(), source.id),
                    period,
                    date: shift_date(source.date, period),
                    year_month: period.label(),
                    is_forecast: true,
                    fields,
                });
            }
        }

        out.sort_by(|a, b| a.period.cmp(&b.period).then_with(|| a.id.cmp(&b.id)));
        out
    }
}
