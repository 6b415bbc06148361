//! Time-bounded predicates shared by every read query
use super::StoreError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::ToSql;

/// Layout of stored timestamps: naive UTC, fixed width, so string comparison orders correctly.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| StoreError::InvalidDate(value.into()))
}

/// The UTC instant at which a local calendar day starts, for a zone `offset_minutes` east of UTC.
pub fn local_midnight_utc(date: NaiveDate, offset_minutes: i32) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default() - Duration::minutes(offset_minutes as i64)
}

/// SQLite modifier that shifts a UTC timestamp into local time.
pub fn offset_modifier(offset_minutes: i32) -> String {
    format!("{offset_minutes:+} minutes")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFilter {
    #[default]
    AllTime,
    /// The last N hours up to now.
    HoursBack(u32),
    /// Local calendar days; both ends inclusive. A missing end leaves the range open.
    DateRange {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        offset_minutes: i32,
    },
}

impl TimeFilter {
    /// Build a filter from query parameters. `hours` takes precedence over dates.
    pub fn from_params(
        hours: Option<u32>,
        start_date: Option<&str>,
        end_date: Option<&str>,
        offset_minutes: Option<i32>,
    ) -> Result<Self, StoreError> {
        if let Some(hours) = hours {
            return Ok(TimeFilter::HoursBack(hours));
        }
        let start = start_date.filter(|s| !s.is_empty()).map(parse_date).transpose()?;
        let end = end_date.filter(|s| !s.is_empty()).map(parse_date).transpose()?;
        if start.is_none() && end.is_none() {
            return Ok(TimeFilter::AllTime);
        }
        Ok(TimeFilter::DateRange {
            start,
            end,
            offset_minutes: offset_minutes.unwrap_or(0),
        })
    }

    /// Append this filter's predicates, evaluated against `now`.
    pub fn apply(&self, conditions: &mut Conditions, now: DateTime<Utc>) {
        match *self {
            TimeFilter::AllTime => {}
            TimeFilter::HoursBack(hours) => {
                let since = now.naive_utc() - Duration::hours(hours as i64);
                conditions.push("timestamp >= ?", format_timestamp(&since));
            }
            TimeFilter::DateRange {
                start,
                end,
                offset_minutes,
            } => {
                if let Some(start) = start {
                    let from = local_midnight_utc(start, offset_minutes);
                    conditions.push("timestamp >= ?", format_timestamp(&from));
                }
                if let Some(end) = end {
                    let until = local_midnight_utc(end + Duration::days(1), offset_minutes);
                    conditions.push("timestamp < ?", format_timestamp(&until));
                }
            }
        }
    }
}

/// A conjunction of SQL predicates and their bound parameters.
#[derive(Default)]
pub struct Conditions {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate with one `?` placeholder.
    pub fn push(&mut self, clause: impl Into<String>, param: impl ToSql + 'static) {
        self.clauses.push(clause.into());
        self.params.push(Box::new(param));
    }

    /// Add a predicate with no parameters.
    pub fn push_raw(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }

    /// Add a predicate with several `?` placeholders.
    pub fn push_many(&mut self, clause: impl Into<String>, params: Vec<Box<dyn ToSql>>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> impl Iterator<Item = &dyn ToSql> {
        self.params.iter().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}
