use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Timestamp = DateTime<Utc>;
pub type Task = i32;

pub const DB_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidityError {
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("aggregate mismatch: accumulator holds {expected}, candidate holds {found}")]
    AggregateMismatch { expected: i32, found: i32 },
    #[error("invalid rollback type: {0}")]
    RollbackType(String),
    #[error("invalid priority scheme: {0}")]
    PriorityScheme(String),
    #[error("invalid table pattern {pattern}: {reason}")]
    TablePattern { pattern: String, reason: String },
}

pub fn beginning_of_time() -> Timestamp {
    DateTime::<Utc>::default()
}

pub fn end_of_time() -> Timestamp {
    Utc.timestamp_opt(i64::from(i32::MAX), 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn format_db_time(ts: &Timestamp) -> String {
    ts.format(DB_DATE_FORMAT).to_string()
}

pub fn parse_db_time(value: &str) -> Result<Timestamp, ValidityError> {
    let trimmed = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, DB_DATE_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(ValidityError::Timestamp(format!(
        "unrecognised timestamp {trimmed:?}"
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityContext {
    pub detector: i32,
    pub sim_flag: i32,
    pub timestamp: Timestamp,
}

impl ValidityContext {
    pub fn new(detector: i32, sim_flag: i32, timestamp: Timestamp) -> Self {
        Self {
            detector,
            sim_flag,
            timestamp,
        }
    }
}

impl fmt::Display for ValidityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{detector 0x{:03x}|sim 0x{:03x}|{}}}",
            self.detector,
            self.sim_flag,
            format_db_time(&self.timestamp)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityRange {
    pub detector_mask: i32,
    pub sim_mask: i32,
    pub time_start: Timestamp,
    pub time_end: Timestamp,
    pub data_source: String,
}

impl ValidityRange {
    pub fn new(
        detector_mask: i32,
        sim_mask: i32,
        time_start: Timestamp,
        time_end: Timestamp,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            detector_mask,
            sim_mask,
            time_start,
            time_end,
            data_source: data_source.into(),
        }
    }

    pub fn unbounded(detector_mask: i32, sim_mask: i32, data_source: impl Into<String>) -> Self {
        Self::new(
            detector_mask,
            sim_mask,
            beginning_of_time(),
            end_of_time(),
            data_source,
        )
    }

    pub fn brackets(&self, ts: Timestamp) -> bool {
        self.time_start <= ts && ts < self.time_end
    }

    pub fn masks_overlap(&self, other: &ValidityRange) -> bool {
        (self.detector_mask & other.detector_mask) != 0 && (self.sim_mask & other.sim_mask) != 0
    }

    pub fn accepts(&self, context: &ValidityContext) -> bool {
        (self.detector_mask & context.detector) != 0 && (self.sim_mask & context.sim_flag) != 0
    }

    pub fn is_compatible(&self, context: &ValidityContext) -> bool {
        self.accepts(context) && self.brackets(context.timestamp)
    }

    pub fn set_time_window(&mut self, start: Timestamp, end: Timestamp) {
        self.time_start = start;
        self.time_end = end;
    }

    pub fn and_time_window(&mut self, start: Timestamp, end: Timestamp) {
        let start = self.time_start.max(start);
        let end = self.time_end.min(end);
        self.set_time_window(start, end);
    }
}

impl fmt::Display for ValidityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "|0x{:03x}|0x{:03x}| {} .. {} from: {}",
            self.detector_mask,
            self.sim_mask,
            format_db_time(&self.time_start),
            format_db_time(&self.time_end),
            self.data_source
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
            + chrono::Duration::seconds(seconds)
    }

    #[test]
    fn db_time_roundtrips_through_text_form() {
        let stamp = ts(42);
        let text = format_db_time(&stamp);
        assert_eq!(text, "2026-02-23 14:00:42");
        assert_eq!(parse_db_time(&text).expect("parse"), stamp);
    }

    #[test]
    fn parse_accepts_rfc3339_and_bare_dates() {
        let rfc = parse_db_time("2026-02-23T14:00:00Z").expect("rfc3339");
        assert_eq!(rfc, ts(0));
        let date = parse_db_time("2026-02-23").expect("date");
        assert_eq!(date, ts(-14 * 3600));
        assert!(parse_db_time("yesterday").is_err());
    }

    #[test]
    fn end_of_time_is_the_32bit_limit() {
        assert_eq!(format_db_time(&end_of_time()), "2038-01-19 03:14:07");
        assert!(beginning_of_time() < end_of_time());
    }

    #[test]
    fn compatibility_needs_mask_overlap_and_half_open_window() {
        let range = ValidityRange::new(0x03, 0x01, ts(10), ts(20), "test");
        assert!(range.is_compatible(&ValidityContext::new(0x02, 0x01, ts(10))));
        assert!(!range.is_compatible(&ValidityContext::new(0x02, 0x01, ts(20))));
        assert!(!range.is_compatible(&ValidityContext::new(0x04, 0x01, ts(15))));
        assert!(!range.is_compatible(&ValidityContext::new(0x01, 0x02, ts(15))));
    }

    #[test]
    fn and_time_window_keeps_the_overlap() {
        let mut range = ValidityRange::new(1, 1, ts(10), ts(20), "test");
        range.and_time_window(ts(5), ts(15));
        assert_eq!((range.time_start, range.time_end), (ts(10), ts(15)));
        range.and_time_window(ts(12), ts(30));
        assert_eq!((range.time_start, range.time_end), (ts(12), ts(15)));
    }
}
