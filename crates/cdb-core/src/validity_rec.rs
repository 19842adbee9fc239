use crate::validity::{
    beginning_of_time, format_db_time, Task, Timestamp, ValidityContext, ValidityError,
    ValidityRange,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const AGGREGATE_UNDEFINED: i32 = -2;
pub const AGGREGATE_NONE: i32 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityScheme {
    CreationDate,
    #[default]
    Epoch,
}

impl PriorityScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityScheme::CreationDate => "creation_date",
            PriorityScheme::Epoch => "epoch",
        }
    }
}

impl fmt::Display for PriorityScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityScheme {
    type Err = ValidityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "creation_date" | "creationdate" | "creation-date" => Ok(PriorityScheme::CreationDate),
            "epoch" => Ok(PriorityScheme::Epoch),
            other => Err(ValidityError::PriorityScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityRow {
    pub seq_no: u32,
    pub aggregate_no: i32,
    pub task: Task,
    pub epoch: u32,
    pub reality: u32,
    pub db_index: Option<usize>,
    pub creation_date: Timestamp,
    pub insert_date: Timestamp,
    pub range: ValidityRange,
}

impl ValidityRow {
    pub fn new(
        range: ValidityRange,
        task: Task,
        aggregate_no: i32,
        seq_no: u32,
        creation_date: Timestamp,
    ) -> Self {
        Self {
            seq_no,
            aggregate_no,
            task,
            epoch: 0,
            reality: 0,
            db_index: None,
            creation_date,
            insert_date: creation_date,
            range,
        }
    }

    pub fn priority_cmp(&self, other: &ValidityRow, scheme: PriorityScheme) -> Ordering {
        let primary = match scheme {
            PriorityScheme::CreationDate => self.creation_date.cmp(&other.creation_date),
            PriorityScheme::Epoch => self
                .epoch
                .cmp(&other.epoch)
                .then(self.range.time_start.cmp(&other.range.time_start))
                .then(self.insert_date.cmp(&other.insert_date)),
        };
        // Lower cascade index outranks higher ones on a full tie.
        primary
            .then(self.seq_no.cmp(&other.seq_no))
            .then(other.db_index.cmp(&self.db_index))
    }

    pub fn is_higher_priority(&self, other: &ValidityRow, scheme: PriorityScheme) -> bool {
        self.priority_cmp(other, scheme) == Ordering::Greater
    }

    pub fn cache_name(&self) -> String {
        cache_name_for(self.seq_no, self.seq_no, &self.creation_date)
    }
}

pub fn cache_name_for(seq_lo: u32, seq_hi: u32, ts: &Timestamp) -> String {
    let mut name = format!("{seq_lo}_");
    if seq_lo != seq_hi {
        name.push_str(&format!("{seq_hi}_"));
    }
    name.push_str(&format_db_time(ts));
    name.replace([' ', ':'], "_")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub range: ValidityRange,
    pub task: Task,
    pub aggregate_no: i32,
    pub db_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidityRecord {
    Gap(Gap),
    Row(ValidityRow),
}

impl ValidityRecord {
    pub fn gap(range: ValidityRange, task: Task, aggregate_no: i32) -> Self {
        ValidityRecord::Gap(Gap {
            range,
            task,
            aggregate_no,
            db_index: None,
        })
    }

    pub fn undefined() -> Self {
        Self::gap(ValidityRange::unbounded(0, 0, "undefined"), 0, AGGREGATE_UNDEFINED)
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, ValidityRecord::Gap(_))
    }

    pub fn row(&self) -> Option<&ValidityRow> {
        match self {
            ValidityRecord::Row(row) => Some(row),
            ValidityRecord::Gap(_) => None,
        }
    }

    pub fn range(&self) -> &ValidityRange {
        match self {
            ValidityRecord::Gap(gap) => &gap.range,
            ValidityRecord::Row(row) => &row.range,
        }
    }

    fn range_mut(&mut self) -> &mut ValidityRange {
        match self {
            ValidityRecord::Gap(gap) => &mut gap.range,
            ValidityRecord::Row(row) => &mut row.range,
        }
    }

    pub fn task(&self) -> Task {
        match self {
            ValidityRecord::Gap(gap) => gap.task,
            ValidityRecord::Row(row) => row.task,
        }
    }

    pub fn aggregate_no(&self) -> i32 {
        match self {
            ValidityRecord::Gap(gap) => gap.aggregate_no,
            ValidityRecord::Row(row) => row.aggregate_no,
        }
    }

    pub fn set_aggregate_no(&mut self, aggregate_no: i32) {
        match self {
            ValidityRecord::Gap(gap) => gap.aggregate_no = aggregate_no,
            ValidityRecord::Row(row) => row.aggregate_no = aggregate_no,
        }
    }

    pub fn seq_no(&self) -> u32 {
        self.row().map_or(0, |row| row.seq_no)
    }

    pub fn creation_date(&self) -> Timestamp {
        self.row()
            .map_or_else(beginning_of_time, |row| row.creation_date)
    }

    pub fn db_index(&self) -> Option<usize> {
        match self {
            ValidityRecord::Gap(gap) => gap.db_index,
            ValidityRecord::Row(row) => row.db_index,
        }
    }

    pub fn set_time_window(&mut self, start: Timestamp, end: Timestamp) {
        self.range_mut().set_time_window(start, end);
    }

    pub fn and_time_window(&mut self, start: Timestamp, end: Timestamp) {
        self.range_mut().and_time_window(start, end);
    }

    // Candidates must arrive in strictly descending priority.
    pub fn trim(&mut self, query_time: Timestamp, other: &ValidityRow) -> Result<(), ValidityError> {
        if self.aggregate_no() != other.aggregate_no {
            return Err(ValidityError::AggregateMismatch {
                expected: self.aggregate_no(),
                found: other.aggregate_no,
            });
        }

        let ValidityRecord::Gap(gap) = self else {
            return Ok(());
        };

        let start = gap.range.time_start;
        let end = gap.range.time_end;
        let other_start = other.range.time_start;
        let other_end = other.range.time_end;

        if other_start <= query_time && other_end > query_time {
            let mut adopted = other.clone();
            adopted
                .range
                .set_time_window(start.max(other_start), end.min(other_end));
            *self = ValidityRecord::Row(adopted);
        } else if other_end <= query_time {
            if start < other_end {
                gap.range.time_start = other_end;
            }
        } else if other_start > query_time && end > other_start {
            gap.range.time_end = other_start;
        }

        Ok(())
    }

    pub fn has_expired(&self, other: &ValidityRecord) -> bool {
        let this = self.range();
        let that = other.range();
        other.task() == self.task()
            && this.masks_overlap(that)
            && (that.time_start >= this.time_end || that.time_end <= this.time_start)
    }

    pub fn has_expired_for(&self, context: &ValidityContext, task: Task) -> bool {
        let range = self.range();
        task == self.task()
            && range.accepts(context)
            && (context.timestamp >= range.time_end || context.timestamp < range.time_start)
    }

    pub fn is_compatible(&self, context: &ValidityContext, task: Task) -> bool {
        task == self.task() && self.range().is_compatible(context)
    }

    pub fn cache_name(&self) -> String {
        cache_name_for(self.seq_no(), self.seq_no(), &self.creation_date())
    }
}

impl From<ValidityRow> for ValidityRecord {
    fn from(row: ValidityRow) -> Self {
        ValidityRecord::Row(row)
    }
}

impl fmt::Display for ValidityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SeqNo: {}  AggNo: {}  DbNo: {}",
            self.seq_no(),
            self.aggregate_no(),
            self.db_index()
                .map(|index| index.to_string())
                .unwrap_or_else(|| "-1".to_string())
        )?;
        if self.is_gap() {
            f.write_str(" (gap)")?;
        }
        let epoch = self.row().map_or(0, |row| row.epoch);
        write!(
            f,
            "  Range: {} Epoch: {} Task: {}",
            self.range(),
            epoch,
            self.task()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validity::end_of_time;
    use chrono::{Duration, TimeZone, Utc};

    fn ts(seconds: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(seconds)
    }

    fn row(seq_no: u32, start: i64, end: i64, created: i64) -> ValidityRow {
        ValidityRow::new(
            ValidityRange::new(0x01, 0x01, ts(start), ts(end), "test"),
            1,
            1,
            seq_no,
            ts(created),
        )
    }

    fn open_gap() -> ValidityRecord {
        ValidityRecord::gap(
            ValidityRange::new(0x01, 0x01, beginning_of_time(), end_of_time(), "gap"),
            1,
            1,
        )
    }

    #[test]
    fn creation_date_scheme_prefers_newest() {
        let older = row(1, 0, 10, 100);
        let newer = row(2, 0, 10, 200);
        assert!(newer.is_higher_priority(&older, PriorityScheme::CreationDate));
        assert!(!older.is_higher_priority(&newer, PriorityScheme::CreationDate));
    }

    #[test]
    fn epoch_scheme_orders_by_epoch_then_start_then_insert_date() {
        let mut a = row(1, 0, 10, 500);
        let mut b = row(2, 5, 10, 100);
        a.epoch = 2;
        b.epoch = 1;
        assert!(a.is_higher_priority(&b, PriorityScheme::Epoch));

        b.epoch = 2;
        assert!(b.is_higher_priority(&a, PriorityScheme::Epoch));

        b.range.time_start = a.range.time_start;
        a.insert_date = ts(50);
        b.insert_date = ts(40);
        assert!(a.is_higher_priority(&b, PriorityScheme::Epoch));
        assert!(!b.is_higher_priority(&a, PriorityScheme::Epoch));
    }

    #[test]
    fn priority_ties_break_on_sequence_number() {
        let a = row(7, 0, 10, 100);
        let b = row(9, 0, 10, 100);
        for scheme in [PriorityScheme::CreationDate, PriorityScheme::Epoch] {
            assert!(b.is_higher_priority(&a, scheme));
            assert!(!a.is_higher_priority(&b, scheme));
            assert!(!a.is_higher_priority(&a, scheme));
        }
    }

    #[test]
    fn trim_adopts_bracketing_record_inside_gap_bounds() {
        let mut vrec = open_gap();
        vrec.trim(ts(25), &row(1, 10, 20, 300)).expect("trim");
        assert!(vrec.is_gap());
        assert_eq!(vrec.range().time_start, ts(20));

        vrec.trim(ts(25), &row(2, 0, 30, 100)).expect("trim");
        assert!(!vrec.is_gap());
        assert_eq!(vrec.seq_no(), 2);
        assert_eq!(vrec.range().time_start, ts(20));
        assert_eq!(vrec.range().time_end, ts(30));
    }

    #[test]
    fn trim_narrows_end_with_later_records() {
        let mut vrec = open_gap();
        vrec.trim(ts(5), &row(1, 10, 20, 300)).expect("trim");
        assert!(vrec.is_gap());
        assert_eq!(vrec.range().time_end, ts(10));
        assert_eq!(vrec.range().time_start, beginning_of_time());
    }

    #[test]
    fn trim_ignores_candidates_once_committed() {
        let mut vrec = open_gap();
        vrec.trim(ts(15), &row(1, 10, 20, 300)).expect("trim");
        let committed = vrec.clone();
        vrec.trim(ts(15), &row(2, 0, 30, 100)).expect("trim");
        assert_eq!(vrec, committed);
    }

    #[test]
    fn trim_result_lies_within_both_windows() {
        let mut vrec = ValidityRecord::gap(ValidityRange::new(1, 1, ts(12), ts(18), "gap"), 1, 1);
        let candidate = row(4, 10, 20, 100);
        vrec.trim(ts(14), &candidate).expect("trim");
        let range = vrec.range();
        assert!(range.time_start >= ts(12) && range.time_start >= candidate.range.time_start);
        assert!(range.time_end <= ts(18) && range.time_end <= candidate.range.time_end);
    }

    #[test]
    fn trim_never_adopts_non_overlapping_content() {
        let mut vrec = open_gap();
        for candidate in [row(1, 0, 10, 100), row(2, 30, 40, 100)] {
            vrec.trim(ts(20), &candidate).expect("trim");
            assert!(vrec.is_gap());
        }
        assert_eq!(vrec.range().time_start, ts(10));
        assert_eq!(vrec.range().time_end, ts(30));
    }

    #[test]
    fn trim_rejects_mismatched_aggregates() {
        let mut vrec = open_gap();
        let mut other = row(1, 0, 10, 100);
        other.aggregate_no = 3;
        let err = vrec.trim(ts(5), &other).expect_err("mismatch");
        assert_eq!(
            err,
            ValidityError::AggregateMismatch {
                expected: 1,
                found: 3
            }
        );
    }

    #[test]
    fn expiry_requires_same_task_overlapping_masks_and_disjoint_window() {
        let cached: ValidityRecord = row(1, 10, 20, 100).into();
        let later: ValidityRecord = row(2, 20, 30, 100).into();
        let overlapping: ValidityRecord = row(3, 15, 30, 100).into();
        assert!(cached.has_expired(&later));
        assert!(!cached.has_expired(&overlapping));

        let mut other_task = row(4, 20, 30, 100);
        other_task.task = 2;
        assert!(!cached.has_expired(&other_task.into()));
    }

    #[test]
    fn context_expiry_and_compatibility_are_complementary_in_time() {
        let cached: ValidityRecord = row(1, 10, 20, 100).into();
        let inside = ValidityContext::new(0x01, 0x01, ts(15));
        let after = ValidityContext::new(0x01, 0x01, ts(20));
        assert!(cached.is_compatible(&inside, 1));
        assert!(!cached.has_expired_for(&inside, 1));
        assert!(!cached.is_compatible(&after, 1));
        assert!(cached.has_expired_for(&after, 1));
        assert!(!cached.is_compatible(&inside, 2));
    }

    #[test]
    fn cache_names_collapse_identical_bounds() {
        let vrec: ValidityRecord = row(12, 0, 10, 0).into();
        assert_eq!(vrec.cache_name(), "12_2026-02-23_14_00_00");
        assert_eq!(cache_name_for(3, 9, &ts(0)), "3_9_2026-02-23_14_00_00");
    }

    #[test]
    fn validity_record_survives_json() {
        let vrec: ValidityRecord = row(5, 0, 10, 0).into();
        let json = serde_json::to_string(&vrec).expect("encode");
        let decoded: ValidityRecord = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, vrec);
    }
}
