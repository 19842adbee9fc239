use crate::row_stream::InRowStream;
use crate::StorageError;
use cdb_core::{
    beginning_of_time, cache_name_for, end_of_time, format_db_time, PriorityScheme,
    RollbackDates, Task, Timestamp, ValidityContext, ValidityError, ValidityRange,
    ValidityRecord, ValidityRow, AGGREGATE_NONE,
};
use chrono::Duration;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeMap;
use tracing::debug;

pub fn read_validity_row(rs: &mut InRowStream) -> ValidityRow {
    let has_epoch = rs.has_epoch();
    let seq_no: u32 = rs.read();
    let time_start: Timestamp = rs.read();
    let time_end: Timestamp = rs.read();
    let (epoch, reality) = if has_epoch {
        (rs.read::<u32>(), rs.read::<u32>())
    } else {
        (0, 0)
    };
    let detector_mask: i32 = rs.read();
    let sim_mask: i32 = rs.read();
    let task: Task = rs.read();
    let aggregate_no: i32 = rs.read();
    let creation_date: Timestamp = rs.read();
    let insert_date: Timestamp = rs.read();

    let source = match rs.db_index() {
        Some(db_index) => format!("{}@{db_index}", rs.table_name()),
        None => rs.table_name().to_string(),
    };
    ValidityRow {
        seq_no,
        aggregate_no,
        task,
        epoch,
        reality,
        db_index: rs.db_index(),
        creation_date,
        insert_date,
        range: ValidityRange::new(detector_mask, sim_mask, time_start, time_end, source),
    }
}

#[derive(Debug, Clone, Default)]
pub struct VldQuery<'a> {
    pub time_gate: Option<Duration>,
    pub rollback: Option<&'a RollbackDates>,
    pub context_sql: &'a str,
}

pub fn query_validity_rows(
    conn: &Connection,
    table_name: &str,
    context: &ValidityContext,
    task: Task,
    options: &VldQuery<'_>,
    db_index: usize,
) -> Result<Vec<ValidityRow>, StorageError> {
    let table = table_name.to_uppercase();
    let vld_table = format!("{table}VLD");
    let mut sql = format!(
        "SELECT * FROM {vld_table} WHERE TASK = ?1 AND (DETECTORMASK & ?2) != 0 AND (SIMMASK & ?3) != 0"
    );
    let mut params: Vec<Value> = vec![
        Value::Integer(i64::from(task)),
        Value::Integer(i64::from(context.detector)),
        Value::Integer(i64::from(context.sim_flag)),
    ];

    if let Some(gate) = options.time_gate {
        let (start, end) = gate_window(context.timestamp, Some(gate));
        params.push(Value::Text(format_db_time(&end)));
        sql.push_str(&format!(" AND TIMESTART < ?{}", params.len()));
        params.push(Value::Text(format_db_time(&start)));
        sql.push_str(&format!(" AND TIMEEND > ?{}", params.len()));
    }

    if let Some(rollback) = options.rollback {
        if let Some(date) = rollback.date_for(&table) {
            params.push(Value::Text(format_db_time(&date)));
            sql.push_str(&format!(
                " AND {} <= ?{}",
                rollback.type_for(&table).column(),
                params.len()
            ));
        }
    }

    if !options.context_sql.trim().is_empty() {
        sql.push_str(&format!(" AND ({})", options.context_sql.trim()));
    }
    sql.push_str(" ORDER BY SEQNO");

    let mut rs = InRowStream::query(
        conn,
        &sql,
        params_from_iter(params),
        &vld_table,
        Some(db_index),
    )?;
    let mut rows = Vec::with_capacity(rs.num_rows());
    while rs.fetch_row() {
        rows.push(read_validity_row(&mut rs));
    }
    Ok(rows)
}

fn gate_window(ts: Timestamp, gate: Option<Duration>) -> (Timestamp, Timestamp) {
    match gate {
        Some(gate) => (
            ts.checked_sub_signed(gate)
                .unwrap_or_else(beginning_of_time)
                .max(beginning_of_time()),
            ts.checked_add_signed(gate)
                .unwrap_or_else(end_of_time)
                .min(end_of_time()),
        ),
        None => (beginning_of_time(), end_of_time()),
    }
}

#[derive(Debug, Clone)]
pub struct ValidityRecordBuilder {
    context: ValidityContext,
    task: Task,
    scheme: PriorityScheme,
    time_gate: Option<Duration>,
    extended_context: bool,
    accumulators: BTreeMap<i32, ValidityRecord>,
}

impl ValidityRecordBuilder {
    pub fn new(
        context: ValidityContext,
        task: Task,
        scheme: PriorityScheme,
        time_gate: Option<Duration>,
    ) -> Self {
        let mut builder = Self {
            context,
            task,
            scheme,
            time_gate,
            extended_context: false,
            accumulators: BTreeMap::new(),
        };
        let gap = builder.initial_gap(AGGREGATE_NONE);
        builder.accumulators.insert(AGGREGATE_NONE, gap);
        builder
    }

    pub fn with_extended_context(mut self, extended: bool) -> Self {
        self.extended_context = extended;
        self
    }

    fn initial_gap(&self, aggregate_no: i32) -> ValidityRecord {
        let (start, end) = gate_window(self.context.timestamp, self.time_gate);
        ValidityRecord::gap(
            ValidityRange::new(
                self.context.detector,
                self.context.sim_flag,
                start,
                end,
                "gap",
            ),
            self.task,
            aggregate_no,
        )
    }

    pub fn context(&self) -> &ValidityContext {
        &self.context
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn is_extended_context(&self) -> bool {
        self.extended_context
    }

    // Sources must be added in cascade order, highest priority first.
    pub fn add_source(&mut self, mut rows: Vec<ValidityRow>) -> Result<(), ValidityError> {
        let scheme = self.scheme;
        rows.sort_by(|a, b| b.priority_cmp(a, scheme));
        for row in rows {
            if row.task != self.task || !row.range.accepts(&self.context) {
                continue;
            }
            if !self.accumulators.contains_key(&row.aggregate_no) {
                let gap = self.initial_gap(row.aggregate_no);
                self.accumulators.insert(row.aggregate_no, gap);
            }
            if let Some(accumulator) = self.accumulators.get_mut(&row.aggregate_no) {
                accumulator.trim(self.context.timestamp, &row)?;
            }
        }
        debug!(
            event = "validity_source_added",
            context = %self.context,
            records = self.accumulators.len()
        );
        Ok(())
    }

    pub fn is_aggregated(&self) -> bool {
        self.accumulators.keys().any(|aggregate_no| *aggregate_no >= 0)
    }

    pub fn non_aggregated(&self) -> bool {
        !self.is_aggregated()
    }

    pub fn num_validity_records(&self) -> usize {
        self.accumulators.len()
    }

    pub fn validity_record(&self, idx: usize) -> Option<&ValidityRecord> {
        self.accumulators.values().nth(idx)
    }

    pub fn non_aggregated_record(&self) -> Option<&ValidityRecord> {
        self.accumulators.get(&AGGREGATE_NONE)
    }

    pub fn aggregated_records(&self) -> Vec<ValidityRecord> {
        self.accumulators
            .range(0..)
            .map(|(_, vrec)| vrec.clone())
            .collect()
    }

    pub fn cache_name(&self) -> Option<String> {
        if self.extended_context {
            return None;
        }
        let rows: Vec<&ValidityRow> = if self.is_aggregated() {
            self.accumulators
                .range(0..)
                .filter_map(|(_, vrec)| vrec.row())
                .collect()
        } else {
            self.non_aggregated_record()
                .and_then(ValidityRecord::row)
                .into_iter()
                .collect()
        };
        let seq_lo = rows.iter().map(|row| row.seq_no).min()?;
        let seq_hi = rows.iter().map(|row| row.seq_no).max()?;
        let created = rows.iter().map(|row| row.creation_date).max()?;
        Some(cache_name_for(seq_lo, seq_hi, &created))
    }
}

pub fn create_vld_table(conn: &Connection, table_name: &str) -> Result<(), StorageError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {}VLD (
            SEQNO INTEGER NOT NULL PRIMARY KEY,
            TIMESTART TEXT NOT NULL,
            TIMEEND TEXT NOT NULL,
            EPOCH INTEGER,
            REALITY INTEGER,
            DETECTORMASK INTEGER,
            SIMMASK INTEGER,
            TASK INTEGER,
            AGGREGATENO INTEGER,
            CREATIONDATE TEXT NOT NULL,
            INSERTDATE TEXT NOT NULL
        );
        ",
        table_name.to_uppercase()
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rusqlite::params;

    fn ts(seconds: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(seconds)
    }

    fn row(seq_no: u32, aggregate_no: i32, start: i64, end: i64, created: i64) -> ValidityRow {
        let mut row = ValidityRow::new(
            ValidityRange::new(1, 1, ts(start), ts(end), "test"),
            1,
            aggregate_no,
            seq_no,
            ts(created),
        );
        row.db_index = Some(0);
        row
    }

    fn builder(at: i64) -> ValidityRecordBuilder {
        ValidityRecordBuilder::new(
            ValidityContext::new(1, 1, ts(at)),
            1,
            PriorityScheme::CreationDate,
            None,
        )
    }

    #[test]
    fn higher_priority_row_wins_regardless_of_input_order() {
        let mut vrb = builder(15);
        vrb.add_source(vec![row(1, -1, 0, 30, 100), row(2, -1, 10, 20, 200)])
            .expect("add");
        let vrec = vrb.non_aggregated_record().expect("record");
        assert_eq!(vrec.seq_no(), 2);
        assert_eq!(vrec.range().time_start, ts(10));
        assert_eq!(vrec.range().time_end, ts(20));
        assert!(vrb.non_aggregated());
        assert_eq!(vrb.cache_name().as_deref(), Some("2_2026-02-23_14_03_20"));
    }

    #[test]
    fn earlier_source_shadows_later_source() {
        let mut vrb = builder(25);
        vrb.add_source(vec![row(1, -1, 10, 20, 100)]).expect("source 0");
        vrb.add_source(vec![row(2, -1, 0, 30, 500)]).expect("source 1");
        let vrec = vrb.non_aggregated_record().expect("record");
        assert_eq!(vrec.seq_no(), 2);
        assert_eq!(vrec.range().time_start, ts(20));
        assert_eq!(vrec.range().time_end, ts(30));
    }

    #[test]
    fn rows_for_other_tasks_or_masks_are_ignored() {
        let mut vrb = builder(5);
        let mut other_task = row(1, -1, 0, 10, 100);
        other_task.task = 2;
        let mut other_mask = row(2, -1, 0, 10, 100);
        other_mask.range.detector_mask = 0x4;
        vrb.add_source(vec![other_task, other_mask]).expect("add");
        assert!(vrb.non_aggregated_record().expect("record").is_gap());
        assert_eq!(vrb.cache_name(), None);
    }

    #[test]
    fn aggregates_get_one_accumulator_each() {
        let mut vrb = builder(15);
        vrb.add_source(vec![
            row(8, 2, 10, 40, 100),
            row(5, 0, 0, 30, 300),
            row(2, 1, 5, 20, 200),
            row(9, 1, 20, 30, 900),
        ])
        .expect("add");
        assert!(vrb.is_aggregated());
        let records = vrb.aggregated_records();
        let seqs: Vec<u32> = records.iter().map(ValidityRecord::seq_no).collect();
        assert_eq!(seqs, vec![5, 2, 8]);
        assert_eq!(records[1].range().time_end, ts(20));
        assert_eq!(vrb.num_validity_records(), 4);
        assert_eq!(vrb.validity_record(1).map(ValidityRecord::seq_no), Some(5));
        assert_eq!(vrb.cache_name().as_deref(), Some("2_8_2026-02-23_14_05_00"));
    }

    #[test]
    fn time_gate_bounds_the_initial_gap() {
        let vrb = ValidityRecordBuilder::new(
            ValidityContext::new(1, 1, ts(100)),
            1,
            PriorityScheme::Epoch,
            Some(Duration::seconds(50)),
        );
        let gap = vrb.non_aggregated_record().expect("gap");
        assert_eq!(gap.range().time_start, ts(50));
        assert_eq!(gap.range().time_end, ts(150));
        assert!(vrb.clone().with_extended_context(true).cache_name().is_none());
    }

    #[test]
    fn query_applies_gate_and_rollback() {
        let conn = Connection::open_in_memory().expect("conn");
        create_vld_table(&conn, "Calib").expect("vld");
        let insert = "INSERT INTO CALIBVLD VALUES (?1, ?2, ?3, 0, 0, 1, 1, 1, -1, ?4, ?4)";
        for (seq, start, end, created) in [(1, 0, 100, 10), (2, 0, 100, 5000), (3, 900, 1000, 10)] {
            conn.execute(
                insert,
                params![
                    seq,
                    format_db_time(&ts(start)),
                    format_db_time(&ts(end)),
                    format_db_time(&ts(created))
                ],
            )
            .expect("insert");
        }

        let mut rollback = RollbackDates::new();
        rollback
            .set_date("CALIB*", &format_db_time(&ts(1000)))
            .expect("rollback");
        let options = VldQuery {
            time_gate: Some(Duration::seconds(200)),
            rollback: Some(&rollback),
            context_sql: "",
        };
        let rows = query_validity_rows(
            &conn,
            "Calib",
            &ValidityContext::new(1, 1, ts(50)),
            1,
            &options,
            3,
        )
        .expect("query");
        let seqs: Vec<u32> = rows.iter().map(|row| row.seq_no).collect();
        assert_eq!(seqs, vec![1]);
        assert_eq!(rows[0].db_index, Some(3));
        assert_eq!(rows[0].range.time_end, ts(100));

        let all = query_validity_rows(
            &conn,
            "CALIB",
            &ValidityContext::new(1, 1, ts(50)),
            1,
            &VldQuery::default(),
            0,
        )
        .expect("query");
        assert_eq!(all.len(), 3);

        let filtered = query_validity_rows(
            &conn,
            "CALIB",
            &ValidityContext::new(1, 1, ts(50)),
            1,
            &VldQuery {
                context_sql: "SEQNO > 2",
                ..VldQuery::default()
            },
            0,
        )
        .expect("query");
        assert_eq!(filtered.len(), 1);
    }
}
