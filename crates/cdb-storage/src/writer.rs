use crate::cascade::{Cascade, SeqNoScope, TableLock};
use crate::row_stream::OutRowStream;
use crate::table_row::TableRow;
use crate::validity_builder::create_vld_table;
use crate::StorageError;
use cdb_core::{
    format_db_time, Task, Timestamp, ValidityRange, ValidityRecord, ValidityRow, AGGREGATE_NONE,
};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info, warn};

// Creates `<TABLE>VLD` and `<TABLE>`; `columns_sql` lists the user columns
// that follow SEQNO and ROW_COUNTER.
pub fn create_table_pair(
    conn: &Connection,
    table_name: &str,
    columns_sql: &str,
) -> Result<(), StorageError> {
    create_vld_table(conn, table_name)?;
    let table = table_name.to_uppercase();
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {table} (
            SEQNO INTEGER NOT NULL,
            ROW_COUNTER INTEGER NOT NULL,
            {columns_sql},
            PRIMARY KEY (SEQNO, ROW_COUNTER)
        );
        "
    ))?;
    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let stmt = conn.prepare(&format!("SELECT * FROM {table} LIMIT 0"))?;
    let names = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_uppercase())
        .collect();
    Ok(names)
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug)]
pub struct Writer<R: TableRow> {
    table_name: String,
    range: ValidityRange,
    aggregate_no: i32,
    task: Task,
    creation_date: Timestamp,
    epoch: u32,
    db_index: usize,
    scope: SeqNoScope,
    rows: Vec<R>,
    open: bool,
}

impl<R: TableRow> Writer<R> {
    pub fn open(
        table_name: &str,
        range: ValidityRange,
        aggregate_no: i32,
        task: Task,
        creation_date: Timestamp,
        db_index: usize,
    ) -> Self {
        debug!(
            event = "writer_opened",
            table = table_name,
            aggregate_no,
            task,
            db_index
        );
        Self {
            table_name: table_name.to_uppercase(),
            range,
            aggregate_no,
            task,
            creation_date,
            epoch: 0,
            db_index,
            scope: SeqNoScope::default(),
            rows: Vec::new(),
            open: true,
        }
    }

    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn set_seq_no_scope(&mut self, scope: SeqNoScope) {
        self.scope = scope;
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn push(&mut self, row: R) -> Result<(), StorageError> {
        if !self.open {
            return Err(StorageError::WriterClosed);
        }
        let row_aggregate = row.aggregate_no();
        if row_aggregate != AGGREGATE_NONE
            && self.aggregate_no != AGGREGATE_NONE
            && row_aggregate != self.aggregate_no
        {
            warn!(
                event = "writer_row_rejected",
                table = %self.table_name,
                set_aggregate_no = self.aggregate_no,
                row_aggregate_no = row_aggregate
            );
            return Err(StorageError::WriterRejected(format!(
                "row aggregate {row_aggregate} does not match set aggregate {}",
                self.aggregate_no
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn abort(&mut self) {
        if self.open {
            debug!(event = "writer_aborted", table = %self.table_name, rows = self.rows.len());
        }
        self.rows.clear();
        self.open = false;
    }

    // Allocates the sequence number, then writes the VLD row and every data
    // row in a single transaction.
    pub fn close(&mut self, cascade: &mut Cascade) -> Result<u32, StorageError> {
        if !self.open {
            return Err(StorageError::WriterClosed);
        }
        let seq_no = cascade.allocate_seq_no(&self.table_name, self.scope, self.db_index)?;

        let mut vrow = ValidityRow::new(
            self.range.clone(),
            self.task,
            self.aggregate_no,
            seq_no,
            self.creation_date,
        );
        vrow.epoch = self.epoch;
        vrow.insert_date = Utc::now();
        vrow.db_index = Some(self.db_index);
        let validity = ValidityRecord::Row(vrow);

        let vld_table = format!("{}VLD", self.table_name);
        let conn = cascade.connection(self.db_index)?;
        let lock = TableLock::acquire(conn, &vld_table, &self.table_name);
        lock.ensure_locked()?;
        insert_validity_row(conn, &vld_table, &validity)?;

        let mut out = OutRowStream::new();
        for (row_counter, row) in self.rows.iter().enumerate() {
            out.clear();
            out.write(i64::from(seq_no)).write(row_counter as i64 + 1);
            row.store(&mut out, Some(&validity));
            let sql = format!(
                "INSERT INTO {} VALUES ({})",
                self.table_name,
                placeholders(out.len())
            );
            conn.execute(&sql, params_from_iter(out.values()))?;
        }
        lock.commit()?;

        info!(
            event = "writer_committed",
            table = %self.table_name,
            seq_no,
            db_index = self.db_index,
            rows = self.rows.len()
        );
        self.rows.clear();
        self.open = false;
        Ok(seq_no)
    }
}

fn insert_validity_row(
    conn: &Connection,
    vld_table: &str,
    validity: &ValidityRecord,
) -> Result<(), StorageError> {
    let Some(row) = validity.row() else {
        return Ok(());
    };
    let mut columns = vec!["SEQNO", "TIMESTART", "TIMEEND"];
    let mut values = vec![
        Value::Integer(i64::from(row.seq_no)),
        Value::Text(format_db_time(&row.range.time_start)),
        Value::Text(format_db_time(&row.range.time_end)),
    ];
    if column_names(conn, vld_table)?.iter().any(|name| name == "EPOCH") {
        columns.extend(["EPOCH", "REALITY"]);
        values.push(Value::Integer(i64::from(row.epoch)));
        values.push(Value::Integer(i64::from(row.reality)));
    }
    columns.extend([
        "DETECTORMASK",
        "SIMMASK",
        "TASK",
        "AGGREGATENO",
        "CREATIONDATE",
        "INSERTDATE",
    ]);
    values.extend([
        Value::Integer(i64::from(row.range.detector_mask)),
        Value::Integer(i64::from(row.range.sim_mask)),
        Value::Integer(i64::from(row.task)),
        Value::Integer(i64::from(row.aggregate_no)),
        Value::Text(format_db_time(&row.creation_date)),
        Value::Text(format_db_time(&row.insert_date)),
    ]);

    let sql = format!(
        "INSERT INTO {vld_table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders(values.len())
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}
