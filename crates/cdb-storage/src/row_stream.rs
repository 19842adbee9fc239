use crate::StorageError;
use cdb_core::{beginning_of_time, format_db_time, parse_db_time, Timestamp};
use chrono::{TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, Params};
use tracing::{debug, error};

pub trait ColumnValue: Sized {
    const TYPE_NAME: &'static str;

    fn undefined() -> Self;

    fn from_value(value: &Value) -> Option<Self>;
}

impl ColumnValue for i64 {
    const TYPE_NAME: &'static str = "long";

    fn undefined() -> Self {
        -999_999
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(*v),
            Value::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl ColumnValue for i32 {
    const TYPE_NAME: &'static str = "int";

    fn undefined() -> Self {
        -999_999
    }

    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|v| i32::try_from(v).ok())
    }
}

impl ColumnValue for u32 {
    const TYPE_NAME: &'static str = "unsigned int";

    fn undefined() -> Self {
        0
    }

    // Unsigned columns may be stored signed; reinterpret the low 32 bits.
    fn from_value(value: &Value) -> Option<Self> {
        let signed = i64::from_value(value)?;
        if signed < 0 {
            i32::try_from(signed).ok().map(|v| v as u32)
        } else {
            u32::try_from(signed).ok()
        }
    }
}

impl ColumnValue for f64 {
    const TYPE_NAME: &'static str = "double";

    fn undefined() -> Self {
        -999_999.0
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl ColumnValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn undefined() -> Self {
        false
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(*v != 0),
            Value::Text(text) => match text.trim().to_uppercase().as_str() {
                "1" | "Y" | "T" | "TRUE" => Some(true),
                "0" | "N" | "F" | "FALSE" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl ColumnValue for String {
    const TYPE_NAME: &'static str = "string";

    fn undefined() -> Self {
        String::new()
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(String::new()),
            Value::Integer(v) => Some(v.to_string()),
            Value::Real(v) => Some(v.to_string()),
            Value::Text(text) => Some(text.clone()),
            Value::Blob(_) => None,
        }
    }
}

impl ColumnValue for Timestamp {
    const TYPE_NAME: &'static str = "date";

    fn undefined() -> Self {
        beginning_of_time()
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(text) => parse_db_time(text).ok(),
            Value::Integer(v) => Utc.timestamp_opt(*v, 0).single(),
            _ => None,
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => v.to_string(),
        Value::Text(text) => text.clone(),
        Value::Blob(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Integer(_) => "integer",
        Value::Real(_) => "real",
        Value::Text(_) => "text",
        Value::Blob(_) => "blob",
    }
}

#[derive(Debug, Clone)]
pub struct InRowStream {
    table_name: String,
    db_index: Option<usize>,
    fill_opts: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    cur_row: usize,
    cur_col: usize,
}

impl InRowStream {
    pub fn query<P: Params>(
        conn: &Connection,
        sql: &str,
        params: P,
        table_name: &str,
        db_index: Option<usize>,
    ) -> Result<Self, StorageError> {
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_uppercase())
            .collect();
        let count = columns.len();
        let rows = stmt
            .query_map(params, |row| {
                (0..count)
                    .map(|idx| row.get::<_, Value>(idx))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            event = "row_stream_query",
            table = table_name,
            db_index = ?db_index,
            rows = rows.len(),
            sql
        );
        Ok(Self::from_rows(table_name, columns, rows, db_index))
    }

    pub fn from_rows(
        table_name: impl Into<String>,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        db_index: Option<usize>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            db_index,
            fill_opts: String::new(),
            columns,
            rows,
            cur_row: 0,
            cur_col: 1,
        }
    }

    pub fn with_fill_opts(mut self, fill_opts: impl Into<String>) -> Self {
        self.fill_opts = fill_opts.into();
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn db_index(&self) -> Option<usize> {
        self.db_index
    }

    pub fn fill_opts(&self) -> &str {
        &self.fill_opts
    }

    pub fn is_vld_table(&self) -> bool {
        self.table_name.to_uppercase().ends_with("VLD")
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|col| col.eq_ignore_ascii_case(name))
    }

    pub fn has_epoch(&self) -> bool {
        self.has_column("EPOCH")
    }

    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn col_name(&self, col: usize) -> &str {
        col.checked_sub(1)
            .and_then(|idx| self.columns.get(idx))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn is_before_first(&self) -> bool {
        self.cur_row == 0
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_empty() || self.cur_row > self.rows.len()
    }

    pub fn cur_row_num(&self) -> usize {
        self.cur_row
    }

    pub fn cur_col_num(&self) -> usize {
        self.cur_col
    }

    pub fn cur_col_name(&self) -> &str {
        self.col_name(self.cur_col)
    }

    pub fn cur_col_type(&self) -> &'static str {
        self.current_row()
            .and_then(|row| row.get(self.cur_col.saturating_sub(1)))
            .map(value_type)
            .unwrap_or("null")
    }

    pub fn increment_cur_col(&mut self) {
        self.cur_col += 1;
    }

    pub fn decrement_cur_col(&mut self) {
        if self.cur_col > 1 {
            self.cur_col -= 1;
        }
    }

    pub fn fetch_row(&mut self) -> bool {
        self.cur_col = 1;
        if self.is_exhausted() {
            return false;
        }
        self.cur_row += 1;
        !self.is_exhausted()
    }

    fn current_row(&self) -> Option<&Vec<Value>> {
        self.cur_row
            .checked_sub(1)
            .and_then(|idx| self.rows.get(idx))
    }

    pub fn read<T: ColumnValue>(&mut self) -> T {
        let col = self.cur_col;
        self.cur_col += 1;

        let Some(value) = self
            .current_row()
            .and_then(|row| row.get(col.saturating_sub(1)))
        else {
            error!(
                event = "row_stream_missing_column",
                table = %self.table_name,
                row = self.cur_row,
                column = col,
                num_cols = self.columns.len(),
                num_rows = self.rows.len()
            );
            return T::undefined();
        };

        match T::from_value(value) {
            Some(parsed) => parsed,
            None => {
                error!(
                    event = "row_stream_incompatible_value",
                    table = %self.table_name,
                    row = self.cur_row,
                    column = col,
                    name = self.col_name(col),
                    value = %value_text(value),
                    stored_type = value_type(value),
                    user_type = T::TYPE_NAME
                );
                T::undefined()
            }
        }
    }

    pub fn row_as_csv(&self) -> String {
        let Some(row) = self.current_row() else {
            return String::new();
        };
        row.iter()
            .map(|value| match value {
                Value::Null => "NULL".to_string(),
                Value::Text(text) => format!("'{}'", text.replace('\'', "\\'")),
                Value::Blob(_) => format!("'{}'", value_text(value)),
                other => value_text(other),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutRowStream {
    values: Vec<Value>,
}

impl OutRowStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: impl Into<Value>) -> &mut Self {
        self.values.push(value.into());
        self
    }

    pub fn write_timestamp(&mut self, ts: &Timestamp) -> &mut Self {
        self.values.push(Value::Text(format_db_time(ts)));
        self
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> InRowStream {
        InRowStream::from_rows(
            "CALIB",
            vec!["SEQNO".into(), "ROW_COUNTER".into(), "GAIN".into(), "LABEL".into()],
            vec![
                vec![
                    Value::Integer(7),
                    Value::Integer(1),
                    Value::Real(1.5),
                    Value::Text("a'b".into()),
                ],
                vec![
                    Value::Integer(-1),
                    Value::Integer(2),
                    Value::Text("oops".into()),
                    Value::Null,
                ],
            ],
            Some(0),
        )
    }

    #[test]
    fn cursor_walks_rows_and_columns() {
        let mut rs = stream();
        assert!(rs.is_before_first());
        assert!(!rs.is_exhausted());
        assert!(rs.fetch_row());
        assert_eq!(rs.cur_col_name(), "SEQNO");
        assert_eq!(rs.read::<u32>(), 7);
        rs.decrement_cur_col();
        assert_eq!(rs.read::<i32>(), 7);
        assert_eq!(rs.read::<i32>(), 1);
        assert_eq!(rs.read::<f64>(), 1.5);
        assert_eq!(rs.read::<String>(), "a'b");
        assert!(rs.fetch_row());
        assert_eq!(rs.cur_col_num(), 1);
        assert!(!rs.fetch_row());
        assert!(rs.is_exhausted());
    }

    #[test]
    fn negative_values_are_reinterpreted_as_unsigned() {
        let mut rs = stream();
        rs.fetch_row();
        rs.fetch_row();
        assert_eq!(rs.read::<u32>(), u32::MAX);
    }

    #[test]
    fn incompatible_and_missing_values_are_substituted() {
        let mut rs = stream();
        rs.fetch_row();
        rs.fetch_row();
        rs.increment_cur_col();
        rs.increment_cur_col();
        assert_eq!(rs.read::<f64>(), -999_999.0);
        assert_eq!(rs.read::<String>(), "");
        assert_eq!(rs.read::<i32>(), -999_999);
    }

    #[test]
    fn row_as_csv_quotes_text_and_marks_nulls() {
        let mut rs = stream();
        assert_eq!(rs.row_as_csv(), "");
        rs.fetch_row();
        assert_eq!(rs.row_as_csv(), "7,1,1.5,'a\\'b'");
        rs.fetch_row();
        assert_eq!(rs.row_as_csv(), "-1,2,'oops',NULL");
    }

    #[test]
    fn table_metadata_is_reported() {
        let rs = stream();
        assert!(!rs.is_vld_table());
        assert!(!rs.has_epoch());
        assert_eq!(rs.num_cols(), 4);
        let vld = InRowStream::from_rows("CALIBVLD", vec!["EPOCH".into()], Vec::new(), None);
        assert!(vld.is_vld_table());
        assert!(vld.has_epoch());
        assert!(vld.is_exhausted());
    }

    #[test]
    fn query_reads_sqlite_rows() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE T (seqno INTEGER, label TEXT);
             INSERT INTO T VALUES (3, 'x'), (4, 'y');",
        )
        .expect("schema");
        let mut rs = InRowStream::query(&conn, "SELECT * FROM T ORDER BY seqno", [], "T", Some(1))
            .expect("query");
        assert_eq!(rs.num_rows(), 2);
        assert_eq!(rs.db_index(), Some(1));
        rs.fetch_row();
        assert_eq!(rs.cur_col_name(), "SEQNO");
        assert_eq!(rs.read::<u32>(), 3);
        assert_eq!(rs.read::<String>(), "x");
    }

    #[test]
    fn out_row_stream_collects_values_in_order() {
        let mut out = OutRowStream::new();
        out.write(5_i32).write(2.5_f64).write("x".to_string());
        assert_eq!(out.len(), 3);
        assert_eq!(out.values()[0], Value::Integer(5));
        assert_eq!(out.values()[2], Value::Text("x".into()));
    }
}
