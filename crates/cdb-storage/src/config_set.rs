use crate::row_stream::{InRowStream, OutRowStream};
use crate::table_row::TableRow;
use cdb_core::{ValidityRecord, AGGREGATE_NONE};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigParam {
    pub name: String,
    pub value: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSet {
    params: Vec<ConfigParam>,
    aggregate_no: i32,
}

impl Default for ConfigSet {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            aggregate_no: AGGREGATE_NONE,
        }
    }
}

impl ConfigSet {
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ConfigParam] {
        &self.params
    }

    pub fn param_name(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(|param| param.name.as_str())
    }

    pub fn param_value(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(|param| param.value.as_str())
    }

    pub fn param_type(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(|param| param.kind.as_str())
    }

    pub fn push_back(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        kind: impl Into<String>,
    ) {
        self.params.push(ConfigParam {
            name: name.into(),
            value: value.into(),
            kind: kind.into(),
        });
    }

    pub fn set_aggregate_no(&mut self, aggregate_no: i32) {
        self.aggregate_no = aggregate_no;
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }
}

impl TableRow for ConfigSet {
    const ROW_NAME: &'static str = "ConfigSet";

    fn create_empty() -> Self {
        Self::default()
    }

    fn fill(&mut self, rs: &mut InRowStream, validity: Option<&ValidityRecord>) {
        self.clear();
        self.aggregate_no = validity.map_or(AGGREGATE_NONE, ValidityRecord::aggregate_no);
        while rs.cur_col_num() <= rs.num_cols() {
            let name = rs.cur_col_name().to_string();
            let kind = rs.cur_col_type();
            let value: String = rs.read();
            self.push_back(name, value, kind);
        }
    }

    fn store(&self, out: &mut OutRowStream, _validity: Option<&ValidityRecord>) {
        for param in &self.params {
            let value = match param.kind.as_str() {
                "null" => Value::Null,
                "integer" => param
                    .value
                    .parse::<i64>()
                    .map(Value::Integer)
                    .unwrap_or_else(|_| Value::Text(param.value.clone())),
                "real" => param
                    .value
                    .parse::<f64>()
                    .map(Value::Real)
                    .unwrap_or_else(|_| Value::Text(param.value.clone())),
                _ => Value::Text(param.value.clone()),
            };
            out.write(value);
        }
    }

    fn aggregate_no(&self) -> i32 {
        self.aggregate_no
    }
}

impl fmt::Display for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, param) in self.params.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", param.name, param.value)?;
        }
        Ok(())
    }
}
