use crate::validity::{format_db_time, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VrecKey {
    pub seq_no: u32,
    pub creation_date: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub table_name: String,
    pub row_name: String,
    pub sql_qualifiers: String,
    pub vrec_keys: Vec<VrecKey>,
}

impl ResultKey {
    pub fn new(
        table_name: impl Into<String>,
        row_name: impl Into<String>,
        sql_qualifiers: impl Into<String>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            row_name: row_name.into(),
            sql_qualifiers: sql_qualifiers.into(),
            vrec_keys: Vec::new(),
        }
    }

    pub fn add_vrec_key(&mut self, seq_no: u32, creation_date: Timestamp) {
        self.vrec_keys.push(VrecKey {
            seq_no,
            creation_date,
        });
    }

    pub fn num_vrecs(&self) -> usize {
        self.vrec_keys.len()
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table: {} row: {}", self.table_name, self.row_name)?;
        if !self.sql_qualifiers.is_empty() {
            write!(f, " qualifiers: {}", self.sql_qualifiers)?;
        }
        write!(f, " validity rec keys ({}):", self.vrec_keys.len())?;
        for key in &self.vrec_keys {
            write!(
                f,
                " [{} {}]",
                key.seq_no,
                format_db_time(&key.creation_date)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    fn created() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn key(qualifiers: &str, seqs: &[u32]) -> ResultKey {
        let mut key = ResultKey::new("CALIBRATION", "CalibRow", qualifiers);
        for seq in seqs {
            key.add_vrec_key(*seq, created());
        }
        key
    }

    #[test]
    fn keys_with_same_content_compare_equal() {
        let a = key("", &[4, 9]);
        let b = key("", &[4, 9]);
        assert_eq!(a, b);
        assert_eq!(a.num_vrecs(), 2);
        let set: HashSet<ResultKey> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn qualifiers_and_order_distinguish_keys() {
        assert_ne!(key("", &[4]), key("PLANE=3", &[4]));
        assert_ne!(key("", &[4, 9]), key("", &[9, 4]));
    }

    #[test]
    fn display_lists_every_vrec_key() {
        let rendered = key("PLANE=3", &[4]).to_string();
        assert!(rendered.contains("CALIBRATION"));
        assert!(rendered.contains("PLANE=3"));
        assert!(rendered.contains("[4 2026-02-23 14:00:00]"));
    }
}
