use crate::row_stream::{InRowStream, OutRowStream};
use cdb_core::{ValidityRecord, AGGREGATE_NONE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

pub trait TableRow: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static {
    const ROW_NAME: &'static str;

    fn create_empty() -> Self;

    fn fill(&mut self, rs: &mut InRowStream, validity: Option<&ValidityRecord>);

    fn store(&self, out: &mut OutRowStream, validity: Option<&ValidityRecord>);

    fn index(&self, default: u32) -> u32 {
        default
    }

    fn aggregate_no(&self) -> i32 {
        AGGREGATE_NONE
    }
}
