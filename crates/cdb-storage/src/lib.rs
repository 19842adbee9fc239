use cdb_core::ValidityError;
use thiserror::Error;

pub mod cache;
pub mod cascade;
pub mod codec;
pub mod config;
pub mod config_set;
pub mod connection;
pub mod query;
pub mod result_set;
pub mod row_stream;
pub mod table_row;
pub mod validity_builder;
pub mod writer;

pub use cache::{Cache, CacheStats};
pub use cascade::{Cascade, DbStatus, SeqNoScope, TableLock};
pub use codec::{L2Cache, PersistedResult};
pub use config::{CascadeConfig, DatabaseConfig};
pub use config_set::ConfigSet;
pub use connection::DbConnection;
pub use query::{QuerySettings, TableProxy};
pub use result_set::{AggregateResult, ResultSet, SingleSourceResult};
pub use row_stream::{ColumnValue, InRowStream, OutRowStream};
pub use table_row::TableRow;
pub use validity_builder::ValidityRecordBuilder;
pub use writer::Writer;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("validity error: {0}")]
    Validity(#[from] ValidityError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("cascade entry {0} is not available")]
    Unavailable(usize),
    #[error("no cascade entry holds a GLOBALSEQNO table for {0}")]
    NoGlobalAuthority(String),
    #[error("sequence numbers exhausted for {table} in cascade entry {db_index}")]
    SeqNoExhausted { table: String, db_index: usize },
    #[error("failed to lock {tables}: {reason}")]
    LockFailed { tables: String, reason: String },
    #[error("table {0} not found in cascade")]
    UnknownTable(String),
    #[error("writer is not open")]
    WriterClosed,
    #[error("writer rejected row: {0}")]
    WriterRejected(String),
    #[error("invalid temporary table definition: {0}")]
    InvalidTempTable(String),
}
