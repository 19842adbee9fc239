pub mod qualifiers;
pub mod result_key;
pub mod rollback;
pub mod validity;
pub mod validity_rec;

pub use qualifiers::SqlQualifiers;
pub use result_key::{ResultKey, VrecKey};
pub use rollback::{RollbackDates, RollbackType};
pub use validity::{
    beginning_of_time, end_of_time, format_db_time, parse_db_time, Task, Timestamp,
    ValidityContext, ValidityError, ValidityRange, DB_DATE_FORMAT,
};
pub use validity_rec::{
    cache_name_for, Gap, PriorityScheme, ValidityRecord, ValidityRow, AGGREGATE_NONE,
    AGGREGATE_UNDEFINED,
};
