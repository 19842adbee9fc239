use crate::StorageError;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const MEMORY_URL: &str = ":memory:";

pub fn sqlite_table_exists(conn: &Connection, table_name: &str) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "
            SELECT 1 FROM sqlite_master WHERE type = 'table' AND upper(name) = upper(?1)
            UNION ALL
            SELECT 1 FROM sqlite_temp_master WHERE type = 'table' AND upper(name) = upper(?1)
            LIMIT 1
            ",
            [table_name],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Memory,
    File(PathBuf),
}

impl Location {
    fn parse(url: &str) -> Self {
        let trimmed = url.trim();
        let path = trimmed.strip_prefix("sqlite://").unwrap_or(trimmed);
        if path == MEMORY_URL {
            Location::Memory
        } else {
            Location::File(PathBuf::from(path))
        }
    }
}

#[derive(Debug)]
pub struct DbConnection {
    url: String,
    location: Location,
    busy_timeout: Duration,
    permanent: bool,
    conn: Option<Connection>,
}

impl DbConnection {
    pub fn open(url: &str, busy_timeout_ms: u64) -> Result<Self, StorageError> {
        let location = Location::parse(url);
        let mut db = Self {
            url: url.trim().to_string(),
            permanent: location == Location::Memory,
            location,
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            conn: None,
        };
        db.connect()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(MEMORY_URL, 0)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    pub fn db_name(&self) -> String {
        match &self.location {
            Location::Memory => MEMORY_URL.to_string(),
            Location::File(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.url.clone()),
        }
    }

    pub fn connect(&mut self) -> Result<&Connection, StorageError> {
        if self.conn.is_none() {
            let conn = match &self.location {
                Location::Memory => Connection::open_in_memory()?,
                Location::File(path) => Connection::open(path)?,
            };
            conn.busy_timeout(self.busy_timeout)?;
            debug!(event = "db_connection_opened", url = %self.url);
            self.conn = Some(conn);
        }
        self.conn
            .as_ref()
            .ok_or_else(|| StorageError::Config(format!("connection {} unavailable", self.url)))
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    // Permanent connections (and in-memory ones, which cannot be reopened)
    // stay open until dropped.
    pub fn close(&mut self) -> bool {
        if self.permanent || self.conn.is_none() {
            return false;
        }
        self.conn = None;
        debug!(event = "db_connection_closed", url = %self.url);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn set_permanent(&mut self, permanent: bool) {
        self.permanent = permanent || self.location == Location::Memory;
    }

    pub fn table_exists(&mut self, table_name: &str) -> Result<bool, StorageError> {
        sqlite_table_exists(self.connect()?, table_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn file_connections_close_and_reopen() {
        let file = NamedTempFile::new().expect("temp file");
        let url = format!("sqlite://{}", file.path().display());
        let mut db = DbConnection::open(&url, 100).expect("open");
        assert_eq!(db.path(), Some(file.path()));
        db.connect()
            .expect("connect")
            .execute_batch("CREATE TABLE CALIBVLD (SEQNO INTEGER)")
            .expect("create");

        assert!(db.close());
        assert!(db.is_closed());
        assert!(db.table_exists("calibvld").expect("exists"));
        assert!(!db.is_closed());

        db.set_permanent(true);
        assert!(!db.close());
    }

    #[test]
    fn memory_connections_are_always_permanent() {
        let mut db = DbConnection::open_in_memory().expect("open");
        assert!(db.is_permanent());
        db.set_permanent(false);
        assert!(!db.close());
        assert_eq!(db.db_name(), MEMORY_URL);
        assert!(!db.table_exists("MISSING").expect("lookup"));
    }
}
