use crate::config::CascadeConfig;
use crate::connection::{sqlite_table_exists, DbConnection};
use crate::StorageError;
use cdb_core::format_db_time;
use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

pub const GLOBAL_SEQNO_TABLE: &str = "GLOBALSEQNO";
pub const LOCAL_SEQNO_TABLE: &str = "LOCALSEQNO";
pub const LOCAL_SEQNO_RANGE: (i64, i64) = (1, 99_999_999);
pub const GLOBAL_SEQNO_RANGE: (i64, i64) = (100_000_000, 999_999_999);
const DEFAULT_SEQNO_ROW: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    Failed,
    Closed,
    Open,
}

impl DbStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbStatus::Failed => "Failed",
            DbStatus::Closed => "Closed",
            DbStatus::Open => "Open",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeqNoScope {
    Global,
    Local,
    #[default]
    Auto,
}

pub fn create_seqno_table(conn: &Connection, seqno_table: &str) -> Result<(), StorageError> {
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {seqno_table} (
            TABLENAME TEXT NOT NULL PRIMARY KEY,
            LASTUSEDSEQNO INTEGER NOT NULL,
            UPDATETIME TEXT
        );
        INSERT OR IGNORE INTO {seqno_table} (TABLENAME, LASTUSEDSEQNO, UPDATETIME)
            VALUES ('{DEFAULT_SEQNO_ROW}', 0, NULL);
        "
    ))?;
    Ok(())
}

pub struct TableLock<'c> {
    conn: &'c Connection,
    first_table: String,
    second_table: String,
    locked: bool,
    failure: Option<String>,
}

impl<'c> TableLock<'c> {
    // The first table is always locked before the second.
    pub fn acquire(conn: &'c Connection, first_table: &str, second_table: &str) -> Self {
        let mut lock = Self {
            conn,
            first_table: first_table.to_string(),
            second_table: second_table.to_string(),
            locked: false,
            failure: None,
        };
        match conn.execute_batch("BEGIN IMMEDIATE") {
            Ok(()) => {
                lock.locked = true;
                debug!(
                    event = "table_lock_acquired",
                    first_table = %lock.first_table,
                    second_table = %lock.second_table
                );
            }
            Err(err) => {
                warn!(
                    event = "table_lock_failed",
                    first_table = %lock.first_table,
                    second_table = %lock.second_table,
                    error = %err
                );
                lock.failure = Some(err.to_string());
            }
        }
        lock
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn tables(&self) -> (&str, &str) {
        (&self.first_table, &self.second_table)
    }

    pub fn ensure_locked(&self) -> Result<(), StorageError> {
        if self.locked {
            return Ok(());
        }
        Err(StorageError::LockFailed {
            tables: format!("{}, {}", self.first_table, self.second_table),
            reason: self
                .failure
                .clone()
                .unwrap_or_else(|| "lock released".to_string()),
        })
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.ensure_locked()?;
        self.conn.execute_batch("COMMIT")?;
        self.locked = false;
        debug!(
            event = "table_lock_committed",
            first_table = %self.first_table,
            second_table = %self.second_table
        );
        Ok(())
    }
}

impl Drop for TableLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.conn.execute_batch("ROLLBACK");
            debug!(
                event = "table_lock_rolled_back",
                first_table = %self.first_table,
                second_table = %self.second_table
            );
        }
    }
}

fn next_seq_no(
    conn: &Connection,
    seqno_table: &str,
    table_name: &str,
    range: (i64, i64),
    db_index: usize,
) -> Result<u32, StorageError> {
    let (min, max) = range;
    let table_key = table_name.to_uppercase();
    let now = format_db_time(&Utc::now());
    let select = format!("SELECT LASTUSEDSEQNO FROM {seqno_table} WHERE TABLENAME = ?1");

    let last = match conn
        .query_row(&select, [&table_key], |row| row.get::<_, i64>(0))
        .optional()?
    {
        Some(last) => last,
        None => {
            let default = conn
                .query_row(&select, [DEFAULT_SEQNO_ROW], |row| row.get::<_, i64>(0))
                .optional()?
                .unwrap_or(0);
            conn.execute(
                &format!(
                    "INSERT INTO {seqno_table} (TABLENAME, LASTUSEDSEQNO, UPDATETIME) VALUES (?1, ?2, ?3)"
                ),
                params![table_key, default, now],
            )?;
            default
        }
    };

    let mut next = (last + 1).max(min);
    let vld_table = format!("{table_key}VLD");
    if sqlite_table_exists(conn, &vld_table)? {
        let used: Option<i64> = conn.query_row(
            &format!("SELECT MAX(SEQNO) FROM {vld_table} WHERE SEQNO BETWEEN ?1 AND ?2"),
            params![min, max],
            |row| row.get(0),
        )?;
        if let Some(used) = used.filter(|used| *used >= next) {
            warn!(
                event = "seqno_resync",
                table = %table_key,
                seqno_table,
                last_used = last,
                found = used
            );
            next = used + 1;
        }
    }

    if next > max {
        return Err(StorageError::SeqNoExhausted {
            table: table_key,
            db_index,
        });
    }

    conn.execute(
        &format!(
            "UPDATE {seqno_table} SET LASTUSEDSEQNO = ?1, UPDATETIME = ?2 WHERE TABLENAME = ?3"
        ),
        params![next, now, table_key],
    )?;
    u32::try_from(next).map_err(|_| StorageError::SeqNoExhausted {
        table: table_key,
        db_index,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmpTableLine {
    Blank,
    Valid(String),
    Invalid,
}

pub struct TmpTableParser {
    pattern: Regex,
}

impl TmpTableParser {
    pub fn new() -> Result<Self, StorageError> {
        let pattern =
            Regex::new(r"(?is)^\s*create\s+temporary\s+table\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(.*\)\s*;?\s*$")
                .map_err(|err| StorageError::Config(err.to_string()))?;
        Ok(Self { pattern })
    }

    pub fn parse_line(&self, line: &str) -> TmpTableLine {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("--") {
            return TmpTableLine::Blank;
        }
        match self.pattern.captures(trimmed) {
            Some(caps) => TmpTableLine::Valid(caps[1].to_uppercase()),
            None => TmpTableLine::Invalid,
        }
    }
}

#[derive(Debug)]
struct CascadeEntry {
    name: String,
    url: String,
    conn: Option<DbConnection>,
}

#[derive(Debug)]
pub struct Cascade {
    entries: Vec<CascadeEntry>,
    global_seqno_db: Option<usize>,
    temporary_tables: BTreeMap<String, usize>,
    held: bool,
}

impl Cascade {
    pub fn open(config: &CascadeConfig) -> Result<Self, StorageError> {
        if config.databases.is_empty() {
            return Err(StorageError::Config(
                "cascade has no database entries".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(config.databases.len());
        for (db_index, db) in config.databases.iter().enumerate() {
            let conn = match DbConnection::open(&db.url, config.busy_timeout_ms) {
                Ok(mut conn) => {
                    conn.set_permanent(db.permanent);
                    Some(conn)
                }
                Err(err) => {
                    warn!(event = "cascade_entry_failed", db_index, url = %db.url, error = %err);
                    None
                }
            };
            let name = if db.name.is_empty() {
                conn.as_ref()
                    .map(DbConnection::db_name)
                    .unwrap_or_else(|| format!("db{db_index}"))
            } else {
                db.name.clone()
            };
            entries.push(CascadeEntry {
                name,
                url: db.url.clone(),
                conn,
            });
        }

        let mut cascade = Self::from_entries(entries);
        if let Some(path) = &config.temporary_tables_file {
            cascade.process_tmp_tbls_file(path)?;
        }
        Ok(cascade)
    }

    pub fn from_connections(connections: Vec<(String, DbConnection)>) -> Self {
        let entries = connections
            .into_iter()
            .map(|(name, conn)| CascadeEntry {
                name,
                url: conn.url().to_string(),
                conn: Some(conn),
            })
            .collect();
        Self::from_entries(entries)
    }

    fn from_entries(entries: Vec<CascadeEntry>) -> Self {
        let mut cascade = Self {
            entries,
            global_seqno_db: None,
            temporary_tables: BTreeMap::new(),
            held: false,
        };
        cascade.global_seqno_db = (0..cascade.num_db()).find(|db_index| {
            cascade
                .entries
                .get_mut(*db_index)
                .and_then(|entry| entry.conn.as_mut())
                .map(|conn| conn.table_exists(GLOBAL_SEQNO_TABLE).unwrap_or(false))
                .unwrap_or(false)
        });
        info!(
            event = "cascade_opened",
            entries = cascade.num_db(),
            authorising_db = ?cascade.global_seqno_db
        );
        cascade
    }

    pub fn num_db(&self) -> usize {
        self.entries.len()
    }

    pub fn status(&self, db_index: usize) -> DbStatus {
        match self.entries.get(db_index).and_then(|entry| entry.conn.as_ref()) {
            None => DbStatus::Failed,
            Some(conn) if conn.is_closed() => DbStatus::Closed,
            Some(_) => DbStatus::Open,
        }
    }

    pub fn status_as_string(&self, db_index: usize) -> &'static str {
        self.status(db_index).as_str()
    }

    pub fn url(&self, db_index: usize) -> &str {
        self.entries
            .get(db_index)
            .map(|entry| entry.url.as_str())
            .unwrap_or("")
    }

    pub fn db_name(&self, db_index: usize) -> Option<&str> {
        self.entries.get(db_index).map(|entry| entry.name.as_str())
    }

    pub fn db_index(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.name == name)
    }

    pub fn authorising_db(&self) -> Option<usize> {
        self.global_seqno_db
    }

    pub fn set_authorising_entry(&mut self, db_index: Option<usize>) {
        self.global_seqno_db = db_index;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn connection(&mut self, db_index: usize) -> Result<&Connection, StorageError> {
        self.entries
            .get_mut(db_index)
            .and_then(|entry| entry.conn.as_mut())
            .ok_or(StorageError::Unavailable(db_index))?
            .connect()
    }

    pub fn hold_connections(&mut self) {
        self.held = true;
        for (db_index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(conn) = entry.conn.as_mut() {
                if let Err(err) = conn.connect() {
                    warn!(event = "cascade_hold_failed", db_index, error = %err);
                }
            }
        }
    }

    pub fn release_connections(&mut self) {
        self.held = false;
        for entry in &mut self.entries {
            if let Some(conn) = entry.conn.as_mut() {
                conn.close();
            }
        }
    }

    pub fn set_permanent(&mut self, db_index: usize, permanent: bool) {
        if let Some(conn) = self
            .entries
            .get_mut(db_index)
            .and_then(|entry| entry.conn.as_mut())
        {
            conn.set_permanent(permanent);
        }
    }

    pub fn is_temporary_table(&self, table_name: &str, db_index: usize) -> bool {
        self.temporary_tables.get(&table_name.to_uppercase()) == Some(&db_index)
    }

    pub fn temporary_tables(&self) -> impl Iterator<Item = (&str, usize)> {
        self.temporary_tables
            .iter()
            .map(|(name, db_index)| (name.as_str(), *db_index))
    }

    pub fn temporary_table_db(&self, table_name: &str) -> Option<usize> {
        self.temporary_tables.get(&table_name.to_uppercase()).copied()
    }

    // Temporary tables shadow permanent ones; otherwise the first entry in
    // priority order holding the table wins.
    pub fn table_db_index(&mut self, table_name: &str, select: Option<usize>) -> Option<usize> {
        if let Some(db_index) = self.temporary_tables.get(&table_name.to_uppercase()) {
            if select.map_or(true, |select| select == *db_index) {
                return Some(*db_index);
            }
        }
        let candidates: Vec<usize> = match select {
            Some(select) => vec![select],
            None => (0..self.num_db()).collect(),
        };
        candidates.into_iter().find(|db_index| {
            self.entries
                .get_mut(*db_index)
                .and_then(|entry| entry.conn.as_mut())
                .map(|conn| conn.table_exists(table_name).unwrap_or(false))
                .unwrap_or(false)
        })
    }

    pub fn table_exists(&mut self, table_name: &str, select: Option<usize>) -> bool {
        self.table_db_index(table_name, select).is_some()
    }

    fn temp_con(&self) -> Option<usize> {
        (0..self.num_db()).find(|db_index| self.status(*db_index) != DbStatus::Failed)
    }

    pub fn create_temporary_table(
        &mut self,
        table_name: &str,
        table_descr: &str,
    ) -> Result<usize, StorageError> {
        let descr = table_descr.trim();
        if table_name.trim().is_empty() || !descr.starts_with('(') || !descr.ends_with(')') {
            return Err(StorageError::InvalidTempTable(format!(
                "{table_name} {table_descr}"
            )));
        }
        self.exec_tmp_table_sql(
            table_name,
            &format!("CREATE TEMPORARY TABLE {table_name} {descr}"),
        )
    }

    fn exec_tmp_table_sql(&mut self, table_name: &str, sql: &str) -> Result<usize, StorageError> {
        let db_index = self
            .temp_con()
            .ok_or_else(|| StorageError::InvalidTempTable("no usable cascade entry".to_string()))?;
        self.connection(db_index)?.execute_batch(sql)?;
        self.set_permanent(db_index, true);
        self.temporary_tables
            .insert(table_name.to_uppercase(), db_index);
        info!(event = "temporary_table_created", table = table_name, db_index);
        Ok(db_index)
    }

    pub fn process_tmp_tbls_file(&mut self, path: &Path) -> Result<usize, StorageError> {
        let contents = fs::read_to_string(path)?;
        let parser = TmpTableParser::new()?;
        let mut created = 0;
        for (line_no, line) in contents.lines().enumerate() {
            match parser.parse_line(line) {
                TmpTableLine::Blank => {}
                TmpTableLine::Invalid => {
                    error!(
                        event = "temporary_table_line_invalid",
                        path = %path.display(),
                        line = line_no + 1,
                        text = line
                    );
                }
                TmpTableLine::Valid(table_name) => {
                    match self.exec_tmp_table_sql(&table_name, line.trim()) {
                        Ok(_) => created += 1,
                        Err(err) => error!(
                            event = "temporary_table_failed",
                            path = %path.display(),
                            line = line_no + 1,
                            table = %table_name,
                            error = %err
                        ),
                    }
                }
            }
        }
        Ok(created)
    }

    pub fn allocate_seq_no(
        &mut self,
        table_name: &str,
        scope: SeqNoScope,
        db_index: usize,
    ) -> Result<u32, StorageError> {
        let global = match scope {
            _ if self.is_temporary_table(table_name, db_index) => false,
            SeqNoScope::Local => false,
            SeqNoScope::Global => true,
            SeqNoScope::Auto => self.global_seqno_db == Some(db_index),
        };
        if !global {
            return self.reserve_next_seq_no(table_name, false, db_index);
        }
        let authority = self
            .global_seqno_db
            .ok_or_else(|| StorageError::NoGlobalAuthority(table_name.to_string()))?;
        self.reserve_next_seq_no(table_name, true, authority)
    }

    fn reserve_next_seq_no(
        &mut self,
        table_name: &str,
        global: bool,
        db_index: usize,
    ) -> Result<u32, StorageError> {
        let (seqno_table, range) = if global {
            (GLOBAL_SEQNO_TABLE, GLOBAL_SEQNO_RANGE)
        } else {
            (LOCAL_SEQNO_TABLE, LOCAL_SEQNO_RANGE)
        };
        let conn = self.connection(db_index)?;
        if global {
            if !sqlite_table_exists(conn, seqno_table)? {
                return Err(StorageError::NoGlobalAuthority(table_name.to_string()));
            }
        } else {
            create_seqno_table(conn, seqno_table)?;
        }

        let lock = TableLock::acquire(conn, seqno_table, table_name);
        lock.ensure_locked()?;
        let seq_no = next_seq_no(conn, seqno_table, table_name, range, db_index)?;
        lock.commit()?;

        info!(
            event = "seqno_allocated",
            table = table_name,
            seqno_table,
            db_index,
            seq_no
        );
        Ok(seq_no)
    }

    pub fn can_connect() -> bool {
        let Ok(config) = CascadeConfig::from_env() else {
            return false;
        };
        match Cascade::open(&config) {
            Ok(cascade) => {
                (0..cascade.num_db()).all(|db_index| cascade.status(db_index) != DbStatus::Failed)
            }
            Err(_) => false,
        }
    }
}

impl fmt::Display for Cascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cascade Status:")?;
        writeln!(f, "Db No. {:<20} {:<7} URL", "Name", "Status")?;
        for (db_index, entry) in self.entries.iter().enumerate() {
            write!(
                f,
                "{db_index:>6} {:<20} {:<7} {}",
                entry.name,
                self.status_as_string(db_index),
                entry.url
            )?;
            if self.global_seqno_db == Some(db_index) {
                write!(f, "  (auth)")?;
            }
            let temps: Vec<&str> = self
                .temporary_tables()
                .filter(|(_, owner)| *owner == db_index)
                .map(|(name, _)| name)
                .collect();
            if !temps.is_empty() {
                write!(f, "  temporary: {}", temps.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
