use crate::cache::Cache;
use crate::result_set::{AggregateResult, ResultSet, SingleSourceResult};
use crate::table_row::TableRow;
use crate::StorageError;
use cdb_core::{SqlQualifiers, ValidityRecord};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "R: TableRow")]
pub struct PersistedSingle<R> {
    pub validity: ValidityRecord,
    pub rows: Vec<R>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "R: TableRow")]
pub struct PersistedResult<R> {
    pub table_name: String,
    pub sql_qualifiers: String,
    pub aggregated: bool,
    pub validity: ValidityRecord,
    pub results: Vec<PersistedSingle<R>>,
}

impl<R: TableRow> PersistedResult<R> {
    pub fn from_result(result: &ResultSet<R>) -> Option<Self> {
        if result.validity().is_gap() {
            return None;
        }
        let results = match result {
            ResultSet::Single(single) => vec![PersistedSingle {
                validity: result.validity().clone(),
                rows: single.rows().to_vec(),
            }],
            ResultSet::Aggregate(aggregate) => aggregate
                .children()
                .filter(|child| !child.validity().is_gap())
                .map(|child| PersistedSingle {
                    validity: child.validity().clone(),
                    rows: child.rows().cloned().collect(),
                })
                .collect(),
        };
        Some(Self {
            table_name: result.table_name().to_string(),
            sql_qualifiers: result.sql_qualifiers().to_string(),
            aggregated: result.is_aggregate(),
            validity: result.validity().clone(),
            results,
        })
    }

    // Aggregate children are handed to `cache` so later single-source
    // queries can find them.
    pub fn into_result(self, cache: &mut Cache<R>) -> ResultSet<R> {
        let quals = SqlQualifiers::parse(&self.sql_qualifiers);
        if !self.aggregated {
            let rows = self
                .results
                .into_iter()
                .next()
                .map(|single| single.rows)
                .unwrap_or_default();
            return ResultSet::Single(SingleSourceResult::from_rows(
                &self.table_name,
                self.validity,
                rows,
                &quals,
            ));
        }

        let children = self
            .results
            .into_iter()
            .map(|single| {
                let child =
                    SingleSourceResult::from_rows(&self.table_name, single.validity, single.rows, &quals);
                Some(cache.adopt(ResultSet::Single(child), false))
            })
            .collect();
        ResultSet::Aggregate(AggregateResult::from_children(
            &self.table_name,
            self.validity,
            children,
            &quals,
        ))
    }
}

struct LockedFile {
    file: File,
}

impl LockedFile {
    fn exclusive(path: &Path) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> Result<Self, std::io::Error> {
        let file = File::open(path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Cache {
    dir: PathBuf,
}

impl L2Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, table_name: &str, cache_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{cache_name}.json", table_name.to_uppercase()))
    }

    pub fn save<R: TableRow>(
        &self,
        result: &ResultSet<R>,
        cache_name: &str,
    ) -> Result<bool, StorageError> {
        let Some(persisted) = PersistedResult::from_result(result) else {
            return Ok(false);
        };
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(result.table_name(), cache_name);
        let mut lock = LockedFile::exclusive(&path)?;
        lock.file.set_len(0)?;
        lock.file.seek(SeekFrom::Start(0))?;
        serde_json::to_writer(&mut lock.file, &persisted)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        lock.file.flush()?;
        debug!(
            event = "l2_cache_saved",
            table = result.table_name(),
            path = %path.display(),
            rows = result.num_rows()
        );
        Ok(true)
    }

    pub fn restore<R: TableRow>(
        &self,
        table_name: &str,
        cache_name: &str,
    ) -> Result<Option<PersistedResult<R>>, StorageError> {
        let path = self.file_path(table_name, cache_name);
        if !path.exists() {
            return Ok(None);
        }
        let lock = LockedFile::shared(&path)?;
        let persisted: PersistedResult<R> = match serde_json::from_reader(BufReader::new(&lock.file)) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(
                    event = "l2_cache_unreadable",
                    table = table_name,
                    path = %path.display(),
                    error = %err
                );
                return Ok(None);
            }
        };
        debug!(event = "l2_cache_restored", table = table_name, path = %path.display());
        Ok(Some(persisted))
    }
}
