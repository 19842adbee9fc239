use crate::cache::{Cache, CacheStats};
use crate::cascade::{Cascade, DbStatus};
use crate::codec::{L2Cache, PersistedResult};
use crate::config::CascadeConfig;
use crate::result_set::{aggregate_validity, AggregateResult, ResultSet, SingleSourceResult};
use crate::row_stream::InRowStream;
use crate::table_row::TableRow;
use crate::validity_builder::{query_validity_rows, ValidityRecordBuilder, VldQuery};
use crate::StorageError;
use cdb_core::{
    PriorityScheme, RollbackDates, SqlQualifiers, Task, ValidityContext, ValidityRecord,
};
use chrono::Duration;
use rusqlite::params;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct QuerySettings {
    pub priority_scheme: PriorityScheme,
    pub time_gate: Option<Duration>,
    pub rollback: RollbackDates,
}

impl QuerySettings {
    pub fn from_config(config: &CascadeConfig) -> Self {
        Self {
            priority_scheme: config.priority_scheme,
            time_gate: config.time_gate(),
            rollback: config.rollback_dates(),
        }
    }
}

// Sorted sequence numbers collapse into BETWEEN ranges and single equalities.
pub fn seq_no_ranges(seq_nos: &[u32]) -> String {
    let mut sorted = seq_nos.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut clauses = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(lo) = iter.next() {
        let mut hi = lo;
        while let Some(next) = iter.peek().copied() {
            if next != hi + 1 {
                break;
            }
            hi = next;
            iter.next();
        }
        if lo == hi {
            clauses.push(format!("SEQNO = {lo}"));
        } else {
            clauses.push(format!("SEQNO BETWEEN {lo} AND {hi}"));
        }
    }
    clauses.join(" OR ")
}

pub fn fetch_sql(table_name: &str, seq_nos: &[u32], data_sql: &str) -> String {
    let mut sql = format!(
        "SELECT * FROM {} WHERE ({})",
        table_name.to_uppercase(),
        seq_no_ranges(seq_nos)
    );
    if !data_sql.trim().is_empty() {
        sql.push_str(&format!(" AND ({})", data_sql.trim()));
    }
    sql.push_str(" ORDER BY SEQNO, ROW_COUNTER");
    sql
}

fn fetch_rows(
    cascade: &mut Cascade,
    table_name: &str,
    seq_nos: &[u32],
    db_index: Option<usize>,
    sql_qualifiers: &SqlQualifiers,
) -> Result<InRowStream, StorageError> {
    let db_index = db_index.ok_or_else(|| StorageError::UnknownTable(table_name.to_string()))?;
    let sql = fetch_sql(table_name, seq_nos, &sql_qualifiers.data);
    debug!(event = "result_fetch", table = table_name, db_index, sql = %sql);
    let conn = cascade.connection(db_index)?;
    Ok(InRowStream::query(conn, &sql, params![], table_name, Some(db_index))?
        .with_fill_opts(sql_qualifiers.fill_opts.clone()))
}

#[derive(Debug)]
pub struct TableProxy<R: TableRow> {
    table_name: String,
    cache: Cache<R>,
    settings: QuerySettings,
    l2: Option<L2Cache>,
}

impl<R: TableRow> TableProxy<R> {
    pub fn new(table_name: &str, settings: QuerySettings) -> Self {
        let table_name = table_name.to_uppercase();
        Self {
            cache: Cache::new(table_name.clone()),
            table_name,
            settings,
            l2: None,
        }
    }

    pub fn with_l2_cache(mut self, l2: L2Cache) -> Self {
        self.l2 = Some(l2);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn vld_table_name(&self) -> String {
        format!("{}VLD", self.table_name)
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn cache(&self) -> &Cache<R> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    // A registered temporary VLD table is the only source consulted.
    pub fn build_validity(
        &self,
        cascade: &mut Cascade,
        context: &ValidityContext,
        task: Task,
        sql_qualifiers: &SqlQualifiers,
    ) -> Result<ValidityRecordBuilder, StorageError> {
        let vld_table = self.vld_table_name();
        let mut builder = ValidityRecordBuilder::new(
            *context,
            task,
            self.settings.priority_scheme,
            self.settings.time_gate,
        )
        .with_extended_context(sql_qualifiers.is_extended_context());

        let sources: Vec<usize> = match cascade.temporary_table_db(&vld_table) {
            Some(db_index) => vec![db_index],
            None => (0..cascade.num_db())
                .filter(|db_index| cascade.status(*db_index) != DbStatus::Failed)
                .collect(),
        };
        let options = VldQuery {
            time_gate: self.settings.time_gate,
            rollback: Some(&self.settings.rollback),
            context_sql: &sql_qualifiers.context,
        };

        for db_index in sources {
            if !cascade.table_exists(&vld_table, Some(db_index)) {
                continue;
            }
            let rows = match cascade.connection(db_index).and_then(|conn| {
                query_validity_rows(conn, &self.table_name, context, task, &options, db_index)
            }) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(
                        event = "validity_query_failed",
                        table = %vld_table,
                        db_index,
                        error = %err
                    );
                    continue;
                }
            };
            debug!(
                event = "validity_rows_loaded",
                table = %vld_table,
                db_index,
                rows = rows.len()
            );
            builder.add_source(rows)?;
        }
        Ok(builder)
    }

    pub fn query(
        &mut self,
        cascade: &mut Cascade,
        context: &ValidityContext,
        task: Task,
        sql_qualifiers: &SqlQualifiers,
    ) -> Result<Arc<ResultSet<R>>, StorageError> {
        self.cache.purge();
        self.cache.purge_stale(context, task);
        if !sql_qualifiers.is_extended_context() {
            if let Some(hit) = self.cache.search_context(context, task, sql_qualifiers) {
                return Ok(hit);
            }
        }

        let builder = self.build_validity(cascade, context, task, sql_qualifiers)?;
        let cache_name = builder.cache_name();
        let result = if builder.non_aggregated() {
            let vrec = builder
                .non_aggregated_record()
                .cloned()
                .unwrap_or_else(ValidityRecord::undefined);
            self.resolve_single(cascade, vrec, sql_qualifiers, cache_name.as_deref())?
        } else {
            let records = builder.aggregated_records();
            self.resolve_aggregate(cascade, &records, sql_qualifiers, cache_name.as_deref())?
        };

        info!(
            event = "table_query_resolved",
            table = %self.table_name,
            context = %context,
            task,
            aggregated = result.is_aggregate(),
            rows = result.num_rows(),
            from_db = result.results_from_db()
        );
        Ok(result)
    }

    fn resolve_single(
        &mut self,
        cascade: &mut Cascade,
        vrec: ValidityRecord,
        sql_qualifiers: &SqlQualifiers,
        cache_name: Option<&str>,
    ) -> Result<Arc<ResultSet<R>>, StorageError> {
        if vrec.is_gap() {
            let gap = SingleSourceResult::empty(&self.table_name, vrec, sql_qualifiers);
            return Ok(self.cache.adopt(ResultSet::Single(gap), false));
        }
        if let Some(hit) = self.cache.search(&vrec, sql_qualifiers) {
            return Ok(hit);
        }
        if let Some(restored) = self.restore_l2(cache_name, sql_qualifiers, std::slice::from_ref(&vrec)) {
            return Ok(self.cache.adopt(restored, true));
        }

        let mut rs = fetch_rows(
            cascade,
            &self.table_name,
            &[vrec.seq_no()],
            vrec.db_index(),
            sql_qualifiers,
        )?;
        let single = SingleSourceResult::from_stream(&mut rs, vrec, sql_qualifiers);
        let result = self.cache.adopt(ResultSet::Single(single), true);
        self.save_l2(&result, cache_name, sql_qualifiers);
        Ok(result)
    }

    fn resolve_aggregate(
        &mut self,
        cascade: &mut Cascade,
        records: &[ValidityRecord],
        sql_qualifiers: &SqlQualifiers,
        cache_name: Option<&str>,
    ) -> Result<Arc<ResultSet<R>>, StorageError> {
        if let Some(restored) = self.restore_l2(cache_name, sql_qualifiers, records) {
            return Ok(self.cache.adopt(restored, true));
        }

        let table_name = self.table_name.clone();
        let aggregate = AggregateResult::build(
            &self.table_name,
            &mut self.cache,
            records,
            sql_qualifiers,
            |seq_nos, db_index| fetch_rows(cascade, &table_name, seq_nos, db_index, sql_qualifiers),
        )?;
        let result = self.cache.adopt(ResultSet::Aggregate(aggregate), true);
        self.save_l2(&result, cache_name, sql_qualifiers);
        Ok(result)
    }

    // Persisted windows reflect the query time they were saved at, so the
    // freshly trimmed records replace them.
    fn restore_l2(
        &mut self,
        cache_name: Option<&str>,
        sql_qualifiers: &SqlQualifiers,
        records: &[ValidityRecord],
    ) -> Option<ResultSet<R>> {
        let l2 = self.l2.as_ref()?;
        let cache_name = cache_name?;
        if !sql_qualifiers.is_empty() {
            return None;
        }
        let mut persisted: PersistedResult<R> = match l2.restore(&self.table_name, cache_name) {
            Ok(persisted) => persisted?,
            Err(err) => {
                warn!(event = "l2_cache_restore_failed", table = %self.table_name, error = %err);
                return None;
            }
        };

        for single in &mut persisted.results {
            let Some(current) = records
                .iter()
                .find(|vrec| {
                    !vrec.is_gap()
                        && vrec.seq_no() == single.validity.seq_no()
                        && vrec.db_index() == single.validity.db_index()
                        && vrec.creation_date() == single.validity.creation_date()
                })
            else {
                warn!(
                    event = "l2_cache_stale",
                    table = %self.table_name,
                    cache_name,
                    seq_no = single.validity.seq_no()
                );
                return None;
            };
            single.validity = current.clone();
        }
        persisted.validity = if persisted.aggregated {
            aggregate_validity(records)
        } else {
            records.first().cloned()?
        };
        Some(persisted.into_result(&mut self.cache))
    }

    fn save_l2(&self, result: &ResultSet<R>, cache_name: Option<&str>, sql_qualifiers: &SqlQualifiers) {
        let (Some(l2), Some(cache_name)) = (self.l2.as_ref(), cache_name) else {
            return;
        };
        if !sql_qualifiers.is_empty() || !result.results_from_db() {
            return;
        }
        if let Err(err) = l2.save(result, cache_name) {
            warn!(event = "l2_cache_save_failed", table = %self.table_name, error = %err);
        }
    }
}
