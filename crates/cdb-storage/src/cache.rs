use crate::result_set::ResultSet;
use crate::table_row::TableRow;
use cdb_core::{ResultKey, SqlQualifiers, Task, ValidityContext, ValidityRecord, AGGREGATE_NONE};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub adopted: u64,
    pub reused: u64,
    pub searched: u64,
    pub purged: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "adopted {:>6}  reused {:>6}  searched {:>6}  purged {:>6}",
            self.adopted, self.reused, self.searched, self.purged
        )
    }
}

#[derive(Debug)]
struct CacheEntry<R: TableRow> {
    result: Arc<ResultSet<R>>,
    key: Option<ResultKey>,
}

impl<R: TableRow> CacheEntry<R> {
    fn is_unreferenced(&self) -> bool {
        Arc::strong_count(&self.result) == 1
    }
}

#[derive(Debug)]
pub struct Cache<R: TableRow> {
    table_name: String,
    entries: BTreeMap<i32, Vec<CacheEntry<R>>>,
    stats: CacheStats,
}

impl<R: TableRow> Cache<R> {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            entries: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn search(
        &mut self,
        vrec: &ValidityRecord,
        sql_qualifiers: &SqlQualifiers,
    ) -> Option<Arc<ResultSet<R>>> {
        self.stats.searched += 1;
        let quals = sql_qualifiers.to_string();
        let hit = self
            .entries
            .get(&vrec.aggregate_no())?
            .iter()
            .find(|entry| entry.result.satisfies(vrec, &quals))
            .map(|entry| Arc::clone(&entry.result));
        if hit.is_some() {
            self.stats.reused += 1;
            debug!(
                event = "cache_hit",
                table = %self.table_name,
                seq_no = vrec.seq_no(),
                aggregate_no = vrec.aggregate_no()
            );
        }
        hit
    }

    pub fn search_context(
        &mut self,
        context: &ValidityContext,
        task: Task,
        sql_qualifiers: &SqlQualifiers,
    ) -> Option<Arc<ResultSet<R>>> {
        self.stats.searched += 1;
        let quals = sql_qualifiers.to_string();
        let hit = self
            .entries
            .get(&AGGREGATE_NONE)?
            .iter()
            .filter(|entry| !entry.result.validity().is_gap())
            .find(|entry| entry.result.can_serve(context, task, &quals))
            .map(|entry| Arc::clone(&entry.result));
        if hit.is_some() {
            self.stats.reused += 1;
            debug!(
                event = "cache_hit",
                table = %self.table_name,
                context = %context,
                task
            );
        }
        hit
    }

    pub fn search_key(&mut self, key: &ResultKey) -> Option<Arc<ResultSet<R>>> {
        self.stats.searched += 1;
        let hit = self
            .entries
            .values()
            .flatten()
            .find(|entry| entry.key.as_ref() == Some(key))
            .map(|entry| Arc::clone(&entry.result));
        if hit.is_some() {
            self.stats.reused += 1;
        }
        hit
    }

    // Registering under a key already held returns the live entry instead.
    pub fn adopt(&mut self, result: ResultSet<R>, register_key: bool) -> Arc<ResultSet<R>> {
        let key = register_key.then(|| result.create_key());
        if let Some(key) = key.as_ref() {
            if let Some(existing) = self.search_key(key) {
                debug!(event = "cache_adopt_duplicate", table = %self.table_name, key = %key);
                return existing;
            }
        }

        let aggregate_no = result.validity().aggregate_no();
        self.purge_expired(aggregate_no, result.validity());

        let result = Arc::new(result);
        self.entries
            .entry(aggregate_no)
            .or_default()
            .push(CacheEntry {
                result: Arc::clone(&result),
                key,
            });
        self.stats.adopted += 1;
        debug!(
            event = "cache_adopt",
            table = %self.table_name,
            aggregate_no,
            rows = result.num_rows(),
            entries = self.len()
        );
        result
    }

    fn purge_expired(&mut self, aggregate_no: i32, newest: &ValidityRecord) {
        let Some(bucket) = self.entries.get_mut(&aggregate_no) else {
            return;
        };
        let before = bucket.len();
        bucket.retain(|entry| {
            !(entry.is_unreferenced() && entry.result.validity().has_expired(newest))
        });
        let purged = before - bucket.len();
        if purged > 0 {
            self.stats.purged += purged as u64;
            debug!(
                event = "cache_purge_expired",
                table = %self.table_name,
                aggregate_no,
                purged
            );
        }
    }

    // Drops entries nobody references that can never be handed out again.
    pub fn purge(&mut self) -> usize {
        let mut purged = 0;
        for bucket in self.entries.values_mut() {
            let before = bucket.len();
            bucket.retain(|entry| {
                !(entry.is_unreferenced()
                    && (entry.result.validity().is_gap() || !entry.result.can_reuse()))
            });
            purged += before - bucket.len();
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        self.stats.purged += purged as u64;
        purged
    }

    // Drops unreferenced entries whose window no longer covers the query
    // time for a context they would otherwise answer.
    pub fn purge_stale(&mut self, context: &ValidityContext, task: Task) -> usize {
        let mut purged = 0;
        for bucket in self.entries.values_mut() {
            let before = bucket.len();
            bucket.retain(|entry| {
                !(entry.is_unreferenced() && entry.result.validity().has_expired_for(context, task))
            });
            purged += before - bucket.len();
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        if purged > 0 {
            self.stats.purged += purged as u64;
            debug!(
                event = "cache_purge_stale",
                table = %self.table_name,
                context = %context,
                task,
                purged
            );
        }
        purged
    }

    pub fn invalidate(&mut self) {
        let dropped = self.len();
        self.entries.clear();
        debug!(event = "cache_invalidate", table = %self.table_name, dropped);
    }
}

impl<R: TableRow> fmt::Display for Cache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<30} entries {:>5}  {}",
            self.table_name,
            self.len(),
            self.stats
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::SingleSourceResult;
    use crate::row_stream::{InRowStream, OutRowStream};
    use cdb_core::{Timestamp, ValidityRange, ValidityRow};
    use chrono::{Duration, TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PedRow {
        value: i32,
    }

    impl TableRow for PedRow {
        const ROW_NAME: &'static str = "PedRow";

        fn create_empty() -> Self {
            Self { value: 0 }
        }

        fn fill(&mut self, rs: &mut InRowStream, _validity: Option<&ValidityRecord>) {
            self.value = rs.read();
        }

        fn store(&self, out: &mut OutRowStream, _validity: Option<&ValidityRecord>) {
            out.write(self.value);
        }
    }

    fn ts(seconds: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(seconds)
    }

    fn vrec(seq_no: u32, start: i64, end: i64) -> ValidityRecord {
        ValidityRow::new(
            ValidityRange::new(1, 1, ts(start), ts(end), "test"),
            0,
            AGGREGATE_NONE,
            seq_no,
            ts(0),
        )
        .into()
    }

    fn single(seq_no: u32, start: i64, end: i64, quals: &SqlQualifiers) -> ResultSet<PedRow> {
        ResultSet::Single(SingleSourceResult::from_rows(
            "PED",
            vrec(seq_no, start, end),
            vec![PedRow { value: seq_no as i32 }],
            quals,
        ))
    }

    #[test]
    fn adopt_then_search_round_trips() {
        let mut cache = Cache::new("PED");
        let quals = SqlQualifiers::default();
        let adopted = cache.adopt(single(3, 0, 10, &quals), true);

        let found = cache.search(&vrec(3, 0, 10), &quals).expect("hit");
        assert!(Arc::ptr_eq(&adopted, &found));
        assert!(found.satisfies(&vrec(3, 0, 10), &quals.to_string()));

        let ctx = ValidityContext::new(1, 1, ts(5));
        let by_context = cache.search_context(&ctx, 0, &quals).expect("context hit");
        assert!(Arc::ptr_eq(&adopted, &by_context));
        assert!(cache
            .search_context(&ValidityContext::new(1, 1, ts(15)), 0, &quals)
            .is_none());
        assert!(cache.search(&vrec(3, 0, 10), &SqlQualifiers::parse(";X=1;")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.adopted, 1);
        assert_eq!(stats.reused, 2);
    }

    #[test]
    fn one_live_entry_per_key() {
        let mut cache = Cache::new("PED");
        let quals = SqlQualifiers::default();
        let first = cache.adopt(single(3, 0, 10, &quals), true);
        let second = cache.adopt(single(3, 0, 10, &quals), true);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let key = first.create_key();
        let by_key = cache.search_key(&key).expect("key hit");
        assert!(Arc::ptr_eq(&first, &by_key));
    }

    #[test]
    fn unreferenced_expired_entries_are_purged_on_adopt() {
        let mut cache = Cache::new("PED");
        let quals = SqlQualifiers::default();
        drop(cache.adopt(single(1, 0, 10, &quals), true));
        let held = cache.adopt(single(2, 10, 20, &quals), true);
        assert_eq!(cache.len(), 1);

        cache.adopt(single(3, 20, 30, &quals), true);
        assert_eq!(cache.len(), 2);
        assert!(cache.search(&vrec(2, 10, 20), &quals).is_some());
        drop(held);
        assert_eq!(cache.stats().purged, 1);
    }

    #[test]
    fn purge_drops_unreferenced_gaps_and_unreusable_results() {
        let mut cache = Cache::<PedRow>::new("PED");
        let gap = ValidityRecord::gap(ValidityRange::new(1, 1, ts(0), ts(10), "gap"), 0, 1);
        let quals = SqlQualifiers::default();
        cache.adopt(
            ResultSet::Single(SingleSourceResult::empty("PED", gap, &quals)),
            false,
        );
        let extended = SqlQualifiers::parse("TASK = 1;;");
        cache.adopt(single(4, 0, 10, &extended), false);
        let kept = cache.adopt(single(5, 0, 10, &quals), true);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.purge(), 2);
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&kept, &cache.search(&vrec(5, 0, 10), &quals).expect("hit")));

        cache.invalidate();
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_entries_are_purged_for_a_later_context() {
        let mut cache = Cache::new("PED");
        let quals = SqlQualifiers::default();
        drop(cache.adopt(single(1, 0, 10, &quals), true));
        let held = cache.adopt(single(2, 0, 10, &quals), true);
        drop(cache.adopt(single(3, 0, 30, &quals), true));
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.purge_stale(&ValidityContext::new(1, 1, ts(5)), 0), 0);
        assert_eq!(cache.purge_stale(&ValidityContext::new(1, 1, ts(15)), 1), 0);
        assert_eq!(cache.purge_stale(&ValidityContext::new(2, 1, ts(15)), 0), 0);

        assert_eq!(cache.purge_stale(&ValidityContext::new(1, 1, ts(15)), 0), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.search(&vrec(1, 0, 10), &quals).is_none());
        assert!(Arc::ptr_eq(&held, &cache.search(&vrec(2, 0, 10), &quals).expect("held")));
        assert!(cache.search(&vrec(3, 0, 30), &quals).is_some());
        assert_eq!(cache.stats().purged, 1);
    }
}
