use crate::cache::Cache;
use crate::row_stream::InRowStream;
use crate::table_row::TableRow;
use crate::StorageError;
use cdb_core::{
    ResultKey, SqlQualifiers, Task, ValidityContext, ValidityRecord, AGGREGATE_NONE,
};
use std::collections::{BTreeMap, HashMap};
use std::ptr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

const EMPTY_ROW_NAME: &str = "empty_table";

fn build_index<'a, R: TableRow>(
    table_name: &str,
    rows: impl Iterator<Item = &'a R>,
) -> HashMap<u32, usize> {
    let mut lookup = HashMap::new();
    for (pos, row) in rows.enumerate() {
        let index = row.index(pos as u32);
        if lookup.insert(index, pos).is_some() {
            warn!(
                event = "result_set_duplicate_index",
                table = table_name,
                index,
                row = pos
            );
        }
    }
    lookup
}

#[derive(Debug)]
pub struct SingleSourceResult<R: TableRow> {
    table_name: String,
    validity: ValidityRecord,
    rows: Vec<R>,
    sql_qualifiers: String,
    can_reuse: bool,
    results_from_db: bool,
    index_lookup: OnceLock<HashMap<u32, usize>>,
}

impl<R: TableRow> SingleSourceResult<R> {
    pub fn empty(table_name: &str, validity: ValidityRecord, sql_qualifiers: &SqlQualifiers) -> Self {
        Self::from_rows(table_name, validity, Vec::new(), sql_qualifiers)
    }

    pub fn from_rows(
        table_name: &str,
        validity: ValidityRecord,
        rows: Vec<R>,
        sql_qualifiers: &SqlQualifiers,
    ) -> Self {
        Self {
            table_name: table_name.to_string(),
            validity,
            rows,
            sql_qualifiers: sql_qualifiers.to_string(),
            can_reuse: !sql_qualifiers.is_extended_context(),
            results_from_db: false,
            index_lookup: OnceLock::new(),
        }
    }

    // The stream is ordered by a leading SEQNO column and filling stops at
    // the first row of the next sequence number. ROW_COUNTER is never handed
    // to the row.
    pub fn from_stream(
        rs: &mut InRowStream,
        validity: ValidityRecord,
        sql_qualifiers: &SqlQualifiers,
    ) -> Self {
        let mut result = Self::empty(rs.table_name(), validity, sql_qualifiers);
        if rs.is_before_first() {
            rs.fetch_row();
        }
        if rs.is_exhausted() {
            return result;
        }

        let mut group_seq_no = None;
        if rs.cur_col_name().eq_ignore_ascii_case("SEQNO") {
            group_seq_no = Some(rs.read::<u32>());
            rs.decrement_cur_col();
        }
        let has_row_counter = !rs.is_vld_table();

        while !rs.is_exhausted() {
            if let Some(seq_no) = group_seq_no {
                let next_seq_no: u32 = rs.read();
                if next_seq_no != seq_no {
                    rs.decrement_cur_col();
                    break;
                }
            }
            if has_row_counter && rs.cur_col_name().eq_ignore_ascii_case("ROW_COUNTER") {
                rs.increment_cur_col();
            }
            let mut row = R::create_empty();
            row.fill(rs, Some(&result.validity));
            result.rows.push(row);
            rs.fetch_row();
        }
        result.results_from_db = true;

        info!(
            event = "single_source_result_created",
            table = %result.table_name,
            seq_no = group_seq_no.unwrap_or_default(),
            rows = result.rows.len()
        );
        result
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }
}

// The combined window is the intersection of every constituent window.
pub fn aggregate_validity(records: &[ValidityRecord]) -> ValidityRecord {
    let mut validity = records
        .first()
        .cloned()
        .unwrap_or_else(ValidityRecord::undefined);
    for vrec in records {
        let range = vrec.range();
        validity.and_time_window(range.time_start, range.time_end);
    }
    validity.set_aggregate_no(AGGREGATE_NONE);
    validity
}

#[derive(Debug)]
pub struct AggregateResult<R: TableRow> {
    table_name: String,
    validity: ValidityRecord,
    children: Vec<Option<Arc<ResultSet<R>>>>,
    row_keys: Vec<(usize, usize)>,
    sql_qualifiers: String,
    can_reuse: bool,
    results_from_db: bool,
    index_lookup: OnceLock<HashMap<u32, usize>>,
}

impl<R: TableRow> AggregateResult<R> {
    // `records` holds one validity record per aggregate, in aggregate order.
    // `fetch` is called once per source with that source's required sequence
    // numbers sorted ascending and must return rows ordered by SEQNO.
    pub fn build<F>(
        table_name: &str,
        cache: &mut Cache<R>,
        records: &[ValidityRecord],
        sql_qualifiers: &SqlQualifiers,
        mut fetch: F,
    ) -> Result<Self, StorageError>
    where
        F: FnMut(&[u32], Option<usize>) -> Result<InRowStream, StorageError>,
    {
        let mut children: Vec<Option<Arc<ResultSet<R>>>> = Vec::with_capacity(records.len());
        let mut slots: BTreeMap<(Option<usize>, u32), usize> = BTreeMap::new();
        let mut required: BTreeMap<Option<usize>, Vec<u32>> = BTreeMap::new();

        for (slot, vrec) in records.iter().enumerate() {
            if let Some(hit) = cache.search(vrec, sql_qualifiers) {
                debug!(
                    event = "aggregate_child_cached",
                    table = table_name,
                    seq_no = vrec.seq_no(),
                    aggregate_no = vrec.aggregate_no()
                );
                children.push(Some(hit));
            } else if vrec.is_gap() {
                let gap = SingleSourceResult::empty(table_name, vrec.clone(), sql_qualifiers);
                children.push(Some(cache.adopt(ResultSet::Single(gap), false)));
            } else {
                required.entry(vrec.db_index()).or_default().push(vrec.seq_no());
                slots.insert((vrec.db_index(), vrec.seq_no()), slot);
                children.push(None);
            }
        }

        let mut results_from_db = false;
        for (db_index, seq_nos) in &mut required {
            seq_nos.sort_unstable();
            let mut rs = fetch(seq_nos.as_slice(), *db_index)?;
            results_from_db = true;
            if rs.is_before_first() {
                rs.fetch_row();
            }
            while !rs.is_exhausted() {
                let seq_no: u32 = rs.read();
                rs.decrement_cur_col();
                let slot = slots.get(&(*db_index, seq_no)).copied();
                let validity = slot
                    .and_then(|slot| records.get(slot).cloned())
                    .unwrap_or_else(ValidityRecord::undefined);
                let single = SingleSourceResult::from_stream(&mut rs, validity, sql_qualifiers);
                match slot {
                    Some(slot) => {
                        children[slot] = Some(cache.adopt(ResultSet::Single(single), false));
                    }
                    None => {
                        error!(
                            event = "aggregate_unexpected_seqno",
                            table = table_name,
                            db_index = ?db_index,
                            seq_no,
                            discarded_rows = single.rows.len()
                        );
                    }
                }
            }
        }

        // A data qualifier may legitimately filter out every row of a part.
        for (&(db_index, seq_no), &slot) in &slots {
            if children[slot].is_some() {
                continue;
            }
            if sql_qualifiers.data.trim().is_empty() {
                error!(
                    event = "aggregate_missing_seqno",
                    table = table_name,
                    db_index = ?db_index,
                    seq_no,
                    aggregate_no = records[slot].aggregate_no()
                );
            } else {
                debug!(
                    event = "aggregate_part_filtered",
                    table = table_name,
                    db_index = ?db_index,
                    seq_no
                );
            }
        }

        let validity = aggregate_validity(records);
        let aggregate = Self::from_children(table_name, validity, children, sql_qualifiers);
        info!(
            event = "aggregate_result_created",
            table = table_name,
            aggregates = records.len(),
            fetched = slots.len(),
            rows = aggregate.row_keys.len()
        );
        Ok(Self {
            results_from_db,
            ..aggregate
        })
    }

    pub fn from_children(
        table_name: &str,
        validity: ValidityRecord,
        children: Vec<Option<Arc<ResultSet<R>>>>,
        sql_qualifiers: &SqlQualifiers,
    ) -> Self {
        let row_keys = children
            .iter()
            .enumerate()
            .filter_map(|(slot, child)| child.as_ref().map(|child| (slot, child.num_rows())))
            .flat_map(|(slot, count)| (0..count).map(move |row| (slot, row)))
            .collect();
        Self {
            table_name: table_name.to_string(),
            validity,
            children,
            row_keys,
            sql_qualifiers: sql_qualifiers.to_string(),
            can_reuse: !sql_qualifiers.is_extended_context(),
            results_from_db: false,
            index_lookup: OnceLock::new(),
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<ResultSet<R>>> {
        self.children.iter().flatten()
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    fn child_for_row(&self, row: usize) -> Option<(&Arc<ResultSet<R>>, usize)> {
        let (slot, child_row) = *self.row_keys.get(row)?;
        let child = self.children.get(slot)?.as_ref()?;
        Some((child, child_row))
    }
}

#[derive(Debug)]
pub enum ResultSet<R: TableRow> {
    Single(SingleSourceResult<R>),
    Aggregate(AggregateResult<R>),
}

impl<R: TableRow> ResultSet<R> {
    pub fn table_name(&self) -> &str {
        match self {
            ResultSet::Single(single) => &single.table_name,
            ResultSet::Aggregate(aggregate) => &aggregate.table_name,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, ResultSet::Aggregate(_))
    }

    pub fn num_rows(&self) -> usize {
        match self {
            ResultSet::Single(single) => single.rows.len(),
            ResultSet::Aggregate(aggregate) => aggregate.row_keys.len(),
        }
    }

    pub fn table_row(&self, row: usize) -> Option<&R> {
        match self {
            ResultSet::Single(single) => single.rows.get(row),
            ResultSet::Aggregate(aggregate) => {
                let (child, child_row) = aggregate.child_for_row(row)?;
                child.table_row(child_row)
            }
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &R> {
        (0..self.num_rows()).filter_map(move |row| self.table_row(row))
    }

    pub fn table_row_by_index(&self, index: u32) -> Option<&R> {
        let lookup = match self {
            ResultSet::Single(single) => single
                .index_lookup
                .get_or_init(|| build_index(&single.table_name, single.rows.iter())),
            ResultSet::Aggregate(aggregate) => aggregate
                .index_lookup
                .get_or_init(|| build_index(&aggregate.table_name, self.rows())),
        };
        lookup.get(&index).and_then(|row| self.table_row(*row))
    }

    pub fn validity(&self) -> &ValidityRecord {
        match self {
            ResultSet::Single(single) => &single.validity,
            ResultSet::Aggregate(aggregate) => &aggregate.validity,
        }
    }

    pub fn validity_for_row(&self, row: usize) -> &ValidityRecord {
        match self {
            ResultSet::Single(single) => &single.validity,
            ResultSet::Aggregate(aggregate) => aggregate
                .child_for_row(row)
                .map(|(child, child_row)| child.validity_for_row(child_row))
                .unwrap_or(&aggregate.validity),
        }
    }

    pub fn sql_qualifiers(&self) -> &str {
        match self {
            ResultSet::Single(single) => &single.sql_qualifiers,
            ResultSet::Aggregate(aggregate) => &aggregate.sql_qualifiers,
        }
    }

    pub fn can_reuse(&self) -> bool {
        match self {
            ResultSet::Single(single) => single.can_reuse,
            ResultSet::Aggregate(aggregate) => aggregate.can_reuse,
        }
    }

    pub fn results_from_db(&self) -> bool {
        match self {
            ResultSet::Single(single) => single.results_from_db,
            ResultSet::Aggregate(aggregate) => aggregate.results_from_db,
        }
    }

    pub fn create_key(&self) -> ResultKey {
        match self {
            ResultSet::Single(single) => {
                let row_name = if single.rows.is_empty() {
                    EMPTY_ROW_NAME
                } else {
                    R::ROW_NAME
                };
                let mut key =
                    ResultKey::new(&single.table_name, row_name, &single.sql_qualifiers);
                key.add_vrec_key(single.validity.seq_no(), single.validity.creation_date());
                key
            }
            ResultSet::Aggregate(aggregate) => {
                let mut key: Option<ResultKey> = None;
                for child in aggregate.children() {
                    match key.as_mut() {
                        None => key = Some(child.create_key()),
                        Some(key) => {
                            let vrec = child.validity();
                            key.add_vrec_key(vrec.seq_no(), vrec.creation_date());
                        }
                    }
                }
                key.unwrap_or_else(|| {
                    ResultKey::new(
                        &aggregate.table_name,
                        EMPTY_ROW_NAME,
                        &aggregate.sql_qualifiers,
                    )
                })
            }
        }
    }

    // Gaps are never reused across queries.
    pub fn satisfies(&self, vrec: &ValidityRecord, sql_qualifiers: &str) -> bool {
        match self {
            ResultSet::Single(single) => {
                single.can_reuse
                    && !vrec.is_gap()
                    && single.sql_qualifiers == sql_qualifiers
                    && vrec.seq_no() == single.validity.seq_no()
                    && vrec.creation_date() == single.validity.creation_date()
            }
            ResultSet::Aggregate(_) => false,
        }
    }

    pub fn satisfies_qualifiers(&self, sql_qualifiers: &str) -> bool {
        self.can_reuse() && self.sql_qualifiers() == sql_qualifiers
    }

    pub fn can_serve(&self, context: &ValidityContext, task: Task, sql_qualifiers: &str) -> bool {
        self.satisfies_qualifiers(sql_qualifiers) && self.validity().is_compatible(context, task)
    }

    pub fn owns(&self, row: &R) -> bool {
        match self {
            ResultSet::Single(single) => single.rows.iter().any(|own| ptr::eq(own, row)),
            ResultSet::Aggregate(aggregate) => aggregate.children().any(|child| child.owns(row)),
        }
    }
}
