//! Chainable, lazy queries over a table.
//!
//! A [`Query`] picks one index to iterate (the primary `:url` index unless
//! `where_` / `order_by` name another), walks it page by page in ascending
//! or descending key order, and feeds each record through the filters,
//! the `until` stop predicate, the offset and the limit:
//!
//! ```ignore
//! let recent = db.table("posts").unwrap()
//!     .where_("createdAt")?
//!     .above(1_700_000_000)?
//!     .filter(|r| r.field("draft") != Some(&json!(true)))
//!     .reverse()
//!     .limit(10)
//!     .to_array()
//!     .await?;
//! ```
//!
//! Range operators are pushed down into the index scan. Set operators and
//! case-insensitive matching scan the whole index and test each entry.

use std::collections::HashSet;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use drive_index_core::keys::{
    above_range, below_range, decode_value, encode_value, equals_range, lower_bound,
    split_entry_key, starts_with_range, upper_bound,
};
use drive_index_core::pipeline::process_for_write;
use drive_index_core::store::{KeyRange, Sublevel};
use drive_index_core::table_def::URL_INDEX;
use drive_index_core::{IndexError, Record, Result};

use crate::source::with_timeout;
use crate::table::Table;

/// Records fetched per store scan.
const PAGE_SIZE: usize = 100;

pub type RecordPredicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;
type ValuePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Change applied by `update` / `upsert`.
#[derive(Clone)]
pub enum Update {
    /// Shallow merge of these fields into the record.
    Patch(Map<String, Value>),
    /// Arbitrary in-place edit of the record payload.
    With(Arc<dyn Fn(&mut Value) + Send + Sync>),
}

impl Update {
    /// A patch from a JSON object.
    pub fn patch(fields: Value) -> Result<Self> {
        match fields {
            Value::Object(map) => Ok(Update::Patch(map)),
            other => Err(IndexError::Parameter(format!(
                "update() expects an object or a function, got {}",
                other
            ))),
        }
    }

    pub fn with<F>(f: F) -> Self
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        Update::With(Arc::new(f))
    }

    pub fn apply(&self, value: &mut Value) {
        match self {
            Update::Patch(fields) => {
                if let Value::Object(target) = value {
                    for (k, v) in fields {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
            Update::With(f) => f(value),
        }
    }

    /// The record an upsert creates when nothing exists yet.
    pub fn initial_value(&self) -> Value {
        let mut value = Value::Object(Map::new());
        self.apply(&mut value);
        value
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Patch(fields) => f.debug_tuple("Patch").field(fields).finish(),
            Update::With(_) => f.write_str("With(<fn>)"),
        }
    }
}

#[derive(Clone)]
enum Condition {
    All,
    /// Key ranges scanned one after the other, in ascending key order.
    Ranges(Vec<KeyRange>),
    /// Full index scan, keeping entries whose value passes.
    Matches(ValuePredicate),
    /// Full index scan, dropping entries whose key-space value is listed.
    Excluding(Arc<HashSet<String>>),
}

/// Per-entry test applied while scanning an index.
#[derive(Clone, Default)]
struct EntryFilter {
    predicate: Option<ValuePredicate>,
    excluded: Option<Arc<HashSet<String>>>,
}

impl EntryFilter {
    /// `encoded` is the record URL on the primary index and the encoded
    /// value on a secondary one.
    fn accepts(&self, encoded: &str, primary: bool) -> bool {
        if self.excluded.as_ref().is_some_and(|ex| ex.contains(encoded)) {
            return false;
        }
        let Some(predicate) = &self.predicate else {
            return true;
        };
        let value = if primary {
            Some(Value::String(encoded.to_string()))
        } else {
            decode_value(encoded)
        };
        value.is_some_and(|v| predicate(&v))
    }
}

#[derive(Clone)]
struct Order {
    index: String,
    condition: Condition,
}

/// A lazily evaluated query over one table.
#[derive(Clone)]
pub struct Query {
    table: Table,
    order: Option<Order>,
    filters: Vec<RecordPredicate>,
    reverse: bool,
    offset: usize,
    limit: Option<usize>,
    until: Option<RecordPredicate>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            order: None,
            filters: Vec::new(),
            reverse: false,
            offset: 0,
            limit: None,
            until: None,
        }
    }

    /// Iterate `index` with a condition. Only one `where_` / `order_by` per query.
    pub fn where_(self, index: &str) -> Result<WhereClause> {
        if self.order.is_some() {
            return Err(IndexError::Query(
                "Can not have two .where()s or a .where() after .orderBy()".to_string(),
            ));
        }
        self.check_index(index)?;
        Ok(WhereClause {
            query: self,
            index: index.to_string(),
        })
    }

    /// Iterate `index` in key order without restricting it.
    pub fn order_by(mut self, index: &str) -> Result<Self> {
        if self.order.is_some() {
            return Err(IndexError::Query(
                "Can not have an .orderBy() and a .where() - where() implicitly sets the order"
                    .to_string(),
            ));
        }
        self.check_index(index)?;
        self.order = Some(Order {
            index: index.to_string(),
            condition: Condition::All,
        });
        Ok(self)
    }

    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(f));
        self
    }

    /// Stop iterating at the first record for which `f` returns true.
    pub fn until<F>(mut self, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.until = Some(Arc::new(f));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    fn check_index(&self, index: &str) -> Result<()> {
        if index == URL_INDEX || self.table.state.index(index).is_some() {
            Ok(())
        } else {
            Err(IndexError::Query(format!(
                "Table '{}' has no index named '{}'",
                self.table.name(),
                index
            )))
        }
    }

    fn with_condition(mut self, index: String, condition: Condition) -> Self {
        self.order = Some(Order { index, condition });
        self
    }

    // terminals

    /// Visit every matching record in order.
    pub async fn each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Record),
    {
        self.iterate(|record| {
            f(record);
            true
        })
        .await
    }

    pub async fn count(&self) -> Result<usize> {
        let mut n = 0;
        self.iterate(|_| {
            n += 1;
            true
        })
        .await?;
        Ok(n)
    }

    pub async fn to_array(&self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        self.iterate(|record| {
            out.push(record);
            true
        })
        .await?;
        Ok(out)
    }

    pub async fn urls(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.iterate(|record| {
            out.push(record.url);
            true
        })
        .await?;
        Ok(out)
    }

    /// Values of the iterated index for every match: each element for
    /// array fields, the record URL when iterating the primary index.
    pub async fn keys(&self) -> Result<Vec<Value>> {
        let field = self
            .order
            .as_ref()
            .and_then(|o| self.table.state.index(&o.index))
            .map(|i| i.spec.field.clone());
        let mut out = Vec::new();
        self.iterate(|record| {
            match &field {
                Some(field) => match record.field(field) {
                    Some(Value::Array(items)) => out.extend(items.iter().cloned()),
                    Some(value) => out.push(value.clone()),
                    None => {}
                },
                None => out.push(Value::String(record.url)),
            }
            true
        })
        .await?;
        Ok(out)
    }

    /// [`keys`](Self::keys) without duplicates, first occurrence wins.
    pub async fn unique_keys(&self) -> Result<Vec<Value>> {
        let mut seen = HashSet::new();
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| seen.insert(k.to_string()))
            .collect())
    }

    pub async fn first(&self) -> Result<Option<Record>> {
        Ok(self.clone().limit(1).to_array().await?.into_iter().next())
    }

    pub async fn last(&self) -> Result<Option<Record>> {
        self.clone().reverse().first().await
    }

    /// Apply `update` to every match and write it back. Records whose
    /// source is not registered or not writable are skipped. Returns the
    /// number of records written.
    pub async fn update(&self, update: Update) -> Result<usize> {
        let records = self.to_array().await?;
        let mut changed = 0;
        for record in records {
            let mut value = record.value.clone();
            update.apply(&mut value);
            if self.table.is_helper() {
                let stored = process_for_write(&self.table.state.def, value)?;
                self.table
                    .state
                    .index_put(Record::new(record.url, record.origin, stored))
                    .await?;
                changed += 1;
                continue;
            }
            let source = match self.table.writable_source(&record.origin, "update") {
                Ok(source) => source,
                Err(e) => {
                    warn!(url = %record.url, error = %e, "update not enacted");
                    continue;
                }
            };
            let stored = process_for_write(&self.table.state.def, value)?;
            let bytes = serde_json::to_vec(&stored)?;
            let inner = &self.table.db.inner;
            with_timeout(
                source.url(),
                inner.options.read_timeout,
                source.write_file(record.path(), &bytes),
            )
            .await?;
            inner.index_drive(&source).await?;
            changed += 1;
        }
        debug!(table = self.table.name(), changed, "update applied");
        Ok(changed)
    }

    /// Delete every match. File-backed records are unlinked from their
    /// source; records whose source is missing or read-only are skipped.
    pub async fn delete(&self) -> Result<usize> {
        let records = self.to_array().await?;
        let mut deleted = 0;
        for record in records {
            if self.table.is_helper() {
                if self
                    .table
                    .state
                    .index_delete(&record.url, &record.origin)
                    .await?
                {
                    deleted += 1;
                }
                continue;
            }
            let source = match self.table.writable_source(&record.origin, "delete") {
                Ok(source) => source,
                Err(e) => {
                    warn!(url = %record.url, error = %e, "delete not enacted");
                    continue;
                }
            };
            let inner = &self.table.db.inner;
            match with_timeout(
                source.url(),
                inner.options.read_timeout,
                source.unlink(record.path()),
            )
            .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            inner.index_drive(&source).await?;
            deleted += 1;
        }
        debug!(table = self.table.name(), deleted, "delete applied");
        Ok(deleted)
    }

    /// Shared iteration primitive. `visit` returns false to stop early.
    async fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Record) -> bool,
    {
        if self.limit == Some(0) {
            return Ok(());
        }
        let state = &self.table.state;
        let (level, primary, condition) = match &self.order {
            Some(order) if order.index != URL_INDEX => {
                let index = state.index(&order.index).ok_or_else(|| {
                    IndexError::Query(format!("Unknown index '{}'", order.index))
                })?;
                (&index.level, false, order.condition.clone())
            }
            Some(order) => (&state.primary, true, order.condition.clone()),
            None => (&state.primary, true, Condition::All),
        };

        let (mut ranges, entry_filter) = match condition {
            Condition::All => (vec![KeyRange::all()], EntryFilter::default()),
            Condition::Ranges(ranges) => (ranges, EntryFilter::default()),
            Condition::Matches(p) => (
                vec![KeyRange::all()],
                EntryFilter {
                    predicate: Some(p),
                    excluded: None,
                },
            ),
            Condition::Excluding(keys) => (
                vec![KeyRange::all()],
                EntryFilter {
                    predicate: None,
                    excluded: Some(keys),
                },
            ),
        };
        if self.reverse {
            ranges.reverse();
        }

        let mut cursor = Cursor {
            query: self,
            seen: HashSet::new(),
            skipped: 0,
            emitted: 0,
        };
        for range in ranges {
            let keep_going = cursor
                .scan_range(level, &state.primary, primary, range, &entry_filter, &mut visit)
                .await?;
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}

struct Cursor<'q> {
    query: &'q Query,
    seen: HashSet<String>,
    skipped: usize,
    emitted: usize,
}

impl Cursor<'_> {
    /// Returns false once iteration must stop.
    async fn scan_range<F>(
        &mut self,
        level: &Sublevel,
        primary_level: &Sublevel,
        primary: bool,
        range: KeyRange,
        entry_filter: &EntryFilter,
        visit: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(Record) -> bool,
    {
        let reverse = self.query.reverse;
        let mut range = range;
        loop {
            if range.is_empty() {
                return Ok(true);
            }
            let page = level.scan(&range, reverse, Some(PAGE_SIZE)).await?;
            let Some(last_key) = page.last().map(|(k, _)| k.clone()) else {
                return Ok(true);
            };
            let full_page = page.len() == PAGE_SIZE;

            for (key, stored) in page {
                let record = if primary {
                    if !entry_filter.accepts(&key, true) {
                        continue;
                    }
                    match serde_json::from_value::<Record>(stored) {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(key = %key, error = %e, "skipping undecodable record");
                            continue;
                        }
                    }
                } else {
                    let Some((encoded, url)) = split_entry_key(&key) else {
                        continue;
                    };
                    if !entry_filter.accepts(encoded, false) {
                        continue;
                    }
                    if self.seen.contains(url) {
                        continue;
                    }
                    self.seen.insert(url.to_string());
                    match primary_level.get_as::<Record>(url).await? {
                        Some(record) => record,
                        None => continue,
                    }
                };

                if !self.query.filters.iter().all(|f| f(&record)) {
                    continue;
                }
                if let Some(until) = &self.query.until {
                    if until(&record) {
                        return Ok(false);
                    }
                }
                if self.skipped < self.query.offset {
                    self.skipped += 1;
                    continue;
                }
                if !visit(record) {
                    return Ok(false);
                }
                self.emitted += 1;
                if self.query.limit.is_some_and(|limit| self.emitted >= limit) {
                    return Ok(false);
                }
            }

            if !full_page {
                return Ok(true);
            }
            range = range.resume_after(&last_key, reverse);
        }
    }
}

/// Condition builder returned by [`Query::where_`].
pub struct WhereClause {
    query: Query,
    index: String,
}

impl WhereClause {
    fn is_primary(&self) -> bool {
        self.index == URL_INDEX
    }

    /// Key-space form of `value` for this index.
    fn key_of(&self, value: &Value) -> Result<String> {
        if self.is_primary() {
            return value.as_str().map(str::to_string).ok_or_else(|| {
                IndexError::Parameter(format!("'{}' values must be strings, got {}", URL_INDEX, value))
            });
        }
        encode_value(value).ok_or_else(|| {
            IndexError::Parameter(format!(
                "Cannot compare index '{}' against {}",
                self.index, value
            ))
        })
    }

    fn equal_range(&self, value: &Value) -> Result<KeyRange> {
        let key = self.key_of(value)?;
        Ok(if self.is_primary() {
            KeyRange::new(Bound::Included(key.clone()), Bound::Included(key))
        } else {
            equals_range(&key)
        })
    }

    fn ranged(self, range: KeyRange) -> Query {
        let index = self.index;
        self.query.with_condition(index, Condition::Ranges(vec![range]))
    }

    fn matching<F>(self, f: F) -> Query
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let index = self.index;
        self.query.with_condition(index, Condition::Matches(Arc::new(f)))
    }

    pub fn equals(self, value: impl Into<Value>) -> Result<Query> {
        let range = self.equal_range(&value.into())?;
        Ok(self.ranged(range))
    }

    pub fn not_equal(self, value: impl Into<Value>) -> Result<Query> {
        self.excluding(std::iter::once(value.into()))
    }

    pub fn above(self, value: impl Into<Value>) -> Result<Query> {
        self.bounded_below(value.into(), false)
    }

    pub fn above_or_equal(self, value: impl Into<Value>) -> Result<Query> {
        self.bounded_below(value.into(), true)
    }

    pub fn below(self, value: impl Into<Value>) -> Result<Query> {
        self.bounded_above(value.into(), false)
    }

    pub fn below_or_equal(self, value: impl Into<Value>) -> Result<Query> {
        self.bounded_above(value.into(), true)
    }

    fn bounded_below(self, value: Value, inclusive: bool) -> Result<Query> {
        let key = self.key_of(&value)?;
        let range = if self.is_primary() {
            let lower = if inclusive {
                Bound::Included(key)
            } else {
                Bound::Excluded(key)
            };
            KeyRange::new(lower, Bound::Unbounded)
        } else {
            above_range(&key, inclusive)
        };
        Ok(self.ranged(range))
    }

    fn bounded_above(self, value: Value, inclusive: bool) -> Result<Query> {
        let key = self.key_of(&value)?;
        let range = if self.is_primary() {
            let upper = if inclusive {
                Bound::Included(key)
            } else {
                Bound::Excluded(key)
            };
            KeyRange::new(Bound::Unbounded, upper)
        } else {
            below_range(&key, inclusive)
        };
        Ok(self.ranged(range))
    }

    /// Values between `lower` and `upper`. Both bounds must be of the same
    /// JSON type.
    pub fn between(
        self,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
        include_lower: bool,
        include_upper: bool,
    ) -> Result<Query> {
        let lo = self.key_of(&lower.into())?;
        let hi = self.key_of(&upper.into())?;
        let range = if self.is_primary() {
            let l = if include_lower { Bound::Included(lo) } else { Bound::Excluded(lo) };
            let u = if include_upper { Bound::Included(hi) } else { Bound::Excluded(hi) };
            KeyRange::new(l, u)
        } else {
            if lo.chars().next() != hi.chars().next() {
                return Err(IndexError::Parameter(
                    "between() bounds must be of the same type".to_string(),
                ));
            }
            KeyRange::new(lower_bound(&lo, include_lower), upper_bound(&hi, include_upper))
        };
        Ok(self.ranged(range))
    }

    pub fn any_of<I, V>(self, values: I) -> Result<Query>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut keyed = Vec::new();
        for value in values {
            let value = value.into();
            keyed.push((self.key_of(&value)?, value));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        let ranges = keyed
            .iter()
            .map(|(_, v)| self.equal_range(v))
            .collect::<Result<Vec<_>>>()?;
        let index = self.index;
        Ok(self.query.with_condition(index, Condition::Ranges(ranges)))
    }

    pub fn none_of<I, V>(self, values: I) -> Result<Query>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.excluding(values.into_iter().map(Into::<Value>::into))
    }

    /// Compared in key space so `2` and `2.0` are the same value.
    fn excluding(self, values: impl Iterator<Item = Value>) -> Result<Query> {
        let keys = values
            .map(|v| self.key_of(&v))
            .collect::<Result<HashSet<_>>>()?;
        let index = self.index;
        Ok(self
            .query
            .with_condition(index, Condition::Excluding(Arc::new(keys))))
    }

    pub fn starts_with(self, prefix: &str) -> Result<Query> {
        let range = if self.is_primary() {
            KeyRange::prefix(prefix)
        } else {
            starts_with_range(prefix)
        };
        Ok(self.ranged(range))
    }

    pub fn equals_ignore_case(self, value: &str) -> Result<Query> {
        let wanted = value.to_lowercase();
        Ok(self.matching(move |v| {
            v.as_str().is_some_and(|s| s.to_lowercase() == wanted)
        }))
    }

    pub fn starts_with_ignore_case(self, prefix: &str) -> Result<Query> {
        let wanted = prefix.to_lowercase();
        Ok(self.matching(move |v| {
            v.as_str().is_some_and(|s| s.to_lowercase().starts_with(&wanted))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_merges_shallowly() {
        let update = Update::patch(json!({"name": "b", "extra": 1})).unwrap();
        let mut value = json!({"name": "a", "keep": true});
        update.apply(&mut value);
        assert_eq!(value, json!({"name": "b", "keep": true, "extra": 1}));
    }

    #[test]
    fn patch_requires_an_object() {
        assert!(matches!(Update::patch(json!(3)), Err(IndexError::Parameter(_))));
    }

    #[test]
    fn initial_value_applies_to_an_empty_record() {
        let update = Update::with(|v| {
            v["count"] = json!(1);
        });
        assert_eq!(update.initial_value(), json!({"count": 1}));
    }
}
