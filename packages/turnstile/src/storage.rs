//! The storage collaborator contract.
//!
//! The engine does not own a database. It requires a relational-record layer
//! that can run flat predicate queries, save records, and answer column
//! introspection. Tenancy predicates and soft-delete exclusion are injected
//! by the resource machine as ordinary clauses; storage stays policy-free.
//!
//! # Error Split
//!
//! [`StorageError::BadQuery`] is a recognized, classifiable failure and is
//! normalized into [`EngineError::Storage`](crate::error::EngineError).
//! [`StorageError::Backend`] is opaque infrastructure failure carried as
//! `anyhow::Error`. Treating them the same loses the ability to re-raise
//! recognized storage errors verbatim through guard/save wrapping.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::client::TxHandle;
use crate::error::EngineError;
use crate::pagination::{Direction, Order, Pagination};
use crate::schema::Record;

// =============================================================================
// Storage Error
// =============================================================================

/// Errors from the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The query itself was malformed (unknown column, bad operand).
    #[error("malformed storage query: {0}")]
    BadQuery(String),

    /// Backend failure (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Storage {
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Query model
// =============================================================================

/// Column comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    /// Case-insensitive substring match.
    Like,
    Gte,
    Lte,
    /// Membership in an array operand.
    In,
    IsNull,
}

/// One column comparison.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: String,
    pub cmp: Cmp,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, cmp: Cmp, value: Value) -> Self {
        Predicate {
            column: column.into(),
            cmp,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Predicate::new(column, Cmp::Eq, value)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::new(column, Cmp::IsNull, Value::Null)
    }

    /// Evaluate this predicate against a candidate column value.
    ///
    /// `None` means the column is absent/null on the record.
    pub fn matches(&self, candidate: Option<&Value>) -> bool {
        match self.cmp {
            Cmp::IsNull => candidate.is_none() || candidate == Some(&Value::Null),
            _ => {
                let Some(candidate) = candidate else {
                    return false;
                };
                match self.cmp {
                    Cmp::Eq => candidate == &self.value,
                    Cmp::Like => match (candidate.as_str(), self.value.as_str()) {
                        (Some(hay), Some(needle)) => {
                            hay.to_lowercase().contains(&needle.to_lowercase())
                        }
                        _ => false,
                    },
                    Cmp::Gte => compare(candidate, &self.value).map(|o| o >= 0).unwrap_or(false),
                    Cmp::Lte => compare(candidate, &self.value).map(|o| o <= 0).unwrap_or(false),
                    Cmp::In => self
                        .value
                        .as_array()
                        .map(|arr| arr.contains(candidate))
                        .unwrap_or(false),
                    Cmp::IsNull => unreachable!(),
                }
            }
        }
    }
}

/// Numbers compare numerically, strings lexically. Returns sign of
/// `left - right`, or `None` when the types are incomparable.
pub(crate) fn compare(left: &Value, right: &Value) -> Option<i8> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Some(if l < r {
            -1
        } else if l > r {
            1
        } else {
            0
        });
    }
    if let (Some(l), Some(r)) = (left.as_str(), right.as_str()) {
        return Some(match l.cmp(r) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        });
    }
    None
}

/// A disjunction of predicates. A record matches the clause when any
/// predicate matches; a query matches when every clause matches.
#[derive(Debug, Clone)]
pub struct Clause {
    pub any: Vec<Predicate>,
}

impl Clause {
    pub fn one(predicate: Predicate) -> Self {
        Clause {
            any: vec![predicate],
        }
    }

    pub fn any_of(predicates: Vec<Predicate>) -> Self {
        Clause { any: predicates }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.any
            .iter()
            .any(|p| p.matches(record.column(&p.column).as_ref()))
    }
}

/// A flat, conjunctive query against one table.
#[derive(Debug, Clone)]
pub struct StorageQuery {
    pub table: String,
    pub clauses: Vec<Clause>,
    pub order: Vec<Order>,
    pub page: Option<Pagination>,
}

impl StorageQuery {
    pub fn table(table: impl Into<String>) -> Self {
        StorageQuery {
            table: table.into(),
            clauses: Vec::new(),
            order: Vec::new(),
            page: None,
        }
    }

    pub fn and(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn and_eq(self, column: impl Into<String>, value: Value) -> Self {
        self.and(Clause::one(Predicate::eq(column, value)))
    }

    pub fn paged(mut self, page: Pagination) -> Self {
        self.order = page.order.clone();
        self.page = Some(page);
        self
    }
}

// =============================================================================
// Storage contract
// =============================================================================

/// The relational-record layer the resource machine persists into.
///
/// All reads receive the caller's transaction handle; the engine performs no
/// implicit pooling or locking beyond what the backend provides.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run a flat predicate query and return matching records.
    async fn select(&self, tx: TxHandle, query: &StorageQuery)
        -> Result<Vec<Record>, StorageError>;

    /// Insert or update a record; returns the refreshed row.
    async fn save(
        &self,
        tx: TxHandle,
        table: &str,
        record: &Record,
    ) -> Result<Record, StorageError>;

    /// Hard-delete a record. The engine soft-deletes through `save`; this
    /// exists for administrative cleanup.
    async fn delete(&self, tx: TxHandle, table: &str, id: Uuid) -> Result<(), StorageError>;

    /// Whether the record type declares the given column.
    fn has_column(&self, table: &str, column: &str) -> bool;
}

// =============================================================================
// In-memory storage (testing)
// =============================================================================

/// In-memory [`Storage`] implementation for tests and examples.
///
/// Tables must be declared up front with their dynamic columns so that
/// `has_column` introspection behaves like a real schema. Lifecycle columns
/// are always present.
#[cfg(any(test, feature = "testing"))]
pub struct MemoryStorage {
    tables: std::sync::RwLock<HashMap<String, BTreeMap<Uuid, Record>>>,
    columns: HashMap<String, HashSet<String>>,
}

#[cfg(any(test, feature = "testing"))]
impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            tables: std::sync::RwLock::new(HashMap::new()),
            columns: HashMap::new(),
        }
    }

    /// Declare a table and its dynamic columns.
    pub fn with_table(
        mut self,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.columns.insert(
            table.into(),
            columns.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Seed a record directly, bypassing the engine. Test setup only.
    pub fn seed(&self, table: &str, record: Record) {
        let mut tables = self.tables.write().expect("storage lock poisoned");
        tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id, record);
    }

    /// Remove a record directly, bypassing the engine. Test setup only.
    pub fn remove(&self, table: &str, id: Uuid) {
        let mut tables = self.tables.write().expect("storage lock poisoned");
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(&id);
        }
    }

    fn lifecycle_column(column: &str) -> bool {
        matches!(
            column,
            "id" | "state"
                | "created_at"
                | "created_by"
                | "updated_at"
                | "updated_by"
                | "deleted_at"
                | "deleted_by"
        )
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl Storage for MemoryStorage {
    async fn select(
        &self,
        _tx: TxHandle,
        query: &StorageQuery,
    ) -> Result<Vec<Record>, StorageError> {
        for clause in &query.clauses {
            for predicate in &clause.any {
                if !self.has_column(&query.table, &predicate.column) {
                    return Err(StorageError::BadQuery(format!(
                        "unknown column '{}' on table '{}'",
                        predicate.column, query.table
                    )));
                }
            }
        }

        let tables = self.tables.read().expect("storage lock poisoned");
        let rows = tables.get(&query.table);
        let mut matched: Vec<Record> = rows
            .map(|rows| {
                rows.values()
                    .filter(|record| query.clauses.iter().all(|c| c.matches(record)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for order in query.order.iter().rev() {
            matched.sort_by(|a, b| {
                let left = a.column(&order.column);
                let right = b.column(&order.column);
                let ord = match (left, right) {
                    (Some(l), Some(r)) => {
                        compare(&l, &r).map(|s| s.cmp(&0)).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        if let Some(page) = &query.page {
            matched = matched
                .into_iter()
                .skip(page.offset())
                .take(page.limit())
                .collect();
        }

        Ok(matched)
    }

    async fn save(
        &self,
        _tx: TxHandle,
        table: &str,
        record: &Record,
    ) -> Result<Record, StorageError> {
        for column in record.fields.keys() {
            if !self.has_column(table, column) {
                return Err(StorageError::BadQuery(format!(
                    "unknown column '{column}' on table '{table}'"
                )));
            }
        }
        let mut tables = self.tables.write().expect("storage lock poisoned");
        tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn delete(&self, _tx: TxHandle, table: &str, id: Uuid) -> Result<(), StorageError> {
        let mut tables = self.tables.write().expect("storage lock poisoned");
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(&id);
        }
        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        if Self::lifecycle_column(column) {
            return true;
        }
        self.columns
            .get(table)
            .map(|cols| cols.contains(column))
            .unwrap_or(false)
    }
}
