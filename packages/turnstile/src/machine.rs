//! The machine contract shared by local and remote resources.
//!
//! A machine binds a [`Schema`] to a persistence strategy. The transition
//! algorithm itself lives in [`executor`](crate::executor) and is identical
//! for both variants; what varies is how records are read and saved:
//!
//! - [`ResourceMachine`](crate::resource::ResourceMachine) reads and writes
//!   tenancy-scoped, soft-delete-filtered rows in local storage.
//! - [`ServiceMachine`](crate::service::ServiceMachine) proxies reads and
//!   writes to a remote API; the record is the remote response.
//!
//! All methods take the engine and client explicitly. Machines hold no
//! back-references; the registry owns them.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::client::Client;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::pagination::Pagination;
use crate::query::{Filter, FilterOp};
use crate::schema::{Record, Schema};
use crate::tenancy::TenancyMode;

/// Which persistence strategy a machine uses. Drives the rule stage at
/// which id-reference props are resolved during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    Resource,
    Service,
}

/// Record-level contract each machine variant implements.
///
/// At most one writer per record per transaction is assumed; no
/// optimistic-concurrency check happens at this layer.
#[async_trait]
pub trait Machine: Send + Sync {
    fn schema(&self) -> &Schema;

    fn kind(&self) -> MachineKind;

    /// Machine name, as used in error codes and cache keys.
    fn name(&self) -> &str {
        &self.schema().name
    }

    /// Read one record by id. Soft-deleted records read as absent.
    async fn read_one(
        &self,
        engine: &Engine,
        client: &Client,
        id: Uuid,
        tenancy: TenancyMode,
    ) -> Result<Record, EngineError>;

    /// Read all records, paginated.
    async fn read_all(
        &self,
        engine: &Engine,
        client: &Client,
        page: Option<&Pagination>,
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError>;

    /// Read the group of records whose `key` column equals `value`.
    async fn read_group(
        &self,
        engine: &Engine,
        client: &Client,
        key: &str,
        value: &Value,
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError>;

    /// Read records whose `column` is a member of `values`.
    ///
    /// Used by the query translator when walking link chains.
    async fn read_in(
        &self,
        engine: &Engine,
        client: &Client,
        column: &str,
        values: &[Value],
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError>;

    /// Read records matching a single column comparison.
    ///
    /// Used by the query translator at the innermost end of a link chain.
    async fn read_matching(
        &self,
        engine: &Engine,
        client: &Client,
        column: &str,
        op: FilterOp,
        value: &Value,
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError>;

    /// Execute a resolved filter query.
    async fn query(
        &self,
        engine: &Engine,
        client: &Client,
        filter: &Filter,
        page: Option<&Pagination>,
    ) -> Result<Vec<Record>, EngineError>;

    /// Persist the record, refreshing it in place from the authoritative
    /// row/response.
    async fn save(
        &self,
        engine: &Engine,
        client: &Client,
        record: &mut Record,
    ) -> Result<(), EngineError>;

    /// Whether a live record other than `exclude` holds `value` in
    /// `column`. Backs the `Unique` validation rule.
    async fn exists_where(
        &self,
        engine: &Engine,
        client: &Client,
        column: &str,
        value: &Value,
        exclude: Option<Uuid>,
    ) -> Result<bool, EngineError>;
}
