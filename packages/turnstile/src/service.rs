//! Remote service machine: records live behind an HTTP API.
//!
//! The transition algorithm is unchanged; only persistence differs. Reads
//! are GETs against the schema's remote path, filters serialize to their
//! compact wire form as query parameters, and saves POST (create) or use
//! the transition's declared verb against the item URL. The remote owns
//! tenancy and uniqueness; this machine enforces neither.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::client::Client;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::machine::{Machine, MachineKind};
use crate::pagination::Pagination;
use crate::query::{operand_to_string, Filter, FilterOp};
use crate::remote::{RemoteBackend, Verb};
use crate::schema::{Record, Schema};
use crate::tenancy::TenancyMode;

/// A machine proxying persistence to a [`RemoteBackend`].
pub struct ServiceMachine {
    schema: Schema,
    remote: Arc<dyn RemoteBackend>,
}

impl ServiceMachine {
    pub fn new(schema: Schema, remote: Arc<dyn RemoteBackend>) -> Self {
        ServiceMachine { schema, remote }
    }

    fn path(&self) -> String {
        self.schema
            .path
            .clone()
            .unwrap_or_else(|| format!("/{}", self.schema.table))
    }

    fn item_path(&self, id: Uuid) -> String {
        format!("{}/{id}", self.path().trim_end_matches('/'))
    }

    async fn list(
        &self,
        client: &Client,
        query: &[(String, String)],
    ) -> Result<Vec<Record>, EngineError> {
        let body = self
            .remote
            .request(client, Verb::Get, &self.path(), query, None)
            .await?;
        let items = match body {
            Some(Value::Array(items)) => items,
            // Some APIs wrap collections in `{ "data": [...] }`.
            Some(Value::Object(mut obj)) => match obj.remove("data") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(items.iter().map(Record::from_value).collect())
    }

    fn page_params(page: Option<&Pagination>, query: &mut Vec<(String, String)>) {
        if let Some(page) = page {
            let page = page.clone().normalize();
            query.push(("page".into(), page.page.to_string()));
            query.push(("per_page".into(), page.per_page.to_string()));
        }
    }
}

#[async_trait]
impl Machine for ServiceMachine {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Service
    }

    async fn read_one(
        &self,
        _engine: &Engine,
        client: &Client,
        id: Uuid,
        _tenancy: TenancyMode,
    ) -> Result<Record, EngineError> {
        let body = self
            .remote
            .request(client, Verb::Get, &self.item_path(id), &[], None)
            .await?;
        match body {
            Some(value) if !value.is_null() => Ok(Record::from_value(&value)),
            _ => Err(EngineError::NotFound {
                machine: self.schema.name.clone(),
            }),
        }
    }

    async fn read_all(
        &self,
        _engine: &Engine,
        client: &Client,
        page: Option<&Pagination>,
        _tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let mut query = Vec::new();
        Self::page_params(page, &mut query);
        self.list(client, &query).await
    }

    async fn read_group(
        &self,
        _engine: &Engine,
        client: &Client,
        key: &str,
        value: &Value,
        _tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let query = vec![(format!("{key}_eq"), operand_to_string(value))];
        self.list(client, &query).await
    }

    async fn read_in(
        &self,
        _engine: &Engine,
        client: &Client,
        column: &str,
        values: &[Value],
        _tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let operand = Value::Array(values.to_vec());
        let query = vec![(format!("{column}_in"), operand_to_string(&operand))];
        self.list(client, &query).await
    }

    async fn read_matching(
        &self,
        _engine: &Engine,
        client: &Client,
        column: &str,
        op: FilterOp,
        value: &Value,
        _tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let query = vec![(format!("{column}_{}", op.code()), operand_to_string(value))];
        self.list(client, &query).await
    }

    async fn query(
        &self,
        _engine: &Engine,
        client: &Client,
        filter: &Filter,
        page: Option<&Pagination>,
    ) -> Result<Vec<Record>, EngineError> {
        let mut query: Vec<(String, String)> = filter
            .to_query()
            .iter()
            .map(|(key, value)| (key.clone(), operand_to_string(value)))
            .collect();
        Self::page_params(page, &mut query);
        self.list(client, &query).await
    }

    async fn save(
        &self,
        _engine: &Engine,
        client: &Client,
        record: &mut Record,
    ) -> Result<(), EngineError> {
        // The executing transition is on top of the action stack.
        let frame = client.top().ok_or_else(|| EngineError::SaveFailed {
            machine: self.schema.name.clone(),
            message: "save outside a transition".to_string(),
        })?;
        let (verb, url) = if frame.transition == "create" {
            (Verb::Post, self.path())
        } else {
            let verb = self
                .schema
                .transition(&frame.transition)
                .and_then(|t| t.verb)
                .unwrap_or(Verb::Patch);
            (verb, self.item_path(record.id))
        };

        let body = record.to_value();
        let response = self
            .remote
            .request(client, verb, &url, &[], Some(&body))
            .await?;
        if let Some(value) = response {
            if value.is_object() {
                let mut refreshed = Record::from_value(&value);
                // Keep our id when the remote echoes a partial body.
                if value.get("id").is_none() {
                    refreshed.id = record.id;
                }
                *record = refreshed;
            }
        }
        Ok(())
    }

    /// The remote owns its uniqueness constraints; nothing to check here,
    /// so no conflict is ever reported.
    async fn exists_where(
        &self,
        _engine: &Engine,
        _client: &Client,
        _column: &str,
        _value: &Value,
        _exclude: Option<Uuid>,
    ) -> Result<bool, EngineError> {
        Ok(false)
    }
}
