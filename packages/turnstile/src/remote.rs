//! The remote-service collaborator contract.
//!
//! A [`ServiceMachine`](crate::service::ServiceMachine) persists through a
//! remote HTTP API instead of local storage. The engine only needs one
//! capability from it: execute a verb+URL+query+body request and return
//! parsed JSON, mapping the distinguished "unauthorized" and "not-found"
//! statuses to their engine-level meanings.
//!
//! [`HttpRemote`] is the stock reqwest adapter. Custom backends (test
//! doubles, message-bus bridges) implement [`RemoteBackend`] directly.

use async_trait::async_trait;
use serde_json::Value;

use crate::client::Client;
use crate::error::EngineError;

/// HTTP verb for a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Verb {
    /// Read verbs map the configured not-found status to `None`; write
    /// verbs surface it as a request error.
    pub fn is_read(&self) -> bool {
        matches!(self, Verb::Get)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Patch => "PATCH",
            Verb::Put => "PUT",
            Verb::Delete => "DELETE",
        }
    }
}

/// Executes requests against a remote API.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Execute a request.
    ///
    /// Returns `Ok(None)` when a read verb hits the configured not-found
    /// status. Raises [`EngineError::AuthFailed`] on the unauthorized
    /// status and [`EngineError::RequestError`] for every other failure,
    /// carrying the upstream error body.
    async fn request(
        &self,
        client: &Client,
        verb: Verb,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, EngineError>;
}

/// reqwest-backed [`RemoteBackend`].
pub struct HttpRemote {
    http: reqwest::Client,
    base_url: String,
    /// Status treated as "not found" on read verbs. Some APIs use 404,
    /// others 410.
    not_found_status: u16,
    bearer_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpRemote {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            not_found_status: 404,
            bearer_token: None,
        }
    }

    /// Override the status mapped to "not found" on reads.
    pub fn not_found_status(mut self, status: u16) -> Self {
        self.not_found_status = status;
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn full_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl RemoteBackend for HttpRemote {
    async fn request(
        &self,
        client: &Client,
        verb: Verb,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Option<Value>, EngineError> {
        let full = self.full_url(url);
        let mut request = match verb {
            Verb::Get => self.http.get(&full),
            Verb::Post => self.http.post(&full),
            Verb::Patch => self.http.patch(&full),
            Verb::Put => self.http.put(&full),
            Verb::Delete => self.http.delete(&full),
        };

        request = request
            .query(query)
            .header("x-principal-id", client.principal.id.to_string());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| EngineError::RequestError {
            status: None,
            body: e.to_string(),
        })?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(EngineError::AuthFailed);
        }
        if status == self.not_found_status && verb.is_read() {
            return Ok(None);
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RequestError {
                status: Some(status),
                body,
            });
        }
        if status == 204 {
            return Ok(Some(Value::Null));
        }

        let parsed = response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::RequestError {
                status: Some(status),
                body: e.to_string(),
            })?;
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_read_classification() {
        assert!(Verb::Get.is_read());
        assert!(!Verb::Post.is_read());
        assert!(!Verb::Delete.is_read());
    }

    #[test]
    fn test_full_url_joins_cleanly() {
        let remote = HttpRemote::new("https://api.example.com/");
        assert_eq!(
            remote.full_url("/orders/1"),
            "https://api.example.com/orders/1"
        );
        let remote = HttpRemote::new("https://api.example.com");
        assert_eq!(remote.full_url("orders"), "https://api.example.com/orders");
    }
}
