//! Client for the SQL Statement Execution REST API

use polyquery::{DataError, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Server-side wait before a submission returns a pending statement
const WAIT_TIMEOUT: &str = "10s";

#[derive(Clone)]
pub(crate) struct Api {
    http: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatementRequest<'a> {
    pub warehouse_id: &'a str,
    pub statement: &'a str,
    pub wait_timeout: &'static str,
    pub on_wait_timeout: &'static str,
    pub disposition: &'static str,
    pub format: &'static str,
    pub catalog: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<&'a str>,
}

impl<'a> StatementRequest<'a> {
    pub fn new(
        warehouse_id: &'a str,
        statement: &'a str,
        catalog: &'a str,
        schema: Option<&'a str>,
    ) -> Self {
        Self {
            warehouse_id,
            statement,
            wait_timeout: WAIT_TIMEOUT,
            on_wait_timeout: "CONTINUE",
            disposition: "INLINE",
            format: "JSON_ARRAY",
            catalog,
            schema,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatementResponse {
    pub statement_id: Option<String>,
    pub status: StatementStatus,
    pub manifest: Option<Manifest>,
    pub result: Option<ResultData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatementStatus {
    pub state: StatementState,
    pub error: Option<ServiceError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum StatementState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Closed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceError {
    pub error_code: Option<String>,
    pub message: Option<String>,
}

impl ServiceError {
    pub fn describe(&self) -> String {
        match (&self.error_code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Manifest {
    pub schema: Option<ManifestSchema>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ManifestSchema {
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ColumnInfo {
    pub name: String,
    pub type_name: Option<String>,
    pub type_text: Option<String>,
}

/// One chunk of an inline `JSON_ARRAY` result
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ResultData {
    pub data_array: Option<Vec<Vec<Option<String>>>>,
    pub next_chunk_internal_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Warehouse {
    pub id: Option<String>,
    pub name: Option<String>,
    pub state: Option<String>,
}

impl Api {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            DataError::invalid_connection_string("access token contains invalid characters")
        })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| {
                error!("Failed to build HTTP client: {}", e);
                DataError::ConnectionFailed(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/2.0/sql{}", self.base_url, path)
    }

    pub async fn get_warehouse(&self, id: &str) -> Result<Warehouse> {
        self.send(self.http.get(self.url(&format!("/warehouses/{}", id))), "get warehouse")
            .await
    }

    pub async fn submit(&self, request: &StatementRequest<'_>) -> Result<StatementResponse> {
        self.send(
            self.http.post(self.url("/statements")).json(request),
            "submit statement",
        )
        .await
    }

    pub async fn get_statement(&self, id: &str) -> Result<StatementResponse> {
        self.send(
            self.http.get(self.url(&format!("/statements/{}", id))),
            "poll statement",
        )
        .await
    }

    /// Fetch a follow-up chunk; `link` is the server-relative
    /// `next_chunk_internal_link`
    pub async fn get_chunk(&self, link: &str) -> Result<ResultData> {
        self.send(
            self.http.get(format!("{}{}", self.base_url, link)),
            "fetch result chunk",
        )
        .await
    }

    /// Request cancellation without waiting for it
    ///
    /// Does nothing outside a tokio runtime.
    pub fn cancel_in_background(&self, id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let request = self.http.post(self.url(&format!("/statements/{}/cancel", id)));
        runtime.spawn(async move {
            debug!("Cancelling statement {}", id);
            if let Err(e) = request.send().await {
                warn!("Failed to cancel statement {}: {}", id, e);
            }
        });
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request.send().await.map_err(|e| {
            error!("Failed to {}: {}", what, e);
            DataError::backend(format!("failed to {}", what), e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ServiceError>(&body)
                .map(|e| e.describe())
                .unwrap_or(body);
            error!("Failed to {}: HTTP {}: {}", what, status, detail);
            return Err(DataError::backend_msg(format!(
                "failed to {}: HTTP {}: {}",
                what,
                status.as_u16(),
                detail
            )));
        }

        response.json().await.map_err(|e| {
            error!("Failed to parse {} response: {}", what, e);
            DataError::backend(format!("failed to parse {} response", what), e)
        })
    }
}
