use polyquery::{DataError, Result};
use std::fmt;
use url::Url;

/// Parsed Databricks connection string
///
/// Format: `token:<token>@<host>[:port]/<http path>?catalog=<catalog>[&schema=<schema>]`.
/// The scheme is optional and defaults to `https`; `http://` is accepted for
/// local gateways.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabricksConfig {
    /// `scheme://host[:port]`
    pub base_url: String,
    pub token: String,
    pub http_path: String,
    /// Last segment of the HTTP path
    pub warehouse_id: String,
    pub catalog: String,
    pub schema: Option<String>,
}

impl DatabricksConfig {
    pub fn parse(conn: &str) -> Result<Self> {
        let raw = if conn.contains("://") {
            conn.to_string()
        } else {
            format!("https://{}", conn)
        };

        let url = Url::parse(&raw).map_err(|e| {
            DataError::invalid_connection_string(format!(
                "failed to parse Databricks connection string: {}",
                e
            ))
        })?;

        let scheme = match url.scheme() {
            "https" | "databricks" => "https",
            "http" => "http",
            other => {
                return Err(DataError::invalid_connection_string(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DataError::invalid_connection_string("missing host"))?;

        let token = url
            .password()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                DataError::invalid_connection_string(
                    "missing access token, expected token:<token>@<host>",
                )
            })?
            .to_string();

        let http_path = url.path().trim_end_matches('/').to_string();
        let warehouse_id = http_path
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                DataError::invalid_connection_string("missing warehouse HTTP path")
            })?
            .to_string();

        let mut catalog = None;
        let mut schema = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "catalog" if !value.is_empty() => catalog = Some(value.into_owned()),
                "schema" if !value.is_empty() => schema = Some(value.into_owned()),
                _ => {}
            }
        }

        let catalog = catalog.ok_or_else(|| {
            DataError::invalid_connection_string(
                "required parameter '?catalog=<catalog>' is missing",
            )
        })?;

        let base_url = match url.port() {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };

        Ok(Self {
            base_url,
            token,
            http_path,
            warehouse_id,
            catalog,
            schema,
        })
    }

    /// Same warehouse, different catalog
    pub fn with_catalog(&self, catalog: &str) -> Self {
        Self {
            catalog: catalog.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for DatabricksConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabricksConfig")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("http_path", &self.http_path)
            .field("warehouse_id", &self.warehouse_id)
            .field("catalog", &self.catalog)
            .field("schema", &self.schema)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn_without_scheme() {
        let config = DatabricksConfig::parse(
            "token:dapi123@adb-42.azuredatabricks.net:443/sql/1.0/warehouses/abc123?catalog=main",
        )
        .unwrap();

        assert_eq!(config.base_url, "https://adb-42.azuredatabricks.net");
        assert_eq!(config.token, "dapi123");
        assert_eq!(config.http_path, "/sql/1.0/warehouses/abc123");
        assert_eq!(config.warehouse_id, "abc123");
        assert_eq!(config.catalog, "main");
        assert_eq!(config.schema, None);
    }

    #[test]
    fn test_parse_http_with_port_and_schema() {
        let config = DatabricksConfig::parse(
            "http://token:t@127.0.0.1:8080/sql/1.0/warehouses/wh/?catalog=dev&schema=sales",
        )
        .unwrap();

        assert_eq!(config.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.warehouse_id, "wh");
        assert_eq!(config.schema.as_deref(), Some("sales"));
    }

    #[test]
    fn test_parse_rejects_incomplete_strings() {
        for conn in [
            "token:t@host/sql/1.0/warehouses/wh",
            "token:t@host/sql/1.0/warehouses/wh?catalog=",
            "host/sql/1.0/warehouses/wh?catalog=main",
            "token:t@host/?catalog=main",
            "ftp://token:t@host/sql/wh?catalog=main",
        ] {
            assert!(
                matches!(
                    DatabricksConfig::parse(conn),
                    Err(DataError::InvalidConnectionString(_))
                ),
                "{} should be rejected",
                conn
            );
        }
    }

    #[test]
    fn test_with_catalog_keeps_warehouse() {
        let config =
            DatabricksConfig::parse("token:t@host/sql/1.0/warehouses/wh?catalog=main").unwrap();
        let switched = config.with_catalog("samples");

        assert_eq!(switched.catalog, "samples");
        assert_eq!(switched.warehouse_id, config.warehouse_id);
        assert_eq!(switched.token, config.token);
    }

    #[test]
    fn test_debug_hides_token() {
        let config =
            DatabricksConfig::parse("token:secret@host/sql/1.0/warehouses/wh?catalog=main")
                .unwrap();
        assert!(!format!("{:?}", config).contains("secret"));
    }
}
