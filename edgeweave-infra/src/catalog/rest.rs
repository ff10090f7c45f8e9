//! HTTP catalog backed by the policy REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::{ApiErrorPayload, CatalogClient, CatalogError, ListResult, RealizedEntity};

const API_PREFIX: &str = "/policy/api/v1";
const REALIZED_ENTITIES: &str = "/infra/realized-state/realized-entities";

/// Connection settings for [`RestCatalog`].
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Manager address, e.g. `https://nsx.example.com`.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Accept self-signed manager certificates.
    pub insecure: bool,
    pub timeout: Duration,
}

/// Policy API client using basic authentication.
pub struct RestCatalog {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
}

impl RestCatalog {
    pub fn new(config: RestConfig) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let base = format!("{}{}", config.endpoint.trim_end_matches('/'), API_PREFIX);
        Ok(Self {
            http,
            base,
            username: config.username,
            password: config.password,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, req: RequestBuilder, path: &str) -> Result<Response, CatalogError> {
        let resp = req
            .send()
            .await
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let status = resp.status();
        debug!(path = %path, status = %status, "Policy API response");
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound {
                path: path.to_string(),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        let payload = serde_json::from_str::<ApiErrorPayload>(&body).unwrap_or_else(|_| {
            let text = body.trim();
            if text.is_empty() {
                ApiErrorPayload::new(status.to_string())
            } else {
                ApiErrorPayload::new(text)
            }
        });
        Err(CatalogError::Api {
            status: status.as_u16(),
            payload,
        })
    }

    async fn json(&self, req: RequestBuilder, path: &str) -> Result<Value, CatalogError> {
        self.send(req, path)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CatalogClient for RestCatalog {
    async fn list(
        &self,
        collection: &str,
        cursor: Option<&str>,
    ) -> Result<ListResult<Value>, CatalogError> {
        let mut req = self.request(Method::GET, collection);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let value = self.json(req, collection).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get(&self, path: &str) -> Result<Value, CatalogError> {
        self.json(self.request(Method::GET, path), path).await
    }

    async fn patch(&self, path: &str, body: Value) -> Result<(), CatalogError> {
        self.send(self.request(Method::PATCH, path).json(&body), path)
            .await?;
        Ok(())
    }

    async fn update(&self, path: &str, body: Value) -> Result<Value, CatalogError> {
        self.json(self.request(Method::PUT, path).json(&body), path)
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), CatalogError> {
        self.send(self.request(Method::DELETE, path), path).await?;
        Ok(())
    }

    async fn realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, CatalogError> {
        let req = self
            .request(Method::GET, REALIZED_ENTITIES)
            .query(&[("intent_path", intent_path)]);
        let value = self.json(req, intent_path).await?;
        let page: ListResult<RealizedEntity> = serde_json::from_value(value)?;
        Ok(page.results)
    }
}
