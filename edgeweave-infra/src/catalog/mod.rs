//! Abstract policy catalog.
//!
//! The remote system is addressed by hierarchical policy paths
//! (`/infra/tier-1s/<id>`, `/infra/ip-pools/<pool>/ip-allocations/<id>`, ...).
//! [`CatalogClient`] is the raw, object-safe surface carrying JSON payloads;
//! [`Api`] binds it to one collection and one typed model.

pub mod memory;
pub mod model;
pub mod rest;

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryCatalog;
pub use model::*;
pub use rest::RestCatalog;

use crate::state::Reference;

/// Well-known collection paths.
pub mod paths {
    pub const DEFAULT_SITE: &str = "default";
    pub const DEFAULT_ENFORCEMENT_POINT: &str = "default";
    /// Slot name of the single locale service under a tier-1 gateway.
    pub const DEFAULT_LOCALE_SERVICE_ID: &str = "default";
    pub const NAT_TYPE_USER: &str = "USER";

    pub const TIER0S: &str = "/infra/tier-0s";
    pub const TIER1S: &str = "/infra/tier-1s";
    pub const SEGMENTS: &str = "/infra/segments";
    pub const IP_POOLS: &str = "/infra/ip-pools";

    pub fn edge_clusters() -> String {
        format!(
            "/infra/sites/{}/enforcement-points/{}/edge-clusters",
            DEFAULT_SITE, DEFAULT_ENFORCEMENT_POINT
        )
    }

    pub fn transport_zones() -> String {
        format!(
            "/infra/sites/{}/enforcement-points/{}/transport-zones",
            DEFAULT_SITE, DEFAULT_ENFORCEMENT_POINT
        )
    }

    pub fn locale_services(tier1_id: &str) -> String {
        format!("{}/{}/locale-services", TIER1S, tier1_id)
    }

    pub fn ip_allocations(pool_id: &str) -> String {
        format!("{}/{}/ip-allocations", IP_POOLS, pool_id)
    }

    pub fn nat_rules(tier1_id: &str) -> String {
        format!("{}/{}/nat/{}/nat-rules", TIER1S, tier1_id, NAT_TYPE_USER)
    }
}

/// Structured error body returned by the policy API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiErrorPayload {
    #[serde(rename = "httpStatus", skip_serializing_if = "Option::is_none")]
    pub http_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_errors: Vec<ApiErrorPayload>,
}

impl ApiErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Flatten the payload into one readable line.
    pub fn summary(&self) -> String {
        let mut out = match (&self.error_message, self.error_code) {
            (Some(msg), Some(code)) => format!("{} (code {})", msg.trim(), code),
            (Some(msg), None) => msg.trim().to_string(),
            (None, Some(code)) => format!("error code {}", code),
            (None, None) => self
                .http_status
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        };
        for related in &self.related_errors {
            out.push_str("; ");
            out.push_str(&related.summary());
        }
        out
    }
}

/// Errors at the catalog boundary.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("api error (HTTP {status}): {}", .payload.summary())]
    Api { status: u16, payload: ApiErrorPayload },

    #[error("transport: {0}")]
    Transport(String),

    #[error("decode: {0}")]
    Decode(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound { .. })
    }

    /// Human-readable message extracted from the structured payload.
    pub fn message(&self) -> String {
        match self {
            CatalogError::Api { payload, .. } => payload.summary(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        CatalogError::Decode(e.to_string())
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
}

impl<T> ListResult<T> {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            cursor: None,
            result_count: Some(0),
        }
    }
}

/// Progress through a cursor-paginated listing.
///
/// The total from the first page bounds the scan when the catalog reports
/// one. Without it the cursor is followed until it runs out or a page comes
/// back empty.
#[derive(Debug, Default)]
pub struct Pagination {
    pages: u32,
    listed: u64,
    total: Option<u64>,
}

impl Pagination {
    pub fn listed(&self) -> u64 {
        self.listed
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Account for one page and return the cursor of the next, or `None`
    /// when the listing is exhausted.
    pub fn advance<T>(&mut self, page: &ListResult<T>) -> Option<String> {
        if self.pages == 0 {
            self.total = page.result_count;
        }
        self.pages += 1;
        self.listed += page.results.len() as u64;

        if page.results.is_empty() || self.total.is_some_and(|t| self.listed >= t) {
            return None;
        }
        page.cursor.clone()
    }
}

impl ListResult<Value> {
    fn decode<T: DeserializeOwned>(self) -> Result<ListResult<T>, CatalogError> {
        let results = self
            .results
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(ListResult {
            results,
            cursor: self.cursor,
            result_count: self.result_count,
        })
    }
}

/// The remote catalog service.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// List the direct children of a collection, one page at a time.
    async fn list(
        &self,
        collection: &str,
        cursor: Option<&str>,
    ) -> Result<ListResult<Value>, CatalogError>;

    async fn get(&self, path: &str) -> Result<Value, CatalogError>;

    /// Merge the given fields into the object, creating it if absent.
    async fn patch(&self, path: &str, body: Value) -> Result<(), CatalogError>;

    /// Create-or-replace by client-chosen ID. Returns the stored object.
    async fn update(&self, path: &str, body: Value) -> Result<Value, CatalogError>;

    async fn delete(&self, path: &str) -> Result<(), CatalogError>;

    /// Realization view of an intent object.
    async fn realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, CatalogError>;
}

/// Models that live in the catalog.
pub trait PolicyObject: Serialize + DeserializeOwned + Send + Sync {
    /// Human-readable kind used in logs and errors.
    const KIND: &'static str;

    fn id(&self) -> Option<&str>;
    fn path(&self) -> Option<&str>;
    fn display_name(&self) -> Option<&str>;

    fn reference(&self) -> Option<Reference> {
        Some(Reference::new(self.id()?, self.path()?))
    }
}

/// Typed access to one collection.
pub struct Api<'a, T> {
    client: &'a dyn CatalogClient,
    collection: String,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: PolicyObject> Api<'a, T> {
    pub fn new(client: &'a dyn CatalogClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
            _marker: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn object_path(&self, id: &str) -> String {
        format!("{}/{}", self.collection, id)
    }

    pub async fn list(&self, cursor: Option<&str>) -> Result<ListResult<T>, CatalogError> {
        self.client.list(&self.collection, cursor).await?.decode()
    }

    pub async fn get(&self, id: &str) -> Result<T, CatalogError> {
        let value = self.client.get(&self.object_path(id)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn patch(&self, id: &str, obj: &T) -> Result<(), CatalogError> {
        let body = serde_json::to_value(obj)?;
        self.client.patch(&self.object_path(id), body).await
    }

    pub async fn update(&self, id: &str, obj: &T) -> Result<T, CatalogError> {
        let body = serde_json::to_value(obj)?;
        let stored = self.client.update(&self.object_path(id), body).await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        self.client.delete(&self.object_path(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_summary_includes_related_errors() {
        let payload: ApiErrorPayload = serde_json::from_str(
            r#"{
                "httpStatus": "BAD_REQUEST",
                "error_code": 500012,
                "module_name": "Policy",
                "error_message": "Invalid gateway address.",
                "related_errors": [
                    {"error_code": 503040, "error_message": "Subnet overlaps "}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            payload.summary(),
            "Invalid gateway address. (code 500012); Subnet overlaps (code 503040)"
        );

        let err = CatalogError::Api {
            status: 400,
            payload,
        };
        assert!(err.message().starts_with("Invalid gateway address."));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_payload_summary_falls_back_to_status() {
        let payload = ApiErrorPayload {
            http_status: Some("SERVICE_UNAVAILABLE".to_string()),
            ..ApiErrorPayload::default()
        };
        assert_eq!(payload.summary(), "SERVICE_UNAVAILABLE");
        assert_eq!(ApiErrorPayload::default().summary(), "unknown error");
    }

    #[test]
    fn test_list_result_tolerates_missing_fields() {
        let page: ListResult<ObjectSummary> = serde_json::from_str(r#"{"results": []}"#).unwrap();
        assert!(page.results.is_empty());
        assert_eq!(page.cursor, None);
        assert_eq!(page.result_count, None);
    }

    fn page(n: usize, cursor: Option<&str>, result_count: Option<u64>) -> ListResult<u32> {
        ListResult {
            results: vec![0; n],
            cursor: cursor.map(str::to_string),
            result_count,
        }
    }

    #[test]
    fn test_pagination_stops_at_reported_total() {
        let mut pages = Pagination::default();
        assert_eq!(pages.advance(&page(2, Some("2"), Some(4))), Some("2".to_string()));
        // The cursor is ignored once the total is reached.
        assert_eq!(pages.advance(&page(2, Some("4"), None)), None);
        assert_eq!(pages.listed(), 4);
        assert_eq!(pages.total(), Some(4));
    }

    #[test]
    fn test_pagination_follows_cursor_without_total() {
        let mut pages = Pagination::default();
        assert_eq!(pages.advance(&page(2, Some("2"), None)), Some("2".to_string()));
        assert_eq!(pages.advance(&page(2, Some("4"), None)), Some("4".to_string()));
        assert_eq!(pages.advance(&page(1, None, None)), None);
        assert_eq!(pages.listed(), 5);
        assert_eq!(pages.total(), None);
    }

    #[test]
    fn test_pagination_stops_on_empty_page() {
        let mut pages = Pagination::default();
        assert_eq!(pages.advance(&page(0, Some("0"), None)), None);
    }

    #[test]
    fn test_collection_paths() {
        assert_eq!(
            paths::nat_rules("t1"),
            "/infra/tier-1s/t1/nat/USER/nat-rules"
        );
        assert_eq!(
            paths::edge_clusters(),
            "/infra/sites/default/enforcement-points/default/edge-clusters"
        );
    }
}
