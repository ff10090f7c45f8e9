//! Test harness for pipeline integration tests
//!
//! Builds an in-memory catalog holding the shared objects a cluster builds
//! on, and a context with a seeded generator so IDs are reproducible.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use edgeweave_infra::catalog::{MemoryCatalog, paths};
use edgeweave_infra::spec::InfraSpec;
use edgeweave_infra::{EnsurerContext, InfraState, NoopStore, Reference, RunSummary, TaskRunner};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::watch;

pub const CLUSTER: &str = "shoot--prod--beta";
pub const TIER0_ID: &str = "t0-id";
pub const POOL_ID: &str = "snat-pool-id";

/// References of the seeded shared objects.
pub struct Shared {
    pub tier0: Reference,
    pub edge_cluster: Reference,
    pub transport_zone: Reference,
    pub snat_pool: Reference,
}

pub struct TestEnv {
    pub catalog: Arc<MemoryCatalog>,
    pub ctx: EnsurerContext,
    pub spec: InfraSpec,
    pub shared: Shared,
    pub cancel_tx: watch::Sender<bool>,
    pub cancel_rx: watch::Receiver<bool>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_catalog(MemoryCatalog::new())
    }

    /// Seed the shared objects into the given catalog.
    pub fn with_catalog(catalog: MemoryCatalog) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let catalog = Arc::new(catalog);
        let shared = Shared {
            tier0: catalog.seed(paths::TIER0S, TIER0_ID, "t0-main"),
            edge_cluster: catalog.seed(&paths::edge_clusters(), "ec-id", "edge-a"),
            transport_zone: catalog.seed(&paths::transport_zones(), "tz-id", "tz-overlay"),
            snat_pool: catalog.seed(paths::IP_POOLS, POOL_ID, "snat-pool"),
        };
        let ctx = EnsurerContext::new(catalog.clone())
            .with_rng(StdRng::seed_from_u64(42))
            .with_realization_poll_interval(Duration::from_millis(10));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            catalog,
            ctx,
            spec: spec(),
            shared,
            cancel_tx,
            cancel_rx,
        }
    }

    pub async fn reconcile(&self, state: &mut InfraState) -> edgeweave_infra::Result<RunSummary> {
        TaskRunner::standard()
            .ensure_all(&self.ctx, &self.spec, state, &NoopStore, &self.cancel_rx)
            .await
    }

    pub async fn teardown(&self, state: &mut InfraState) -> edgeweave_infra::Result<RunSummary> {
        TaskRunner::standard()
            .ensure_deleted_all(&self.ctx, state, &NoopStore, &self.cancel_rx)
            .await
    }
}

pub fn spec() -> InfraSpec {
    InfraSpec {
        cluster_name: CLUSTER.to_string(),
        workers_network: "10.180.0.0/20".parse().unwrap(),
        tier0_gateway_name: "t0-main".to_string(),
        edge_cluster_name: "edge-a".to_string(),
        transport_zone_name: "tz-overlay".to_string(),
        snat_ip_pool_name: "snat-pool".to_string(),
        extra_tags: vec![],
    }
}
