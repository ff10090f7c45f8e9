//! SNAT address allocation, its realization, and the SNAT rule using it.

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::{
    Deletable, EnsurerContext, Outcome, Recoverable, Task, delete_tolerant, differs, equal_tags,
    malformed, require,
};
use crate::catalog::{
    Api, IpAddressAllocation, ListResult, ObjectSummary, PolicyNatRule, PolicyObject, paths,
};
use crate::error::{ReconcileError, Result};
use crate::spec::{DESCRIPTION, InfraSpec};
use crate::state::{InfraState, Reference};

pub const ACTION_SNAT: &str = "SNAT";
pub const RULE_SEQUENCE_NUMBER: i64 = 100;

/// One address reserved from the shared SNAT pool. Never updated once it
/// exists.
pub struct SnatIpAddressAllocationTask;

impl SnatIpAddressAllocationTask {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SnatIpAddressAllocationTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for SnatIpAddressAllocationTask {
    fn label(&self) -> &'static str {
        "SNAT IP address allocation"
    }

    fn reference(&self, state: &InfraState) -> Option<Reference> {
        state.snat_ip_address_alloc_ref.clone()
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let pool = require(&state.snat_ip_pool_ref, "SNAT IP pool")?.clone();
        let api = Api::<IpAddressAllocation>::new(ctx.catalog(), paths::ip_allocations(&pool.id));

        if let Some(current) = state.snat_ip_address_alloc_ref.clone() {
            match api.get(&current.id).await {
                Ok(_) => return Ok(Outcome::Unchanged),
                Err(e) if e.is_not_found() => {
                    warn!(id = %current.id, "SNAT IP address allocation vanished, recreating");
                    state.snat_ip_address_alloc_ref = None;
                    state.snat_ip_address = None;
                }
                Err(e) => return Err(ReconcileError::reading(e)),
            }
        }

        let allocation = IpAddressAllocation {
            display_name: Some(spec.snat_allocation_name()),
            description: Some(format!("SNAT IP address for all nodes. {}", DESCRIPTION)),
            tags: spec.create_tags(),
            ..IpAddressAllocation::default()
        };
        let id = ctx.generate_id("snatippool");
        let created = api
            .update(&id, &allocation)
            .await
            .map_err(ReconcileError::creating)?;
        let reference = created
            .reference()
            .ok_or_else(|| malformed(IpAddressAllocation::KIND, &id))?;
        info!(id = %reference.id, pool = %pool.id, "Created SNAT IP address allocation");
        state.snat_ip_address_alloc_ref = Some(reference);
        Ok(Outcome::Created)
    }

    fn recoverable(&self) -> Option<&dyn Recoverable> {
        Some(self)
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        Some(self)
    }
}

#[async_trait]
impl Recoverable for SnatIpAddressAllocationTask {
    async fn list_all(
        &self,
        ctx: &EnsurerContext,
        state: &InfraState,
        cursor: Option<&str>,
    ) -> Result<ListResult<ObjectSummary>> {
        let pool = require(&state.snat_ip_pool_ref, "SNAT IP pool")?;
        Api::<ObjectSummary>::new(ctx.catalog(), paths::ip_allocations(&pool.id))
            .list(cursor)
            .await
            .map_err(ReconcileError::listing)
    }

    fn matches(&self, spec: &InfraSpec, display_name: &str) -> bool {
        display_name == spec.snat_allocation_name()
    }

    fn set_recovered_reference(
        &self,
        state: &mut InfraState,
        reference: Reference,
        _name: Option<String>,
    ) {
        state.snat_ip_address_alloc_ref = Some(reference);
    }
}

#[async_trait]
impl Deletable for SnatIpAddressAllocationTask {
    /// Deletes by the stored path, so the pool reference is not needed.
    async fn ensure_deleted(&self, ctx: &EnsurerContext, state: &mut InfraState) -> Result<bool> {
        let Some(current) = state.snat_ip_address_alloc_ref.clone() else {
            return Ok(false);
        };
        let deleted = delete_tolerant(ctx.catalog().delete(&current.path).await)?;
        state.snat_ip_address_alloc_ref = None;
        state.snat_ip_address = None;
        Ok(deleted)
    }
}

/// Waits for the catalog to assign a concrete address to the allocation.
///
/// The catalog does its IPAM asynchronously, so the allocation object exists
/// well before an address shows up in its realized state. The poll is bounded
/// by the context's realization timeout.
pub struct SnatIpAddressRealizationTask;

impl SnatIpAddressRealizationTask {
    pub fn new() -> Self {
        Self
    }

    async fn poll_address(ctx: &EnsurerContext, intent_path: &str) -> Result<String> {
        let timeout = ctx.realization_timeout();
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let entities = ctx
                .catalog()
                .realized_entities(intent_path)
                .await
                .map_err(ReconcileError::reading)?;
            for entity in entities.iter().filter(|e| !e.is_realized()) {
                debug!(
                    path = %intent_path,
                    state = ?entity.state,
                    attempts,
                    "Allocation not realized yet"
                );
            }
            // An address on an entity in any other state may be stale.
            if let Some(addr) = entities
                .iter()
                .filter(|e| e.is_realized())
                .find_map(|e| e.allocation_ip())
            {
                debug!(path = %intent_path, attempts, "Address realized");
                return Ok(addr.to_string());
            }
            if Instant::now() >= deadline {
                return Err(ReconcileError::RealizationTimeout {
                    path: intent_path.to_string(),
                    waited: timeout,
                });
            }
            sleep(ctx.realization_poll_interval()).await;
        }
    }
}

impl Default for SnatIpAddressRealizationTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for SnatIpAddressRealizationTask {
    fn label(&self) -> &'static str {
        "SNAT IP address realization"
    }

    /// The realized address, wrapped so it can be reported like a reference.
    fn reference(&self, state: &InfraState) -> Option<Reference> {
        state
            .snat_ip_address
            .as_ref()
            .map(|addr| Reference::new(addr.clone(), ""))
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        _spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let allocation = require(&state.snat_ip_address_alloc_ref, "SNAT IP address allocation")?;
        let addr = Self::poll_address(ctx, &allocation.path).await?;
        if state.snat_ip_address.as_deref() == Some(addr.as_str()) {
            return Ok(Outcome::Unchanged);
        }
        info!(address = %addr, "SNAT IP address realized");
        state.snat_ip_address = Some(addr);
        Ok(Outcome::Found)
    }
}

/// Source NAT of the workers network to the realized address.
pub struct SnatRuleTask;

impl SnatRuleTask {
    pub fn new() -> Self {
        Self
    }

    fn desired(spec: &InfraSpec, state: &InfraState) -> Result<PolicyNatRule> {
        let addr = state
            .snat_ip_address
            .as_deref()
            .ok_or(ReconcileError::MissingDependency("SNAT IP address"))?;
        Ok(PolicyNatRule {
            display_name: Some(spec.full_cluster_name().to_string()),
            description: Some(DESCRIPTION.to_string()),
            action: Some(ACTION_SNAT.to_string()),
            enabled: Some(true),
            logging: Some(true),
            sequence_number: Some(RULE_SEQUENCE_NUMBER),
            source_network: Some(spec.workers_network.to_string()),
            translated_network: Some(format!("{}/32", addr)),
            tags: spec.create_tags(),
            ..PolicyNatRule::default()
        })
    }

    fn drifted(current: &PolicyNatRule, desired: &PolicyNatRule) -> bool {
        current.display_name != desired.display_name
            || current.action != desired.action
            || desired.enabled.is_some_and(|v| differs(current.enabled.as_ref(), &v))
            || desired.logging.is_some_and(|v| differs(current.logging.as_ref(), &v))
            || desired
                .sequence_number
                .is_some_and(|v| differs(current.sequence_number.as_ref(), &v))
            || desired
                .source_network
                .as_deref()
                .is_some_and(|v| differs(current.source_network.as_deref(), v))
            || desired
                .translated_network
                .as_deref()
                .is_some_and(|v| differs(current.translated_network.as_deref(), v))
            || current.destination_network.is_some()
            || !equal_tags(&current.tags, &desired.tags)
    }
}

impl Default for SnatRuleTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for SnatRuleTask {
    fn label(&self) -> &'static str {
        "SNAT rule"
    }

    fn reference(&self, state: &InfraState) -> Option<Reference> {
        state.snat_rule_ref.clone()
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let tier1 = require(&state.tier1_gateway_ref, "tier-1 gateway")?.clone();
        let desired = Self::desired(spec, state)?;
        let api = Api::<PolicyNatRule>::new(ctx.catalog(), paths::nat_rules(&tier1.id));

        if let Some(current) = state.snat_rule_ref.clone() {
            match api.get(&current.id).await {
                Ok(old) => {
                    if !Self::drifted(&old, &desired) {
                        return Ok(Outcome::Unchanged);
                    }
                    api.patch(&current.id, &desired)
                        .await
                        .map_err(ReconcileError::updating)?;
                    return Ok(Outcome::Updated);
                }
                Err(e) if e.is_not_found() => {
                    warn!(id = %current.id, "SNAT rule vanished, recreating");
                    state.snat_rule_ref = None;
                }
                Err(e) => return Err(ReconcileError::reading(e)),
            }
        }

        let id = ctx.generate_id("snatrule");
        let created = api
            .update(&id, &desired)
            .await
            .map_err(ReconcileError::creating)?;
        let reference = created
            .reference()
            .ok_or_else(|| malformed(PolicyNatRule::KIND, &id))?;
        info!(id = %reference.id, translated = ?desired.translated_network, "Created SNAT rule");
        state.snat_rule_ref = Some(reference);
        Ok(Outcome::Created)
    }

    fn recoverable(&self) -> Option<&dyn Recoverable> {
        Some(self)
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        Some(self)
    }
}

#[async_trait]
impl Recoverable for SnatRuleTask {
    async fn list_all(
        &self,
        ctx: &EnsurerContext,
        state: &InfraState,
        cursor: Option<&str>,
    ) -> Result<ListResult<ObjectSummary>> {
        let tier1 = require(&state.tier1_gateway_ref, "tier-1 gateway")?;
        Api::<ObjectSummary>::new(ctx.catalog(), paths::nat_rules(&tier1.id))
            .list(cursor)
            .await
            .map_err(ReconcileError::listing)
    }

    fn matches(&self, spec: &InfraSpec, display_name: &str) -> bool {
        display_name == spec.full_cluster_name()
    }

    fn set_recovered_reference(
        &self,
        state: &mut InfraState,
        reference: Reference,
        _name: Option<String>,
    ) {
        state.snat_rule_ref = Some(reference);
    }
}

#[async_trait]
impl Deletable for SnatRuleTask {
    async fn ensure_deleted(&self, ctx: &EnsurerContext, state: &mut InfraState) -> Result<bool> {
        let Some(current) = state.snat_rule_ref.clone() else {
            return Ok(false);
        };
        let deleted = delete_tolerant(ctx.catalog().delete(&current.path).await)?;
        state.snat_rule_ref = None;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::catalog::memory::Op;
    use crate::spec::tests::sample;

    fn setup(catalog: MemoryCatalog) -> (Arc<MemoryCatalog>, EnsurerContext, InfraState) {
        let catalog = Arc::new(catalog);
        let ctx = EnsurerContext::new(catalog.clone()).with_rng(StdRng::seed_from_u64(5));
        let state = InfraState {
            snat_ip_pool_ref: Some(catalog.seed(paths::IP_POOLS, "pool1", "snat-pool")),
            tier1_gateway_ref: Some(catalog.seed(paths::TIER1S, "tier1gw-a", "shoot--dev--alpha")),
            ..InfraState::default()
        };
        (catalog, ctx, state)
    }

    #[tokio::test]
    async fn test_allocation_is_never_updated() {
        let (catalog, ctx, mut state) = setup(MemoryCatalog::new());
        let spec = sample();
        let task = SnatIpAddressAllocationTask::new();

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Created
        );
        let reference = state.snat_ip_address_alloc_ref.clone().unwrap();
        assert!(reference.id.starts_with("snatippool-"));
        assert!(reference.path.starts_with("/infra/ip-pools/pool1/ip-allocations/"));

        catalog.set_field(&reference.path, "display_name", json!("edited"));
        catalog.clear_calls();
        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Unchanged
        );
        assert!(catalog.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_allocation_self_heal_drops_stale_address() {
        let (catalog, ctx, mut state) = setup(MemoryCatalog::new());
        let spec = sample();
        let task = SnatIpAddressAllocationTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        state.snat_ip_address = Some("192.0.2.10".to_string());
        catalog.remove(&state.snat_ip_address_alloc_ref.clone().unwrap().path);

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Created
        );
        assert!(state.snat_ip_address.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realization_waits_for_address() {
        let (catalog, ctx, mut state) = setup(MemoryCatalog::new().with_realize_after(3));
        let spec = sample();
        SnatIpAddressAllocationTask::new()
            .ensure(&ctx, &spec, &mut state)
            .await
            .unwrap();

        let task = SnatIpAddressRealizationTask::new();
        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Found
        );
        assert_eq!(state.snat_ip_address.as_deref(), Some("192.0.2.10"));
        assert_eq!(catalog.count(Op::Realized), 4);
        assert_eq!(
            task.reference(&state),
            Some(Reference::new("192.0.2.10", ""))
        );

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Unchanged
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_realization_times_out() {
        let (_catalog, ctx, mut state) = setup(MemoryCatalog::new().with_realize_after(1000));
        let ctx = ctx
            .with_realization_timeout(Duration::from_secs(3))
            .with_realization_poll_interval(Duration::from_secs(1));
        let spec = sample();
        SnatIpAddressAllocationTask::new()
            .ensure(&ctx, &spec, &mut state)
            .await
            .unwrap();

        let err = SnatIpAddressRealizationTask::new()
            .ensure(&ctx, &spec, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::RealizationTimeout { .. }));
        assert!(err.is_retryable());
        assert!(state.snat_ip_address.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realization_ignores_address_in_error_state() {
        let (catalog, ctx, mut state) =
            setup(MemoryCatalog::new().with_realized_state("ERROR"));
        let ctx = ctx
            .with_realization_timeout(Duration::from_secs(2))
            .with_realization_poll_interval(Duration::from_secs(1));
        let spec = sample();
        SnatIpAddressAllocationTask::new()
            .ensure(&ctx, &spec, &mut state)
            .await
            .unwrap();

        let err = SnatIpAddressRealizationTask::new()
            .ensure(&ctx, &spec, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::RealizationTimeout { .. }));
        assert!(catalog.count(Op::Realized) >= 2);
        assert!(state.snat_ip_address.is_none());
    }

    #[tokio::test]
    async fn test_rule_translates_to_host_route() {
        let (catalog, ctx, mut state) = setup(MemoryCatalog::new());
        state.snat_ip_address = Some("192.0.2.44".to_string());
        let spec = sample();
        let task = SnatRuleTask::new();

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Created
        );
        let reference = state.snat_rule_ref.clone().unwrap();
        assert!(
            reference
                .path
                .starts_with("/infra/tier-1s/tier1gw-a/nat/USER/nat-rules/snatrule-")
        );
        let stored = catalog.object(&reference.path).unwrap();
        assert_eq!(stored["translated_network"], "192.0.2.44/32");
        assert_eq!(stored["source_network"], "10.250.0.0/16");
        assert_eq!(stored["sequence_number"], 100);

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_rule_destination_restriction_is_drift() {
        let (catalog, ctx, mut state) = setup(MemoryCatalog::new());
        state.snat_ip_address = Some("192.0.2.44".to_string());
        let spec = sample();
        let task = SnatRuleTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        let path = state.snat_rule_ref.clone().unwrap().path;

        catalog.set_field(&path, "destination_network", json!("10.0.0.0/8"));
        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Updated
        );

        state.snat_ip_address = Some("192.0.2.45".to_string());
        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Updated
        );
        assert_eq!(
            catalog.object(&path).unwrap()["translated_network"],
            "192.0.2.45/32"
        );
    }

    #[tokio::test]
    async fn test_rule_requires_address() {
        let (_catalog, ctx, mut state) = setup(MemoryCatalog::new());
        let err = SnatRuleTask::new()
            .ensure(&ctx, &sample(), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingDependency("SNAT IP address")));
    }

    #[tokio::test]
    async fn test_allocation_delete_clears_address() {
        let (catalog, ctx, mut state) = setup(MemoryCatalog::new());
        let spec = sample();
        let task = SnatIpAddressAllocationTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        state.snat_ip_address = Some("192.0.2.10".to_string());
        let path = state.snat_ip_address_alloc_ref.clone().unwrap().path;

        assert!(task.ensure_deleted(&ctx, &mut state).await.unwrap());
        assert!(state.snat_ip_address_alloc_ref.is_none());
        assert!(state.snat_ip_address.is_none());
        assert!(!catalog.contains(&path));
    }
}
