//! Tier-1 gateway and its locale service.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    Deletable, EnsurerContext, Outcome, Recoverable, Task, delete_tolerant, differs,
    equal_strings, equal_tags, malformed, require,
};
use crate::catalog::{
    Api, ListResult, LocaleServices, ObjectSummary, PolicyObject, Tier1, paths,
};
use crate::error::{ReconcileError, Result};
use crate::spec::{DESCRIPTION, InfraSpec};
use crate::state::{InfraState, Reference};

pub const FAILOVER_MODE_PREEMPTIVE: &str = "PREEMPTIVE";

/// Route advertisement types, in the order the gateway is configured with.
pub const ROUTE_ADVERTISEMENT_TYPES: [&str; 4] = [
    "TIER1_STATIC_ROUTES",
    "TIER1_NAT",
    "TIER1_LB_VIP",
    "TIER1_LB_SNAT",
];

/// Tier-1 gateway uplinked to the shared tier-0.
pub struct Tier1GatewayTask;

impl Tier1GatewayTask {
    pub fn new() -> Self {
        Self
    }

    fn desired(spec: &InfraSpec, state: &InfraState) -> Result<Tier1> {
        let tier0 = require(&state.tier0_gateway_ref, "tier-0 gateway")?;
        Ok(Tier1 {
            display_name: Some(spec.full_cluster_name().to_string()),
            description: Some(DESCRIPTION.to_string()),
            failover_mode: Some(FAILOVER_MODE_PREEMPTIVE.to_string()),
            route_advertisement_types: ROUTE_ADVERTISEMENT_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            tier0_path: Some(tier0.path.clone()),
            tags: spec.create_tags(),
            ..Tier1::default()
        })
    }

    fn drifted(current: &Tier1, desired: &Tier1) -> bool {
        current.display_name != desired.display_name
            || desired
                .failover_mode
                .as_deref()
                .is_some_and(|m| differs(current.failover_mode.as_deref(), m))
            || desired
                .tier0_path
                .as_deref()
                .is_some_and(|p| differs(current.tier0_path.as_deref(), p))
            || !equal_strings(
                &current.route_advertisement_types,
                &desired.route_advertisement_types,
            )
            || !equal_tags(&current.tags, &desired.tags)
    }
}

impl Default for Tier1GatewayTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for Tier1GatewayTask {
    fn label(&self) -> &'static str {
        "tier-1 gateway"
    }

    fn reference(&self, state: &InfraState) -> Option<Reference> {
        state.tier1_gateway_ref.clone()
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let api = Api::<Tier1>::new(ctx.catalog(), paths::TIER1S);
        let desired = Self::desired(spec, state)?;

        if let Some(current) = state.tier1_gateway_ref.clone() {
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
                    warn!(id = %current.id, "Tier-1 gateway vanished, recreating");
                    state.tier1_gateway_ref = None;
                }
                Err(e) => return Err(ReconcileError::reading(e)),
            }
        }

        let id = ctx.generate_id("tier1gw");
        let created = api
            .update(&id, &desired)
            .await
            .map_err(ReconcileError::creating)?;
        let reference = created
            .reference()
            .ok_or_else(|| malformed(Tier1::KIND, &id))?;
        info!(id = %reference.id, "Created tier-1 gateway");
        state.tier1_gateway_ref = Some(reference);
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
impl Recoverable for Tier1GatewayTask {
    async fn list_all(
        &self,
        ctx: &EnsurerContext,
        _state: &InfraState,
        cursor: Option<&str>,
    ) -> Result<ListResult<ObjectSummary>> {
        Api::<ObjectSummary>::new(ctx.catalog(), paths::TIER1S)
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
        state.tier1_gateway_ref = Some(reference);
    }
}

#[async_trait]
impl Deletable for Tier1GatewayTask {
    async fn ensure_deleted(&self, ctx: &EnsurerContext, state: &mut InfraState) -> Result<bool> {
        let Some(current) = state.tier1_gateway_ref.clone() else {
            return Ok(false);
        };
        let deleted = delete_tolerant(
            Api::<Tier1>::new(ctx.catalog(), paths::TIER1S)
                .delete(&current.id)
                .await,
        )?;
        state.tier1_gateway_ref = None;
        Ok(deleted)
    }
}

/// Locale service pinning the tier-1 gateway to the edge cluster.
///
/// It lives in a fixed slot under the gateway, so its reference ID is the
/// gateway's ID and "creation" is a patch of that slot.
pub struct Tier1GatewayLocaleServiceTask;

impl Tier1GatewayLocaleServiceTask {
    pub fn new() -> Self {
        Self
    }

    fn desired(spec: &InfraSpec, state: &InfraState) -> Result<LocaleServices> {
        let edge_cluster = require(&state.edge_cluster_ref, "edge cluster")?;
        Ok(LocaleServices {
            display_name: Some(spec.full_cluster_name().to_string()),
            description: Some(DESCRIPTION.to_string()),
            edge_cluster_path: Some(edge_cluster.path.clone()),
            tags: spec.create_tags(),
            ..LocaleServices::default()
        })
    }

    fn drifted(current: &LocaleServices, desired: &LocaleServices) -> bool {
        current.display_name != desired.display_name
            || desired
                .edge_cluster_path
                .as_deref()
                .is_some_and(|p| differs(current.edge_cluster_path.as_deref(), p))
            || !equal_tags(&current.tags, &desired.tags)
    }

    fn reference_for(tier1: &Reference) -> Reference {
        Reference::new(
            tier1.id.clone(),
            format!(
                "{}/locale-services/{}",
                tier1.path,
                paths::DEFAULT_LOCALE_SERVICE_ID
            ),
        )
    }
}

impl Default for Tier1GatewayLocaleServiceTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for Tier1GatewayLocaleServiceTask {
    fn label(&self) -> &'static str {
        "tier-1 gateway locale service"
    }

    fn reference(&self, state: &InfraState) -> Option<Reference> {
        state.locale_service_ref.clone()
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let desired = Self::desired(spec, state)?;

        if let Some(current) = state.locale_service_ref.clone() {
            let api = Api::<LocaleServices>::new(ctx.catalog(), paths::locale_services(&current.id));
            match api.get(paths::DEFAULT_LOCALE_SERVICE_ID).await {
                Ok(old) => {
                    if !Self::drifted(&old, &desired) {
                        return Ok(Outcome::Unchanged);
                    }
                    api.patch(paths::DEFAULT_LOCALE_SERVICE_ID, &desired)
                        .await
                        .map_err(ReconcileError::updating)?;
                    return Ok(Outcome::Updated);
                }
                Err(e) if e.is_not_found() => {
                    warn!(id = %current.id, "Locale service vanished, recreating");
                    state.locale_service_ref = None;
                }
                Err(e) => return Err(ReconcileError::reading(e)),
            }
        }

        let tier1 = require(&state.tier1_gateway_ref, "tier-1 gateway")?.clone();
        Api::<LocaleServices>::new(ctx.catalog(), paths::locale_services(&tier1.id))
            .patch(paths::DEFAULT_LOCALE_SERVICE_ID, &desired)
            .await
            .map_err(ReconcileError::creating)?;
        info!(tier1 = %tier1.id, "Created tier-1 gateway locale service");
        state.locale_service_ref = Some(Self::reference_for(&tier1));
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
impl Recoverable for Tier1GatewayLocaleServiceTask {
    async fn list_all(
        &self,
        ctx: &EnsurerContext,
        state: &InfraState,
        cursor: Option<&str>,
    ) -> Result<ListResult<ObjectSummary>> {
        let tier1 = require(&state.tier1_gateway_ref, "tier-1 gateway")?;
        Api::<ObjectSummary>::new(ctx.catalog(), paths::locale_services(&tier1.id))
            .list(cursor)
            .await
            .map_err(ReconcileError::listing)
    }

    fn matches(&self, spec: &InfraSpec, display_name: &str) -> bool {
        display_name == spec.full_cluster_name()
    }

    /// The listed item is ignored: the reference is always the gateway's ID.
    fn set_recovered_reference(
        &self,
        state: &mut InfraState,
        _reference: Reference,
        _name: Option<String>,
    ) {
        state.locale_service_ref = state.tier1_gateway_ref.as_ref().map(Self::reference_for);
    }
}

#[async_trait]
impl Deletable for Tier1GatewayLocaleServiceTask {
    async fn ensure_deleted(&self, ctx: &EnsurerContext, state: &mut InfraState) -> Result<bool> {
        let Some(current) = state.locale_service_ref.clone() else {
            return Ok(false);
        };
        let deleted = delete_tolerant(
            Api::<LocaleServices>::new(ctx.catalog(), paths::locale_services(&current.id))
                .delete(paths::DEFAULT_LOCALE_SERVICE_ID)
                .await,
        )?;
        state.locale_service_ref = None;
        Ok(deleted)
    }
}
