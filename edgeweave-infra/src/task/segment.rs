//! Workers segment attached to the tier-1 gateway.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    Deletable, EnsurerContext, Outcome, Recoverable, Task, delete_tolerant, differs, equal_tags,
    malformed, require,
};
use crate::catalog::{Api, ListResult, ObjectSummary, PolicyObject, Segment, SegmentSubnet, paths};
use crate::error::{ReconcileError, Result};
use crate::spec::{DESCRIPTION, InfraSpec};
use crate::state::{InfraState, Reference};

/// Length of the random display-name suffix.
const NAME_SUFFIX_LEN: usize = 8;

pub struct SegmentTask;

impl SegmentTask {
    pub fn new() -> Self {
        Self
    }

    fn desired(
        spec: &InfraSpec,
        state: &InfraState,
        display_name: String,
    ) -> Result<Segment> {
        let tier1 = require(&state.tier1_gateway_ref, "tier-1 gateway")?;
        let tz = require(&state.transport_zone_ref, "transport zone")?;
        Ok(Segment {
            display_name: Some(display_name),
            description: Some(DESCRIPTION.to_string()),
            connectivity_path: Some(tier1.path.clone()),
            transport_zone_path: Some(tz.path.clone()),
            subnets: vec![SegmentSubnet {
                gateway_address: Some(spec.gateway_address()?),
            }],
            tags: spec.create_tags(),
            ..Segment::default()
        })
    }

    fn new_name(ctx: &EnsurerContext, spec: &InfraSpec) -> String {
        format!(
            "{}{}",
            spec.segment_name_prefix(),
            ctx.random_string(NAME_SUFFIX_LEN)
        )
    }

    /// The display name only has to carry the cluster prefix; the suffix is
    /// random per creation. A cluster whose name extends this one after a
    /// dash (`<cluster>-2`) shares the prefix, so its segment is not seen as
    /// drifted either.
    fn drifted(spec: &InfraSpec, current: &Segment, desired: &Segment) -> bool {
        let prefix = spec.segment_name_prefix();
        let gateway = desired.subnets.first().and_then(|s| s.gateway_address.as_deref());
        !current
            .display_name
            .as_deref()
            .is_some_and(|n| n.starts_with(&prefix))
            || desired
                .connectivity_path
                .as_deref()
                .is_some_and(|p| differs(current.connectivity_path.as_deref(), p))
            || desired
                .transport_zone_path
                .as_deref()
                .is_some_and(|p| differs(current.transport_zone_path.as_deref(), p))
            || current.subnets.len() != 1
            || current.subnets[0].gateway_address.as_deref() != gateway
            || !equal_tags(&current.tags, &desired.tags)
    }
}

impl Default for SegmentTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for SegmentTask {
    fn label(&self) -> &'static str {
        "segment"
    }

    fn reference(&self, state: &InfraState) -> Option<Reference> {
        state.segment_ref.clone()
    }

    async fn ensure(
        &self,
        ctx: &EnsurerContext,
        spec: &InfraSpec,
        state: &mut InfraState,
    ) -> Result<Outcome> {
        let api = Api::<Segment>::new(ctx.catalog(), paths::SEGMENTS);

        if let Some(current) = state.segment_ref.clone() {
            match api.get(&current.id).await {
                Ok(old) => {
                    let name = match old.display_name.as_deref() {
                        Some(n) if n.starts_with(&spec.segment_name_prefix()) => n.to_string(),
                        _ => Self::new_name(ctx, spec),
                    };
                    let desired = Self::desired(spec, state, name.clone())?;
                    if !Self::drifted(spec, &old, &desired) {
                        if state.segment_name.as_deref() != Some(name.as_str()) {
                            state.segment_name = Some(name);
                            return Ok(Outcome::Found);
                        }
                        return Ok(Outcome::Unchanged);
                    }
                    api.patch(&current.id, &desired)
                        .await
                        .map_err(ReconcileError::updating)?;
                    state.segment_name = Some(name);
                    return Ok(Outcome::Updated);
                }
                Err(e) if e.is_not_found() => {
                    warn!(id = %current.id, "Segment vanished, recreating");
                    state.segment_ref = None;
                    state.segment_name = None;
                }
                Err(e) => return Err(ReconcileError::reading(e)),
            }
        }

        let desired = Self::desired(spec, state, Self::new_name(ctx, spec))?;
        let id = ctx.generate_id("segment");
        let created = api
            .update(&id, &desired)
            .await
            .map_err(ReconcileError::creating)?;
        let reference = created
            .reference()
            .ok_or_else(|| malformed(Segment::KIND, &id))?;
        info!(id = %reference.id, name = ?created.display_name, "Created segment");
        state.segment_name = created.display_name.or(desired.display_name);
        state.segment_ref = Some(reference);
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
impl Recoverable for SegmentTask {
    async fn list_all(
        &self,
        ctx: &EnsurerContext,
        _state: &InfraState,
        cursor: Option<&str>,
    ) -> Result<ListResult<ObjectSummary>> {
        Api::<ObjectSummary>::new(ctx.catalog(), paths::SEGMENTS)
            .list(cursor)
            .await
            .map_err(ReconcileError::listing)
    }

    /// Prefix match on `<cluster>-`. This cannot tell this cluster's segment
    /// from one of a cluster named `<cluster>-<anything>`; with both present
    /// the first listed wins and gets adopted.
    fn matches(&self, spec: &InfraSpec, display_name: &str) -> bool {
        display_name.starts_with(&spec.segment_name_prefix())
    }

    fn set_recovered_reference(
        &self,
        state: &mut InfraState,
        reference: Reference,
        name: Option<String>,
    ) {
        state.segment_ref = Some(reference);
        state.segment_name = name;
    }
}

#[async_trait]
impl Deletable for SegmentTask {
    async fn ensure_deleted(&self, ctx: &EnsurerContext, state: &mut InfraState) -> Result<bool> {
        let Some(current) = state.segment_ref.clone() else {
            return Ok(false);
        };
        let deleted = delete_tolerant(
            Api::<Segment>::new(ctx.catalog(), paths::SEGMENTS)
                .delete(&current.id)
                .await,
        )?;
        state.segment_ref = None;
        state.segment_name = None;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::spec::tests::sample;

    fn setup() -> (Arc<MemoryCatalog>, EnsurerContext, InfraState) {
        let catalog = Arc::new(MemoryCatalog::new());
        let ctx = EnsurerContext::new(catalog.clone()).with_rng(StdRng::seed_from_u64(3));
        let state = InfraState {
            tier1_gateway_ref: Some(catalog.seed(paths::TIER1S, "tier1gw-a", "shoot--dev--alpha")),
            transport_zone_ref: Some(catalog.seed(&paths::transport_zones(), "tz", "tz-overlay")),
            ..InfraState::default()
        };
        (catalog, ctx, state)
    }

    #[tokio::test]
    async fn test_create_names_segment_with_cluster_prefix() {
        let (catalog, ctx, mut state) = setup();
        let spec = sample();
        let task = SegmentTask::new();

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Created
        );
        let name = state.segment_name.clone().unwrap();
        assert!(name.starts_with("shoot--dev--alpha-"));
        assert_eq!(name.len(), "shoot--dev--alpha-".len() + NAME_SUFFIX_LEN);

        let reference = state.segment_ref.clone().unwrap();
        assert!(reference.id.starts_with("segment-"));
        let stored = catalog.object(&reference.path).unwrap();
        assert_eq!(stored["connectivity_path"], "/infra/tier-1s/tier1gw-a");
        assert_eq!(stored["subnets"], json!([{"gateway_address": "10.250.0.1/16"}]));

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(state.segment_name.as_deref(), Some(name.as_str()));
    }

    #[tokio::test]
    async fn test_extra_subnet_is_drift() {
        let (catalog, ctx, mut state) = setup();
        let spec = sample();
        let task = SegmentTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        let path = state.segment_ref.clone().unwrap().path;
        let name = state.segment_name.clone();

        catalog.set_field(
            &path,
            "subnets",
            json!([
                {"gateway_address": "10.250.0.1/16"},
                {"gateway_address": "10.99.0.1/24"}
            ]),
        );
        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Updated
        );
        assert_eq!(state.segment_name, name, "prefixed name is kept");
        assert_eq!(
            catalog.object(&path).unwrap()["subnets"],
            json!([{"gateway_address": "10.250.0.1/16"}])
        );
    }

    #[tokio::test]
    async fn test_foreign_name_is_renamed() {
        let (catalog, ctx, mut state) = setup();
        let spec = sample();
        let task = SegmentTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        let path = state.segment_ref.clone().unwrap().path;

        catalog.set_field(&path, "display_name", json!("renamed-by-hand"));
        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Updated
        );
        let name = state.segment_name.clone().unwrap();
        assert!(name.starts_with("shoot--dev--alpha-"));
        assert_eq!(catalog.object(&path).unwrap()["display_name"], json!(name));
    }

    #[tokio::test]
    async fn test_self_heal_generates_new_name() {
        let (catalog, ctx, mut state) = setup();
        let spec = sample();
        let task = SegmentTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        let old = state.segment_ref.clone().unwrap();
        catalog.remove(&old.path);

        assert_eq!(
            task.ensure(&ctx, &spec, &mut state).await.unwrap(),
            Outcome::Created
        );
        assert_ne!(state.segment_ref.clone().unwrap().id, old.id);
        assert!(state.segment_name.is_some());
    }

    #[test]
    fn test_recovery_matches_prefix_only() {
        let spec = sample();
        let task = SegmentTask::new();
        assert!(task.matches(&spec, "shoot--dev--alpha-abcdefgh"));
        assert!(!task.matches(&spec, "shoot--dev--beta-abcdefgh"));
        assert!(!task.matches(&spec, "shoot--dev--alpha"));
    }

    #[test]
    fn test_prefix_is_shared_with_dash_suffixed_cluster() {
        let spec = sample();
        let task = SegmentTask::new();
        // Segment of a cluster named "shoot--dev--alpha-2".
        assert!(task.matches(&spec, "shoot--dev--alpha-2-abcdefgh"));
        // Without the dash the names stay distinct.
        assert!(!task.matches(&spec, "shoot--dev--alpha2-abcdefgh"));
    }

    #[tokio::test]
    async fn test_delete_clears_name() {
        let (catalog, ctx, mut state) = setup();
        let spec = sample();
        let task = SegmentTask::new();
        task.ensure(&ctx, &spec, &mut state).await.unwrap();
        let path = state.segment_ref.clone().unwrap().path;

        assert!(task.ensure_deleted(&ctx, &mut state).await.unwrap());
        assert!(state.segment_ref.is_none());
        assert!(state.segment_name.is_none());
        assert_eq!(catalog.deleted_paths(), vec![path]);
    }
}
