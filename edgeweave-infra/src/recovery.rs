//! Re-discovery of references lost between remote creation and persistence.
//!
//! Objects are found again purely by the display names the tasks give them
//! at creation time. Finding nothing is not an error; the slot stays empty and
//! the next ensure creates the object.

use tracing::{debug, warn};

use crate::catalog::{Pagination, PolicyObject};
use crate::error::{ReconcileError, Result};
use crate::spec::InfraSpec;
use crate::state::InfraState;
use crate::task::{EnsurerContext, Recoverable, Task};

/// Page through every object of the task's kind and splice the first match
/// back into state. Returns whether a reference was recovered.
pub async fn recover_task(
    ctx: &EnsurerContext,
    spec: &InfraSpec,
    state: &mut InfraState,
    task: &dyn Recoverable,
) -> Result<bool> {
    let mut pages = Pagination::default();
    let mut cursor: Option<String> = None;
    loop {
        let page = task.list_all(ctx, state, cursor.as_deref()).await?;

        let found = page.results.iter().find(|item| {
            item.display_name()
                .is_some_and(|name| task.matches(spec, name))
        });
        if let Some(item) = found {
            let Some(reference) = item.reference() else {
                return Err(ReconcileError::Listing(format!(
                    "{} {:?} has no id or path",
                    task.label(),
                    item.display_name()
                )));
            };
            warn!(
                task = task.label(),
                id = %reference.id,
                name = ?item.display_name(),
                "Recovered lost reference"
            );
            let name = item.display_name().map(str::to_string);
            task.set_recovered_reference(state, reference, name);
            return Ok(true);
        }

        match pages.advance(&page) {
            Some(next) => cursor = Some(next),
            None => {
                debug!(task = task.label(), listed = pages.listed(), "Nothing to recover");
                return Ok(false);
            }
        }
    }
}

/// Attempt recovery for every recoverable task whose reference is empty.
///
/// Tasks whose parent reference is not known yet (e.g. NAT rules without a
/// tier-1 gateway) are skipped. Returns the number of recovered references.
pub async fn recover_all(
    ctx: &EnsurerContext,
    spec: &InfraSpec,
    state: &mut InfraState,
    tasks: &[Box<dyn Task>],
) -> Result<usize> {
    let mut recovered = 0;
    for task in tasks {
        let Some(recoverable) = task.recoverable() else {
            continue;
        };
        if task.reference(state).is_some() {
            continue;
        }
        match recover_task(ctx, spec, state, recoverable).await {
            Ok(true) => recovered += 1,
            Ok(false) => {}
            Err(ReconcileError::MissingDependency(what)) => {
                debug!(task = task.label(), missing = what, "Skipping recovery");
            }
            Err(e) => return Err(e.in_task(task.label())),
        }
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{MemoryCatalog, paths};
    use crate::catalog::memory::Op;
    use crate::spec::tests::sample;
    use crate::task::{SegmentTask, SnatRuleTask, Tier1GatewayTask, standard_tasks};

    #[tokio::test]
    async fn test_segment_recovery_matches_prefix() {
        let catalog = Arc::new(MemoryCatalog::new().with_page_size(1));
        catalog.seed(paths::SEGMENTS, "s-other", "other-XYZ");
        let want = catalog.seed(paths::SEGMENTS, "s-mine", "shoot--dev--alpha-ABCDEFGH");
        let ctx = EnsurerContext::new(catalog.clone());
        let mut state = InfraState::default();

        let recovered = recover_task(&ctx, &sample(), &mut state, &SegmentTask::new())
            .await
            .unwrap();
        assert!(recovered);
        assert_eq!(state.segment_ref, Some(want));
        assert_eq!(
            state.segment_name.as_deref(),
            Some("shoot--dev--alpha-ABCDEFGH")
        );
        assert_eq!(catalog.count(Op::List), 2);
    }

    #[tokio::test]
    async fn test_segment_on_later_page_without_result_count() {
        let catalog = Arc::new(MemoryCatalog::new().with_page_size(2).without_result_count());
        catalog.seed(paths::SEGMENTS, "s-a", "other-a");
        catalog.seed(paths::SEGMENTS, "s-b", "other-b");
        let want = catalog.seed(paths::SEGMENTS, "s-mine", "shoot--dev--alpha-QWERTZUI");
        let ctx = EnsurerContext::new(catalog.clone());
        let mut state = InfraState::default();

        let recovered = recover_task(&ctx, &sample(), &mut state, &SegmentTask::new())
            .await
            .unwrap();
        assert!(recovered);
        assert_eq!(state.segment_ref, Some(want));
        assert_eq!(catalog.count(Op::List), 2);
    }

    #[tokio::test]
    async fn test_no_match_is_not_an_error() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.seed(paths::TIER1S, "x", "shoot--dev--alpha-old");
        let ctx = EnsurerContext::new(catalog.clone());
        let mut state = InfraState::default();

        let recovered = recover_task(&ctx, &sample(), &mut state, &Tier1GatewayTask::new())
            .await
            .unwrap();
        assert!(!recovered);
        assert!(state.tier1_gateway_ref.is_none());
    }

    #[tokio::test]
    async fn test_missing_parent_is_reported() {
        let catalog = Arc::new(MemoryCatalog::new());
        let ctx = EnsurerContext::new(catalog.clone());
        let mut state = InfraState::default();

        let err = recover_task(&ctx, &sample(), &mut state, &SnatRuleTask::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingDependency(_)));
    }

    #[tokio::test]
    async fn test_recover_all_follows_parents() {
        let catalog = Arc::new(MemoryCatalog::new());
        let tier1 = catalog.seed(paths::TIER1S, "tier1gw-a", "shoot--dev--alpha");
        catalog.seed(
            &paths::locale_services("tier1gw-a"),
            paths::DEFAULT_LOCALE_SERVICE_ID,
            "shoot--dev--alpha",
        );
        let rule = catalog.seed(&paths::nat_rules("tier1gw-a"), "snatrule-a", "shoot--dev--alpha");
        let ctx = EnsurerContext::new(catalog.clone());
        let mut state = InfraState::default();

        let recovered = recover_all(&ctx, &sample(), &mut state, &standard_tasks())
            .await
            .unwrap();
        // tier-1, locale service and rule; the pool is unknown so allocations are skipped
        assert_eq!(recovered, 3);
        assert_eq!(state.tier1_gateway_ref, Some(tier1.clone()));
        assert_eq!(
            state.locale_service_ref.as_ref().map(|r| r.id.as_str()),
            Some("tier1gw-a")
        );
        assert_eq!(state.snat_rule_ref, Some(rule));
        assert!(state.snat_ip_address_alloc_ref.is_none());
    }

    #[tokio::test]
    async fn test_listing_failure_carries_task_label() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_next(Op::List, paths::TIER1S, 500, "boom");
        let ctx = EnsurerContext::new(catalog.clone());
        let mut state = InfraState::default();

        let err = recover_all(&ctx, &sample(), &mut state, &standard_tasks())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "task tier-1 gateway failed: listing failed: boom");
    }
}
