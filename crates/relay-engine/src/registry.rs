use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use relay_core::actions::{ActionStatus, DiffEntry, ProposedAction};
use relay_core::errors::{ActionError, ActionOp, TransportError};
use relay_core::ids::ActionId;
use relay_core::request::ActionResolution;
use relay_core::transport::ActionBackend;

/// A proposal plus its live status. Everything except the status is frozen at
/// proposal time; the status only moves through [`ActionEntry::transition`].
#[derive(Debug)]
struct ActionEntry {
    action: ProposedAction,
    status: AtomicU8,
    seq: u64,
}

impl ActionEntry {
    fn new(mut action: ProposedAction, seq: u64) -> Self {
        action.status = ActionStatus::Pending;
        Self {
            action,
            status: AtomicU8::new(ActionStatus::Pending.as_u8()),
            seq,
        }
    }

    fn load(&self) -> ActionStatus {
        ActionStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(ActionStatus::Pending)
    }

    /// Compare-and-swap; on conflict returns the status actually observed.
    fn transition(&self, from: ActionStatus, to: ActionStatus) -> Result<(), ActionStatus> {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ActionStatus::from_u8(actual).unwrap_or(ActionStatus::Pending))
    }

    /// Status as of `now`, moving a lapsed pending entry to `expired` first.
    fn status_at(&self, now: DateTime<Utc>) -> ActionStatus {
        let current = self.load();
        if current != ActionStatus::Pending || !self.action.is_expired_at(now) {
            return current;
        }
        match self.transition(ActionStatus::Pending, ActionStatus::Expired) {
            Ok(()) => {
                info!(action_id = %self.action.id, "action expired");
                ActionStatus::Expired
            }
            Err(actual) => actual,
        }
    }

    fn snapshot(&self, status: ActionStatus) -> ProposedAction {
        ProposedAction {
            status,
            ..self.action.clone()
        }
    }
}

/// Shared read reference to a registered action.
///
/// Holding a handle keeps a terminal entry from being pruned.
#[derive(Clone, Debug)]
pub struct ActionHandle(Arc<ActionEntry>);

impl ActionHandle {
    pub fn id(&self) -> &ActionId {
        &self.0.action.id
    }

    pub fn status(&self) -> ActionStatus {
        self.0.status_at(Utc::now())
    }

    pub fn description(&self) -> &str {
        &self.0.action.description
    }

    /// The proposal's diff, exactly as received.
    pub fn diff(&self) -> &[DiffEntry] {
        &self.0.action.diff
    }

    pub fn snapshot(&self) -> ProposedAction {
        self.0.snapshot(self.status())
    }
}

/// Reverts `approved → pending` if an approval is abandoned mid-flight.
struct ApprovalGuard<'a> {
    entry: &'a ActionEntry,
    armed: bool,
}

impl ApprovalGuard<'_> {
    fn settle(mut self, to: ActionStatus) {
        self.armed = false;
        if let Err(actual) = self.entry.transition(ActionStatus::Approved, to) {
            warn!(action_id = %self.entry.action.id, status = %actual, "approved action changed underneath approval");
        }
    }
}

impl Drop for ApprovalGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(action_id = %self.entry.action.id, "approval abandoned, reverting to pending");
            let _ = self
                .entry
                .transition(ActionStatus::Approved, ActionStatus::Pending);
        }
    }
}

/// Proposed actions keyed by id, resolved through an [`ActionBackend`].
///
/// Every status change is a compare-and-swap on the entry, so concurrent
/// approve/reject calls for the same action have exactly one winner and only
/// that caller reaches the backend.
pub struct ActionRegistry {
    entries: DashMap<ActionId, Arc<ActionEntry>>,
    backend: Arc<dyn ActionBackend>,
    next_seq: AtomicU64,
}

impl ActionRegistry {
    pub fn new(backend: Arc<dyn ActionBackend>) -> Self {
        Self {
            entries: DashMap::new(),
            backend,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a previewed action as `pending`. The incoming status field is
    /// not trusted. A second proposal with the same id is refused and the
    /// existing record left alone.
    pub fn propose(&self, action: ProposedAction) -> Result<ActionHandle, ActionError> {
        match self.entries.entry(action.id.clone()) {
            Entry::Occupied(existing) => {
                warn!(action_id = %existing.key(), "duplicate action proposal ignored");
                Err(ActionError::Duplicate(existing.key().clone()))
            }
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(ActionEntry::new(action, seq));
                info!(
                    action_id = %entry.action.id,
                    tool = %entry.action.tool_name,
                    changes = entry.action.diff.len(),
                    "action proposed"
                );
                slot.insert(Arc::clone(&entry));
                Ok(ActionHandle(entry))
            }
        }
    }

    #[instrument(skip(self, id), fields(action_id = %id))]
    pub async fn approve(&self, id: &ActionId) -> Result<ActionResolution, ActionError> {
        let entry = self.entry(id)?;
        claim(&entry, ActionStatus::Approved, ActionOp::Approve)?;
        let guard = ApprovalGuard {
            entry: &entry,
            armed: true,
        };

        match self.backend.approve(id).await.and_then(accepted) {
            Ok(resolution) => {
                guard.settle(ActionStatus::Executed);
                info!(message = %resolution.message, "action executed");
                Ok(resolution)
            }
            Err(source) => {
                guard.settle(ActionStatus::Pending);
                warn!(error = %source, kind = source.error_kind(), "approval failed, action back to pending");
                Err(ActionError::Backend {
                    id: id.clone(),
                    source,
                })
            }
        }
    }

    /// Reject locally, then tell the backend. The local rejection is final
    /// whatever the backend says; `Ok(None)` means the backend call failed.
    #[instrument(skip(self, id), fields(action_id = %id))]
    pub async fn reject(
        &self,
        id: &ActionId,
        reason: Option<&str>,
    ) -> Result<Option<ActionResolution>, ActionError> {
        let entry = self.entry(id)?;
        claim(&entry, ActionStatus::Rejected, ActionOp::Reject)?;
        info!("action rejected");

        match self.backend.reject(id, reason).await.and_then(accepted) {
            Ok(resolution) => Ok(Some(resolution)),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "backend not notified of rejection");
                Ok(None)
            }
        }
    }

    /// Snapshot with the status evaluated now.
    pub fn get(&self, id: &ActionId) -> Option<ProposedAction> {
        let entry = self.entries.get(id)?;
        Some(entry.snapshot(entry.status_at(Utc::now())))
    }

    pub fn status(&self, id: &ActionId) -> Option<ActionStatus> {
        self.entries.get(id).map(|entry| entry.status_at(Utc::now()))
    }

    pub fn handle(&self, id: &ActionId) -> Option<ActionHandle> {
        self.entries
            .get(id)
            .map(|entry| ActionHandle(Arc::clone(entry.value())))
    }

    /// Pending actions, oldest proposal first.
    pub fn pending(&self) -> Vec<ProposedAction> {
        let now = Utc::now();
        let mut pending: Vec<(u64, ProposedAction)> = self
            .entries
            .iter()
            .filter(|entry| entry.status_at(now) == ActionStatus::Pending)
            .map(|entry| (entry.seq, entry.snapshot(ActionStatus::Pending)))
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, action)| action).collect()
    }

    pub fn pending_count(&self) -> usize {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| entry.status_at(now) == ActionStatus::Pending)
            .count()
    }

    /// Run the expiry check over every entry. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired = self
            .entries
            .iter()
            .filter(|entry| {
                entry.load() == ActionStatus::Pending
                    && entry.status_at(now) == ActionStatus::Expired
            })
            .count();
        if expired > 0 {
            debug!(expired, "swept expired actions");
        }
        expired
    }

    /// Drop terminal entries nobody holds a handle to. Returns how many went.
    pub fn prune_terminal(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !(entry.status_at(now).is_terminal() && Arc::strong_count(entry) == 1));
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            debug!(pruned, "pruned terminal actions");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, id: &ActionId) -> Result<Arc<ActionEntry>, ActionError> {
        self.entries
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ActionError::NotFound(id.clone()))
    }
}

/// Move a pending entry to `to`, applying lazy expiry first.
fn claim(entry: &ActionEntry, to: ActionStatus, attempted: ActionOp) -> Result<(), ActionError> {
    let invalid = |from| ActionError::InvalidTransition {
        id: entry.action.id.clone(),
        from,
        attempted,
    };
    match entry.status_at(Utc::now()) {
        ActionStatus::Pending => entry.transition(ActionStatus::Pending, to).map_err(invalid),
        from => Err(invalid(from)),
    }
}

fn accepted(resolution: ActionResolution) -> Result<ActionResolution, TransportError> {
    if resolution.success {
        Ok(resolution)
    } else {
        Err(TransportError::Refused(resolution.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackendReply, MockTransport};
    use chrono::Duration as ChronoDuration;
    use relay_core::actions::ChangeType;
    use serde_json::json;
    use std::time::Duration;

    fn proposal(id: &str) -> ProposedAction {
        serde_json::from_value(json!({
            "actionId": id,
            "toolName": "update_task",
            "description": "Mark task as done",
            "entityType": "task",
            "entityId": "t1",
            "oldState": {"status": "todo"},
            "newState": {"status": "done"},
            "diff": [{"field": "status", "oldValue": "todo", "newValue": "done", "changeType": "modified"}],
            "status": "pending"
        }))
        .unwrap()
    }

    fn expired_proposal(id: &str) -> ProposedAction {
        ProposedAction {
            expires_at: Some(Utc::now() - ChronoDuration::seconds(5)),
            ..proposal(id)
        }
    }

    fn registry_with(mock: &Arc<MockTransport>) -> ActionRegistry {
        ActionRegistry::new(Arc::clone(mock) as Arc<dyn ActionBackend>)
    }

    fn id(raw: &str) -> ActionId {
        ActionId::from_raw(raw)
    }

    #[tokio::test]
    async fn approve_executes_once_and_preserves_diff() {
        let mock = Arc::new(MockTransport::new(vec![]));
        let registry = registry_with(&mock);
        let handle = registry.propose(proposal("a1")).unwrap();
        let original_diff = handle.diff().to_vec();

        let resolution = registry.approve(&id("a1")).await.unwrap();
        assert!(resolution.success);
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Executed));

        let err = registry.approve(&id("a1")).await.unwrap_err();
        assert!(matches!(
            err,
            ActionError::InvalidTransition {
                from: ActionStatus::Executed,
                attempted: ActionOp::Approve,
                ..
            }
        ));
        assert_eq!(mock.approve_calls().len(), 1);

        let snapshot = registry.get(&id("a1")).unwrap();
        assert_eq!(snapshot.diff, original_diff);
        assert_eq!(snapshot.diff[0].change_type, ChangeType::Modified);
        assert_eq!(snapshot.new_state, json!({"status": "done"}));
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        assert!(matches!(
            registry.approve(&id("nope")).await,
            Err(ActionError::NotFound(_))
        ));
        assert!(matches!(
            registry.reject(&id("nope"), None).await,
            Err(ActionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn backend_failure_reverts_to_pending() {
        let mock = Arc::new(MockTransport::new(vec![]));
        mock.push_approve_reply(MockBackendReply::Fail(TransportError::Network(
            "connection refused".into(),
        )));
        let registry = registry_with(&mock);
        registry.propose(proposal("a1")).unwrap();

        let err = registry.approve(&id("a1")).await.unwrap_err();
        assert!(matches!(err, ActionError::Backend { .. }));
        assert!(!err.is_invalid_transition());
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Pending));

        registry.approve(&id("a1")).await.unwrap();
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Executed));
        assert_eq!(mock.approve_calls().len(), 2);
    }

    #[tokio::test]
    async fn unsuccessful_reply_counts_as_failure() {
        let mock = Arc::new(MockTransport::new(vec![]));
        mock.push_approve_reply(MockBackendReply::Refuse("task is locked".into()));
        let registry = registry_with(&mock);
        registry.propose(proposal("a1")).unwrap();

        let err = registry.approve(&id("a1")).await.unwrap_err();
        match err {
            ActionError::Backend {
                source: TransportError::Refused(message),
                ..
            } => assert_eq!(message, "task is locked"),
            other => panic!("expected refused backend error, got {other:?}"),
        }
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Pending));
    }

    #[tokio::test]
    async fn reject_is_final_and_preserves_audit_trail() {
        let mock = Arc::new(MockTransport::new(vec![]));
        let registry = registry_with(&mock);
        let before = registry.propose(proposal("a1")).unwrap().snapshot();

        let resolution = registry.reject(&id("a1"), Some("wrong task")).await.unwrap();
        assert!(resolution.is_some());

        let after = registry.get(&id("a1")).unwrap();
        assert_eq!(after.status, ActionStatus::Rejected);
        assert_eq!(after.diff, before.diff);
        assert_eq!(after.old_state, before.old_state);
        assert_eq!(after.new_state, before.new_state);
        assert_eq!(after.description, before.description);

        for result in [
            registry.reject(&id("a1"), None).await.map(|_| ()),
            registry.approve(&id("a1")).await.map(|_| ()),
        ] {
            assert!(result.unwrap_err().is_invalid_transition());
        }
        assert_eq!(
            mock.reject_calls(),
            vec![(id("a1"), Some("wrong task".to_owned()))]
        );
        assert!(mock.approve_calls().is_empty());
    }

    #[tokio::test]
    async fn reject_stands_when_backend_fails() {
        let mock = Arc::new(MockTransport::new(vec![]));
        mock.push_reject_reply(MockBackendReply::Fail(TransportError::Status {
            status: 503,
            body: "unavailable".into(),
        }));
        let registry = registry_with(&mock);
        registry.propose(proposal("a1")).unwrap();

        assert_eq!(registry.reject(&id("a1"), None).await.unwrap(), None);
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Rejected));
    }

    #[tokio::test]
    async fn expiry_takes_precedence() {
        let mock = Arc::new(MockTransport::new(vec![]));
        let registry = registry_with(&mock);
        registry.propose(expired_proposal("a1")).unwrap();
        registry.propose(expired_proposal("a2")).unwrap();

        let err = registry.approve(&id("a1")).await.unwrap_err();
        assert!(matches!(
            err,
            ActionError::InvalidTransition {
                from: ActionStatus::Expired,
                ..
            }
        ));
        let err = registry.reject(&id("a2"), None).await.unwrap_err();
        assert!(matches!(
            err,
            ActionError::InvalidTransition {
                from: ActionStatus::Expired,
                attempted: ActionOp::Reject,
                ..
            }
        ));
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Expired));
        assert!(mock.approve_calls().is_empty());
        assert!(mock.reject_calls().is_empty());
    }

    #[test]
    fn future_expiry_stays_pending() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        registry
            .propose(ProposedAction {
                expires_at: Some(Utc::now() + ChronoDuration::minutes(10)),
                ..proposal("a1")
            })
            .unwrap();
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Pending));
        assert_eq!(registry.sweep_expired(), 0);
    }

    #[test]
    fn status_read_expires_lazily() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        let handle = registry.propose(expired_proposal("a1")).unwrap();
        assert_eq!(handle.status(), ActionStatus::Expired);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn duplicate_proposal_keeps_original() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        registry.propose(proposal("a1")).unwrap();

        let mut again = proposal("a1");
        again.description = "something else".into();
        assert!(matches!(
            registry.propose(again),
            Err(ActionError::Duplicate(_))
        ));
        assert_eq!(registry.get(&id("a1")).unwrap().description, "Mark task as done");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn incoming_status_is_not_trusted() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        let mut action = proposal("a1");
        action.status = ActionStatus::Executed;
        registry.propose(action).unwrap();
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Pending));
    }

    #[tokio::test]
    async fn pending_lists_in_proposal_order() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        for raw in ["a3", "a1", "a2", "a4"] {
            registry.propose(proposal(raw)).unwrap();
        }
        registry.propose(expired_proposal("a5")).unwrap();
        registry.reject(&id("a2"), None).await.unwrap();

        let ids: Vec<String> = registry
            .pending()
            .into_iter()
            .map(|a| a.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a3", "a1", "a4"]);
        assert_eq!(registry.pending_count(), 3);
    }

    #[test]
    fn sweep_counts_newly_expired() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        registry.propose(expired_proposal("a1")).unwrap();
        registry.propose(expired_proposal("a2")).unwrap();
        registry.propose(proposal("a3")).unwrap();

        assert_eq!(registry.sweep_expired(), 2);
        assert_eq!(registry.sweep_expired(), 0);
        assert_eq!(registry.status(&id("a2")), Some(ActionStatus::Expired));
    }

    #[tokio::test]
    async fn prune_respects_outstanding_handles() {
        let registry = registry_with(&Arc::new(MockTransport::new(vec![])));
        let held = registry.propose(proposal("a1")).unwrap();
        drop(registry.propose(proposal("a2")).unwrap());
        drop(registry.propose(proposal("a3")).unwrap());
        registry.reject(&id("a1"), None).await.unwrap();
        registry.reject(&id("a2"), None).await.unwrap();

        assert_eq!(registry.prune_terminal(), 1);
        assert!(registry.get(&id("a2")).is_none());
        assert_eq!(held.status(), ActionStatus::Rejected);
        assert!(registry.get(&id("a3")).is_some());

        drop(held);
        assert_eq!(registry.prune_terminal(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_approvals_have_one_winner() {
        let mock = Arc::new(MockTransport::new(vec![]).with_backend_delay(Duration::from_millis(20)));
        let registry = Arc::new(registry_with(&mock));
        registry.propose(proposal("a1")).unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.approve(&ActionId::from_raw("a1")).await })
            })
            .collect();

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_invalid_transition(), "unexpected {e:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(mock.approve_calls().len(), 1);
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Executed));
    }

    #[tokio::test]
    async fn approve_and_reject_race_resolves_once() {
        let mock = Arc::new(MockTransport::new(vec![]).with_backend_delay(Duration::from_millis(10)));
        let registry = registry_with(&mock);
        registry.propose(proposal("a1")).unwrap();

        let a1 = id("a1");
        let (approved, rejected) = tokio::join!(registry.approve(&a1), registry.reject(&a1, None));
        assert!(approved.is_ok() ^ rejected.is_ok());
        let status = registry.status(&a1).unwrap();
        assert!(status == ActionStatus::Executed || status == ActionStatus::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_approval_reverts_to_pending() {
        let mock = Arc::new(MockTransport::new(vec![]).with_backend_delay(Duration::from_secs(30)));
        let registry = registry_with(&mock);
        registry.propose(proposal("a1")).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), registry.approve(&id("a1"))).await;
        assert!(outcome.is_err());
        assert_eq!(registry.status(&id("a1")), Some(ActionStatus::Pending));
    }
}
