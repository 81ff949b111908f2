//! Read-modify-write orchestration over per-chain views.
//!
//! Every (table, chain) has one [`ChainView`] behind an async mutex. Refreshes
//! and mutations on the same chain take that lock for their whole duration,
//! so a mutation and the listing that follows it are never interleaved with
//! another request on that chain. Different chains proceed independently.

use crate::error::SessionError;
use crate::state::ViewState;
use ct_core::{
    AppliedMutation, ChainKey, Compensation, Freshness, ListedRule, Mutation, MutationJournal,
    Position, PositionRef, Rule, RuleStore, UndoError,
};
use ct_ipt::{CommandExecutor, ListingDiff, RuleBackend, diff_rules, to_command_args};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::Mutex;

pub const DEFAULT_UNDO_DEPTH: usize = 32;

/// Read-only copy of a chain view.
#[derive(Debug, Clone, Serialize)]
pub struct ChainSnapshot {
    pub key: ChainKey,
    pub state: ViewState,
    pub generation: u64,
    pub freshness: Freshness,
    pub policy: Option<String>,
    pub rules: Vec<ListedRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ChainSnapshot {
    pub fn row(&self, position: Position) -> Option<&ListedRule> {
        self.rules.get(position.index())
    }

    /// Reference to `position` as of this snapshot's listing.
    pub fn reference(&self, position: Position) -> PositionRef {
        PositionRef {
            key: self.key,
            position,
            generation: self.generation,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Applied, and the chain was listed again.
    Applied {
        view: ChainSnapshot,
        changes: ListingDiff,
    },
    /// Applied, but the listing that should follow failed. The view is stale
    /// until the next successful refresh.
    AppliedStale {
        view: ChainSnapshot,
        refresh_error: String,
    },
    /// Dry-run mode: nothing was executed.
    DryRun { args: Vec<String> },
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, MutationOutcome::DryRun { .. })
    }

    pub fn view(&self) -> Option<&ChainSnapshot> {
        match self {
            MutationOutcome::Applied { view, .. } | MutationOutcome::AppliedStale { view, .. } => {
                Some(view)
            }
            MutationOutcome::DryRun { .. } => None,
        }
    }
}

struct ChainView {
    store: RuleStore,
    state: ViewState,
    last_error: Option<String>,
}

impl ChainView {
    fn new(key: ChainKey) -> Self {
        Self {
            store: RuleStore::new(key),
            state: ViewState::Idle,
            last_error: None,
        }
    }

    fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            key: self.store.key(),
            state: self.state,
            generation: self.store.generation(),
            freshness: self.store.freshness(),
            policy: self.store.policy().map(str::to_string),
            rules: self.store.rules().to_vec(),
            last_error: self.last_error.clone(),
        }
    }

    fn fail(&mut self, error: &impl fmt::Display) {
        // Every state may move to Error.
        let _ = self.state.transition(ViewState::Error);
        self.last_error = Some(error.to_string());
        tracing::debug!(key = %self.store.key(), %error, "view entered error state");
    }
}

pub struct SessionController<B> {
    executor: Arc<CommandExecutor<B>>,
    views: StdMutex<HashMap<ChainKey, Arc<Mutex<ChainView>>>>,
    journal: StdMutex<MutationJournal>,
}

impl<B: RuleBackend> SessionController<B> {
    pub fn new(executor: Arc<CommandExecutor<B>>) -> Self {
        Self {
            executor,
            views: StdMutex::new(HashMap::new()),
            journal: StdMutex::new(MutationJournal::new(DEFAULT_UNDO_DEPTH)),
        }
    }

    pub fn with_undo_depth(self, depth: usize) -> Self {
        Self {
            journal: StdMutex::new(MutationJournal::new(depth)),
            ..self
        }
    }

    pub fn executor(&self) -> &Arc<CommandExecutor<B>> {
        &self.executor
    }

    fn view_handle(&self, key: ChainKey) -> Arc<Mutex<ChainView>> {
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        views
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ChainView::new(key))))
            .clone()
    }

    fn journal(&self) -> MutexGuard<'_, MutationJournal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of mutations that can still be undone.
    pub fn undo_depth(&self) -> usize {
        self.journal().len()
    }

    /// Current view of a chain, waiting for any in-flight work on it.
    pub async fn view(&self, key: ChainKey) -> ChainSnapshot {
        self.view_handle(key).lock().await.snapshot()
    }

    /// Lists the chain and replaces the cached view. Also the way out of the
    /// error state.
    pub async fn refresh(&self, key: ChainKey) -> Result<ChainSnapshot, SessionError> {
        let handle = self.view_handle(key);
        let mut view = handle.lock().await;
        self.reload(&mut view).await?;
        Ok(view.snapshot())
    }

    /// Appends `rule` to its chain, or inserts it at `at`.
    pub async fn insert(
        &self,
        rule: Rule,
        at: Option<PositionRef>,
    ) -> Result<MutationOutcome, SessionError> {
        let key = rule.key();
        let handle = self.view_handle(key);
        let mut view = handle.lock().await;

        if let Some(reference) = &at {
            view.store.confirm_slot(reference)?;
        }
        let at = at.map(|reference| reference.position);

        let outcome = self
            .mutate(
                &mut view,
                Mutation::Insert {
                    rule: rule.clone(),
                    at,
                },
            )
            .await?;

        let position = match &outcome {
            MutationOutcome::Applied { .. } => locate(&view.store, &rule, at),
            _ => None,
        };
        if outcome.is_applied() {
            self.journal().record(AppliedMutation::Inserted {
                key,
                rule,
                position,
            });
        }
        Ok(outcome)
    }

    /// Deletes the rule a position reference points at.
    ///
    /// The reference must come from the current listing; any mutation or
    /// refresh since it was taken makes it stale, and the request is rejected
    /// before the backend is called.
    pub async fn delete(&self, reference: PositionRef) -> Result<MutationOutcome, SessionError> {
        let handle = self.view_handle(reference.key);
        let mut view = handle.lock().await;

        let removed = view.store.confirm(&reference)?.rule().cloned();
        let outcome = self
            .mutate(
                &mut view,
                Mutation::Delete {
                    position: reference.position,
                },
            )
            .await?;

        if outcome.is_applied() {
            self.journal().record(AppliedMutation::Deleted {
                key: reference.key,
                position: reference.position,
                rule: removed,
            });
        }
        Ok(outcome)
    }

    /// Reverses the most recent mutation of this session.
    pub async fn undo_last(&self) -> Result<MutationOutcome, SessionError> {
        let applied = self.journal().pop().ok_or(UndoError::Empty)?;
        let compensation = applied.compensation()?;

        let handle = self.view_handle(applied.key());
        let mut view = handle.lock().await;
        match self.compensate(&mut view, compensation).await {
            Err(e) if !matches!(e, SessionError::Undo(_)) => {
                self.journal().record(applied);
                Err(e)
            }
            result => {
                if result.is_ok() {
                    tracing::info!(key = %applied.key(), "undid last mutation");
                }
                result
            }
        }
    }

    async fn compensate(
        &self,
        view: &mut ChainView,
        compensation: Compensation,
    ) -> Result<MutationOutcome, SessionError> {
        // Compensations locate their target in a fresh listing.
        self.reload(view).await?;

        match compensation {
            Compensation::RemoveInserted { key, rule, hint } => {
                let position = locate(&view.store, &rule, hint).ok_or_else(|| UndoError::Missing {
                    key,
                    rule: to_command_args(&rule).join(" "),
                })?;
                self.mutate(view, Mutation::Delete { position }).await
            }
            Compensation::Reinsert { rule, at, .. } => {
                let at = (at.index() < view.store.len()).then_some(at);
                self.mutate(view, Mutation::Insert { rule, at }).await
            }
        }
    }

    async fn reload(&self, view: &mut ChainView) -> Result<(), SessionError> {
        view.state.transition(ViewState::Loading)?;
        match self.executor.list(view.store.key()).await {
            Ok(listing) => {
                view.store.refresh(listing.rows, listing.policy);
                view.state.transition(ViewState::Ready)?;
                view.last_error = None;
                Ok(())
            }
            Err(e) => {
                view.fail(&e);
                Err(e.into())
            }
        }
    }

    /// Ready -> Mutating -> Loading -> Ready, or Error on failure.
    async fn mutate(
        &self,
        view: &mut ChainView,
        mutation: Mutation,
    ) -> Result<MutationOutcome, SessionError> {
        let key = view.store.key();
        let args = self.executor.mutation_args(key, &mutation)?;

        if view.state != ViewState::Ready {
            return Err(SessionError::NotReady {
                key,
                state: view.state,
                operation: mutation.verb(),
            });
        }
        if self.executor.is_dry_run() {
            self.executor.apply(key, &mutation).await?;
            return Ok(MutationOutcome::DryRun { args });
        }

        view.state.transition(ViewState::Mutating)?;
        let before = view.store.rules().to_vec();

        if let Err(e) = self.executor.apply(key, &mutation).await {
            let unchanged = match &e {
                ct_core::Error::Execution(exec) => exec.state_unchanged(),
                _ => true,
            };
            if !unchanged {
                // The kernel may or may not have applied it.
                view.store.invalidate();
            }
            view.fail(&e);
            return Err(e.into());
        }
        view.store.invalidate();

        match self.reload(view).await {
            Ok(()) => {
                let changes = diff_rules(&before, view.store.rules());
                let expected = match mutation {
                    Mutation::Insert { .. } => (1, 0),
                    Mutation::Delete { .. } => (0, 1),
                };
                if (changes.added, changes.removed) != expected {
                    tracing::warn!(
                        %key,
                        added = changes.added,
                        removed = changes.removed,
                        "chain changed outside this session:\n{}",
                        changes.unified
                    );
                }
                Ok(MutationOutcome::Applied {
                    view: view.snapshot(),
                    changes,
                })
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "mutation applied but the chain could not be listed");
                Ok(MutationOutcome::AppliedStale {
                    view: view.snapshot(),
                    refresh_error: e.to_string(),
                })
            }
        }
    }
}

/// Position of `rule` in the store, preferring `hint` when it still matches.
fn locate(store: &RuleStore, rule: &Rule, hint: Option<Position>) -> Option<Position> {
    if let Some(hint) = hint {
        if store.rules().get(hint.index()).and_then(ListedRule::rule) == Some(rule) {
            return Some(hint);
        }
    }
    store
        .rfind(|row| row.rule() == Some(rule))
        .map(|reference| reference.position)
}
