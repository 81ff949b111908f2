use crate::controller::{MutationOutcome, SessionController};
use crate::error::SessionError;
use ct_ipt::RuleBackend;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;

/// Keeps a mutation only if the operator confirms it in time.
///
/// Guards against locking oneself out of a remote host: a rule that cuts
/// the session off is undone when nobody presses ENTER.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationGuard {
    window: Duration,
}

#[derive(Debug, Clone)]
pub enum Confirmation {
    Kept,
    RolledBack(MutationOutcome),
}

impl ConfirmationGuard {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True when `confirmed` completes inside the window.
    pub async fn wait(&self, confirmed: impl Future<Output = ()>) -> bool {
        timeout(self.window, confirmed).await.is_ok()
    }
}

/// Resolves when a line is read from stdin; never resolves if stdin is closed.
pub async fn enter_pressed() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if !matches!(lines.next_line().await, Ok(Some(_))) {
        std::future::pending::<()>().await;
    }
}

impl<B: RuleBackend> SessionController<B> {
    /// Undoes the last mutation unless `confirmed` resolves within the
    /// guard's window.
    pub async fn confirm_or_undo(
        &self,
        guard: &ConfirmationGuard,
        confirmed: impl Future<Output = ()>,
    ) -> Result<Confirmation, SessionError> {
        if guard.wait(confirmed).await {
            return Ok(Confirmation::Kept);
        }
        tracing::warn!(window = ?guard.window(), "mutation not confirmed, undoing");
        let outcome = self.undo_last().await?;
        Ok(Confirmation::RolledBack(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ct_core::{Chain, ChainKey, RuleForm, Table};
    use ct_ipt::CommandExecutor;
    use ct_ipt::sim::SimulatedBackend;
    use std::sync::Arc;

    fn input() -> ChainKey {
        ChainKey::new(Table::Filter, Chain::Input).unwrap()
    }

    async fn session_with_one_insert(sim: &SimulatedBackend) -> SessionController<SimulatedBackend> {
        let session = SessionController::new(Arc::new(CommandExecutor::new(sim.clone())));
        session.refresh(input()).await.unwrap();
        let rule = RuleForm {
            action: Some("DROP".into()),
            source: Some("203.0.113.0/24".into()),
            ..Default::default()
        }
        .into_rule(input())
        .unwrap();
        session.insert(rule, None).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_confirmed_change_is_kept() {
        let sim = SimulatedBackend::new();
        let session = session_with_one_insert(&sim).await;
        let guard = ConfirmationGuard::new(Duration::from_secs(5));

        let result = session.confirm_or_undo(&guard, async {}).await.unwrap();
        assert!(matches!(result, Confirmation::Kept));
        assert_eq!(sim.row_count(input()), 1);
        assert_eq!(session.undo_depth(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_change_is_undone() {
        let sim = SimulatedBackend::new();
        let session = session_with_one_insert(&sim).await;
        let guard = ConfirmationGuard::new(Duration::from_millis(20));

        let result = session
            .confirm_or_undo(&guard, std::future::pending())
            .await
            .unwrap();
        assert!(matches!(result, Confirmation::RolledBack(_)));
        assert_eq!(sim.row_count(input()), 0);
    }
}
