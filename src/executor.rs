//! Applies model-chosen actions to the page, one at a time, behind the safety gate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::dom;
use crate::journal::Journal;
use crate::safety::SafetyGate;
use crate::surface::PageSurface;
use crate::types::{Action, Viewport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Enforce,
    /// The caller has already confirmed the sensitive page.
    Bypass,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Every action ran (or failed non-fatally).
    Finished,
    /// A `Complete` action was reached.
    Completed,
    /// Cancellation was observed between actions.
    Cancelled,
    /// The safety gate fired, or could not read the page; `pending` starts with
    /// the action that was held back and `keywords` is empty in the latter case.
    Paused {
        pending: Vec<Action>,
        keywords: Vec<String>,
    },
}

pub struct ActionExecutor {
    gate: SafetyGate,
    journal: Arc<Journal>,
}

impl ActionExecutor {
    pub fn new(gate: SafetyGate, journal: Arc<Journal>) -> Self {
        Self { gate, journal }
    }

    pub async fn execute(
        &self,
        surface: &dyn PageSurface,
        actions: &[Action],
        viewport: Viewport,
        mode: GateMode,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        for (index, action) in actions.iter().enumerate() {
            if cancel.is_cancelled() {
                return ExecutionOutcome::Cancelled;
            }

            if mode == GateMode::Enforce {
                match self.gate.scan(surface).await {
                    Ok(keywords) if !keywords.is_empty() => {
                        self.journal.warning(format!(
                            "Safety check: page mentions {}. Paused before {}; confirm to continue.",
                            keywords.join(", "),
                            action.label()
                        ));
                        return ExecutionOutcome::Paused {
                            pending: actions[index..].to_vec(),
                            keywords,
                        };
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.journal.warning(format!(
                            "Safety check could not read the page ({e:#}). Paused before {}; confirm to continue.",
                            action.label()
                        ));
                        return ExecutionOutcome::Paused {
                            pending: actions[index..].to_vec(),
                            keywords: Vec::new(),
                        };
                    }
                }
            }

            if let Action::Complete = action {
                self.journal.action("complete");
                return ExecutionOutcome::Completed;
            }

            self.journal.action(action.label());
            match self.apply(surface, action, viewport, cancel).await {
                Ok(Some(detail)) => self.journal.result(detail),
                Ok(None) => {}
                Err(e) => self
                    .journal
                    .warning(format!("{} failed: {e:#}", action.label())),
            }
        }
        ExecutionOutcome::Finished
    }

    async fn apply(
        &self,
        surface: &dyn PageSurface,
        action: &Action,
        viewport: Viewport,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        match action {
            Action::Navigate { url } => {
                surface.load(url).await?;
                Ok(Some(format!("loading {url}")))
            }
            Action::ClickAt { x, y } => {
                let (px, py) = viewport.to_pixels(*x, *y);
                let value = surface.evaluate(&dom::click_at_script(px, py)).await?;
                let target = dom::describe_value(&value);
                if target == "no element" {
                    Ok(Some(format!("no element at ({px:.0}, {py:.0})")))
                } else {
                    Ok(Some(format!("clicked <{target}> at ({px:.0}, {py:.0})")))
                }
            }
            Action::Scroll { delta_y } => {
                surface.evaluate(&dom::scroll_script(*delta_y)).await?;
                Ok(None)
            }
            Action::Type { text } => {
                let value = surface.evaluate(&dom::type_script(text)).await?;
                Ok(Some(dom::describe_value(&value)))
            }
            Action::Wait { ms } => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(*ms)) => {}
                }
                Ok(None)
            }
            Action::Complete => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSurface;

    fn executor() -> (ActionExecutor, Arc<Journal>) {
        let journal = Arc::new(Journal::new());
        (
            ActionExecutor::new(SafetyGate::new(8_000), journal.clone()),
            journal,
        )
    }

    fn viewport() -> Viewport {
        Viewport::new(1000.0, 800.0)
    }

    #[tokio::test]
    async fn runs_actions_in_order() {
        let (executor, _) = executor();
        let surface = FakeSurface::new();
        let actions = vec![
            Action::Navigate { url: "https://example.test/a".into() },
            Action::ClickAt { x: 500.0, y: 500.0 },
            Action::Scroll { delta_y: 400.0 },
            Action::Type { text: "hello".into() },
        ];

        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Enforce, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ExecutionOutcome::Finished);
        assert_eq!(
            surface.effects(),
            vec!["load:https://example.test/a", "click", "scroll", "type"]
        );
    }

    #[tokio::test]
    async fn safety_match_preserves_exact_suffix() {
        let (executor, journal) = executor();
        let surface = FakeSurface::new();
        surface.push_text("Cart");
        surface.push_text("Please confirm order");
        let actions = vec![
            Action::Scroll { delta_y: 100.0 },
            Action::ClickAt { x: 10.0, y: 20.0 },
            Action::Type { text: "x".into() },
        ];

        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Enforce, &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Paused {
                pending: actions[1..].to_vec(),
                keywords: vec!["confirm".to_string()],
            }
        );
        assert_eq!(surface.effects(), vec!["scroll"]);
        assert_eq!(journal.count_containing("confirm"), 1);
    }

    #[tokio::test]
    async fn bypass_skips_the_gate() {
        let (executor, _) = executor();
        let surface = FakeSurface::new();
        surface.set_text("Delete account?");
        let actions = vec![Action::ClickAt { x: 1.0, y: 1.0 }];

        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Bypass, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ExecutionOutcome::Finished);
        assert_eq!(surface.effects(), vec!["click"]);
    }

    #[tokio::test]
    async fn script_failures_do_not_stop_the_batch() {
        let (executor, journal) = executor();
        let surface = FakeSurface::new();
        surface.fail_actions(true);
        let actions = vec![
            Action::ClickAt { x: 1.0, y: 1.0 },
            Action::Scroll { delta_y: 10.0 },
            Action::Complete,
        ];

        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Enforce, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(surface.effects(), vec!["click", "scroll"]);
        assert_eq!(journal.count_containing("failed"), 2);
    }

    #[tokio::test]
    async fn complete_ends_the_batch() {
        let (executor, _) = executor();
        let surface = FakeSurface::new();
        let actions = vec![Action::Complete, Action::Scroll { delta_y: 10.0 }];

        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Enforce, &CancellationToken::new())
            .await;

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert!(surface.effects().is_empty());
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancelled_without_running() {
        let (executor, _) = executor();
        let surface = FakeSurface::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor
            .execute(&surface, &[Action::Complete], viewport(), GateMode::Enforce, &cancel)
            .await;

        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(surface.calls().is_empty());
    }

    #[tokio::test]
    async fn unreadable_page_holds_the_batch() {
        let (executor, journal) = executor();
        let surface = FakeSurface::new();
        surface.fail_text(true);
        let actions = vec![
            Action::ClickAt { x: 10.0, y: 20.0 },
            Action::Type { text: "x".into() },
        ];

        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Enforce, &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Paused {
                pending: actions.clone(),
                keywords: Vec::new(),
            }
        );
        assert!(surface.effects().is_empty());
        assert_eq!(journal.count_containing("could not read the page"), 1);

        // Confirmed batches skip the read entirely.
        let outcome = executor
            .execute(&surface, &actions, viewport(), GateMode::Bypass, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ExecutionOutcome::Finished);
        assert_eq!(surface.effects(), vec!["click", "type"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_wait_in_progress() {
        let (executor, _) = executor();
        let surface = FakeSurface::new();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let actions = vec![Action::Wait { ms: 60_000 }, Action::Scroll { delta_y: 10.0 }];

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        };
        let (outcome, _) = tokio::join!(
            executor.execute(&surface, &actions, viewport(), GateMode::Enforce, &cancel),
            canceller
        );

        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(surface.effects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_suspends_for_the_requested_time() {
        let (executor, _) = executor();
        let surface = FakeSurface::new();
        let start = tokio::time::Instant::now();

        executor
            .execute(
                &surface,
                &[Action::Wait { ms: 750 }],
                viewport(),
                GateMode::Enforce,
                &CancellationToken::new(),
            )
            .await;

        assert!(start.elapsed() >= Duration::from_millis(750));
    }
}
