use std::{future::Future, sync::Arc, time::Duration};

use terminal_integration::{ContextWrite, TerminalSession};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum spacing between two applied group-context writes.
pub const CONTEXT_THROTTLE_WINDOW: Duration = Duration::from_millis(1200);

/// Holds at most one pending delayed task. Scheduling a new one cancels
/// the old one first.
#[derive(Default)]
pub struct DeferredTask {
    pending: Option<CancellationToken>,
}

impl DeferredTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` after `delay` unless cancelled or replaced first. The
    /// task gets its token so it can recheck cancellation after taking
    /// whatever lock guards its effect.
    pub fn schedule<F, Fut>(&mut self, delay: Duration, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let token = CancellationToken::new();
        self.pending = Some(token.clone());
        let replaced = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = replaced.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(token).await,
            }
        });
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }

    /// Clears the slot once the pending task has fired.
    pub fn complete(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    Applied,
    Deferred { delay: Duration },
}

struct ThrottleState {
    last_applied: Option<Instant>,
    deferred: DeferredTask,
}

/// Trailing-edge throttle for SetGroupContext: at most one write per
/// window, and a deferred write always carries the newest arguments.
pub struct ContextThrottle {
    terminal: Arc<dyn TerminalSession>,
    window: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl ContextThrottle {
    pub fn new(terminal: Arc<dyn TerminalSession>, window: Duration) -> Self {
        Self {
            terminal,
            window,
            state: Arc::new(Mutex::new(ThrottleState {
                last_applied: None,
                deferred: DeferredTask::new(),
            })),
        }
    }

    pub async fn submit(&self, write: ContextWrite) -> anyhow::Result<ThrottleOutcome> {
        let mut guard = self.state.lock().await;
        let elapsed = guard.last_applied.map(|at| at.elapsed());

        if let Some(elapsed) = elapsed.filter(|elapsed| *elapsed < self.window) {
            let delay = self.window - elapsed;
            let terminal = Arc::clone(&self.terminal);
            let state = Arc::clone(&self.state);
            debug!(
                group = %write.group,
                delay_ms = delay.as_millis() as u64,
                "throttle: deferring group context write"
            );
            guard.deferred.schedule(delay, move |token| async move {
                let mut guard = state.lock().await;
                if token.is_cancelled() {
                    return;
                }
                guard.deferred.complete();
                match terminal.set_group_context(&write).await {
                    Ok(()) => {
                        guard.last_applied = Some(Instant::now());
                        info!(group = %write.group, "throttle: applied deferred group context");
                    }
                    Err(err) => {
                        warn!(group = %write.group, %err, "throttle: deferred group context write failed");
                    }
                }
            });
            return Ok(ThrottleOutcome::Deferred { delay });
        }

        // A pending write is older than this one and must not land after it.
        guard.deferred.cancel();
        self.terminal.set_group_context(&write).await?;
        guard.last_applied = Some(Instant::now());
        Ok(ThrottleOutcome::Applied)
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.deferred.is_pending()
    }

    pub async fn cancel_pending(&self) {
        self.state.lock().await.deferred.cancel();
    }
}

#[cfg(test)]
mod tests {
    use terminal_integration::memory::InMemoryTerminal;

    use super::*;

    fn write(value: &str) -> ContextWrite {
        ContextWrite {
            group: "Group-A".into(),
            value: value.into(),
            cookie: None,
        }
    }

    async fn throttle() -> (Arc<InMemoryTerminal>, ContextThrottle) {
        let terminal = Arc::new(InMemoryTerminal::new());
        terminal.add_group("Group-A", "security", None).await;
        let throttle = ContextThrottle::new(terminal.clone(), CONTEXT_THROTTLE_WINDOW);
        (terminal, throttle)
    }

    async fn applied_values(terminal: &InMemoryTerminal) -> Vec<String> {
        terminal
            .calls()
            .await
            .context_writes
            .into_iter()
            .map(|w| w.value)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_write_applies_immediately() {
        let (terminal, throttle) = throttle().await;
        let outcome = throttle.submit(write("IBM US Equity")).await.expect("submit");
        assert_eq!(outcome, ThrottleOutcome::Applied);
        assert_eq!(applied_values(&terminal).await, vec!["IBM US Equity"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_writes_apply_only_the_last() {
        let (terminal, throttle) = throttle().await;
        throttle.submit(write("first")).await.expect("submit");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = throttle.submit(write("second")).await.expect("submit");
        assert!(matches!(
            outcome,
            ThrottleOutcome::Deferred { delay } if delay <= Duration::from_millis(1100)
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = throttle.submit(write("third")).await.expect("submit");
        assert!(matches!(
            outcome,
            ThrottleOutcome::Deferred { delay } if delay <= Duration::from_millis(900)
        ));

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(applied_values(&terminal).await, vec!["first", "third"]);
        assert!(!throttle.has_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_writes_both_apply_and_reset_the_window() {
        let (terminal, throttle) = throttle().await;
        throttle.submit(write("a")).await.expect("submit");
        tokio::time::sleep(CONTEXT_THROTTLE_WINDOW).await;
        assert_eq!(
            throttle.submit(write("b")).await.expect("submit"),
            ThrottleOutcome::Applied
        );

        // The window now runs from the second apply.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            throttle.submit(write("c")).await.expect("submit"),
            ThrottleOutcome::Deferred { delay } if delay <= Duration::from_millis(600)
        ));
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(applied_values(&terminal).await, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_drops_the_deferred_write() {
        let (terminal, throttle) = throttle().await;
        throttle.submit(write("a")).await.expect("submit");
        throttle.submit(write("b")).await.expect("submit");
        assert!(throttle.has_pending().await);

        throttle.cancel_pending().await;
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(applied_values(&terminal).await, vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_task_replacement_cancels_previous() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut task = DeferredTask::new();
        for label in ["one", "two"] {
            let fired = Arc::clone(&fired);
            task.schedule(Duration::from_millis(50), move |_| async move {
                fired.lock().await.push(label);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fired.lock().await, vec!["two"]);
    }
}
