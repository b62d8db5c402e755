//! In-page overlay injection.
//!
//! The page-side guard (`window.__webevalOverlay`) prevents double
//! injection within one document and is deleted on any setup exception.
//! [`OverlayInjector`] mirrors it on the Rust side as an explicit
//! [`InjectionState`] per navigation generation, so a failed or abandoned
//! attempt never blocks the next one.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webeval_core::config::OverlayConfig;
use webeval_core::error::{Result, WebEvalError};

use crate::driver::LivePage;

pub const BRIDGE_JS: &str = include_str!("../assets/bridge.js");
const OVERLAY_TEMPLATE: &str = include_str!("../assets/overlay.js");

/// Upper bound on the overlay's state poll, so pauses show within a second.
const MAX_STATE_POLL_MS: u64 = 1000;

/// Render the overlay script with its timing constants.
pub fn overlay_script(config: &OverlayConfig) -> String {
    let poll = config.state_poll_ms.clamp(50, MAX_STATE_POLL_MS);
    OVERLAY_TEMPLATE
        .replace("__STATE_POLL_MS__", &poll.to_string())
        .replace(
            "__STACKING_WINDOW_MS__",
            &config.stacking_window_ms.to_string(),
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionState {
    Idle,
    Injecting { generation: u64 },
    Injected { generation: u64 },
    Failed { generation: u64, attempts: u32, last_error: String },
}

/// What a call to [`OverlayInjector::inject`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected,
    /// This document already has the overlay.
    AlreadyPresent,
    /// Another attempt for this document is in flight.
    InProgress,
}

struct Tracker {
    generation: u64,
    failures: u32,
    state: InjectionState,
}

pub struct OverlayInjector {
    script: String,
    tracker: Mutex<Tracker>,
}

impl OverlayInjector {
    pub fn new(config: &OverlayConfig) -> Self {
        Self {
            script: overlay_script(config),
            tracker: Mutex::new(Tracker {
                generation: 0,
                failures: 0,
                state: InjectionState::Idle,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> InjectionState {
        self.lock().state.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// A new document replaced the old one; whatever was injected is gone.
    pub fn navigated(&self) -> u64 {
        let mut tracker = self.lock();
        tracker.generation += 1;
        tracker.failures = 0;
        tracker.state = InjectionState::Idle;
        tracker.generation
    }

    /// Inject into the current document unless it already has the overlay.
    pub async fn inject(&self, page: &dyn LivePage) -> Result<InjectOutcome> {
        let generation = {
            let mut tracker = self.lock();
            let generation = tracker.generation;
            match tracker.state {
                InjectionState::Injected { generation: g } if g == generation => {
                    return Ok(InjectOutcome::AlreadyPresent);
                }
                InjectionState::Injecting { generation: g } if g == generation => {
                    return Ok(InjectOutcome::InProgress);
                }
                _ => {}
            }
            tracker.state = InjectionState::Injecting { generation };
            generation
        };

        let mut attempt = Attempt {
            injector: self,
            generation,
            settled: false,
        };
        match page.evaluate(&self.script).await {
            Ok(value) if value.as_str() == Some("busy") => {
                // Another install is mid-flight in this document.
                let reason = "overlay setup still in progress";
                attempt.fail(reason);
                Err(WebEvalError::InjectionFailure(reason.into()))
            }
            Ok(value) => {
                attempt.succeed();
                let outcome = match value.as_str() {
                    Some("already") => InjectOutcome::AlreadyPresent,
                    _ => InjectOutcome::Injected,
                };
                debug!(generation, ?outcome, "Overlay injection finished");
                Ok(outcome)
            }
            Err(e) => {
                let reason = e.to_string();
                attempt.fail(&reason);
                Err(WebEvalError::InjectionFailure(reason))
            }
        }
    }

    fn settle(&self, generation: u64, result: std::result::Result<(), &str>) {
        let mut tracker = self.lock();
        // A navigation during the attempt already reset the state.
        if tracker.generation != generation {
            return;
        }
        tracker.state = match result {
            Ok(()) => {
                tracker.failures = 0;
                InjectionState::Injected { generation }
            }
            Err(error) => {
                tracker.failures += 1;
                InjectionState::Failed {
                    generation,
                    attempts: tracker.failures,
                    last_error: error.to_string(),
                }
            }
        };
    }
}

/// Releases the `Injecting` state if the attempt is dropped before it settles.
struct Attempt<'a> {
    injector: &'a OverlayInjector,
    generation: u64,
    settled: bool,
}

impl Attempt<'_> {
    fn succeed(&mut self) {
        self.settled = true;
        self.injector.settle(self.generation, Ok(()));
    }

    fn fail(&mut self, reason: &str) {
        self.settled = true;
        self.injector.settle(self.generation, Err(reason));
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.injector.settle(self.generation, Err("injection abandoned"));
        }
    }
}

/// A retry loop with a fixed delay, a maximum number of attempts, and a
/// cancellation token. It always terminates.
#[derive(Debug, Clone)]
pub struct BoundedRetry {
    pub attempts: u32,
    pub delay: Duration,
    pub cancel: CancellationToken,
}

impl BoundedRetry {
    pub fn new(attempts: u32, delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            attempts,
            delay,
            cancel,
        }
    }

    pub fn from_config(config: &OverlayConfig, cancel: CancellationToken) -> Self {
        Self::new(
            config.reinject_attempts.max(1),
            Duration::from_millis(config.reinject_delay_ms),
            cancel,
        )
    }

    /// Run `op` after each delay until it succeeds, the attempts run out,
    /// or the token is cancelled. Returns the first success.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for attempt in 1..=self.attempts {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(attempt, "Retry cancelled");
                    return None;
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            match op(attempt).await {
                Ok(value) => return Some(value),
                Err(e) => warn!(attempt, max = self.attempts, %e, "Attempt failed"),
            }
        }
        info!(attempts = self.attempts, "Giving up after retries");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use webeval_core::config::ScreencastConfig;

    /// Page whose evaluate fails a fixed number of times, then succeeds.
    struct FlakyPage {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyPage {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LivePage for FlakyPage {
        async fn expose_control(&self, _bridge_script: &str) -> Result<()> {
            Ok(())
        }
        async fn goto(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(WebEvalError::Browser("TypeError: body is null".into()));
            }
            Ok(serde_json::json!("injected"))
        }
        async fn start_screencast(&self, _config: &ScreencastConfig) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_script_substitution() {
        let config = OverlayConfig {
            state_poll_ms: 5000,
            ..OverlayConfig::default()
        };
        let script = overlay_script(&config);
        assert!(script.contains("const STATE_POLL_MS = 1000;"));
        assert!(script.contains("const STACKING_WINDOW_MS = 5000;"));
        assert!(!script.contains("__STATE_POLL_MS__"));
    }

    #[tokio::test]
    async fn test_inject_is_idempotent_per_document() {
        let injector = OverlayInjector::new(&OverlayConfig::default());
        let page = FlakyPage::new(0);
        assert_eq!(injector.inject(&page).await.unwrap(), InjectOutcome::Injected);
        assert_eq!(
            injector.inject(&page).await.unwrap(),
            InjectOutcome::AlreadyPresent
        );
        assert_eq!(page.calls.load(Ordering::SeqCst), 1);

        injector.navigated();
        assert_eq!(injector.state(), InjectionState::Idle);
        assert_eq!(injector.inject(&page).await.unwrap(), InjectOutcome::Injected);
        assert_eq!(page.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_releases_guard() {
        let injector = OverlayInjector::new(&OverlayConfig::default());
        let page = FlakyPage::new(2);

        let err = injector.inject(&page).await.unwrap_err();
        assert!(matches!(err, WebEvalError::InjectionFailure(_)));
        assert!(matches!(
            injector.state(),
            InjectionState::Failed { attempts: 1, .. }
        ));

        assert!(injector.inject(&page).await.is_err());
        assert!(matches!(
            injector.state(),
            InjectionState::Failed { attempts: 2, .. }
        ));

        assert_eq!(injector.inject(&page).await.unwrap(), InjectOutcome::Injected);
        assert_eq!(injector.state(), InjectionState::Injected { generation: 0 });
    }

    #[tokio::test]
    async fn test_abandoned_attempt_does_not_stick() {
        struct HangingPage;

        #[async_trait]
        impl LivePage for HangingPage {
            async fn expose_control(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn goto(&self, _: &str) -> Result<()> {
                Ok(())
            }
            async fn evaluate(&self, _: &str) -> Result<serde_json::Value> {
                std::future::pending().await
            }
            async fn start_screencast(&self, _: &ScreencastConfig) -> Result<()> {
                Ok(())
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let injector = OverlayInjector::new(&OverlayConfig::default());
        let attempt =
            tokio::time::timeout(Duration::from_millis(20), injector.inject(&HangingPage)).await;
        assert!(attempt.is_err());
        assert!(matches!(injector.state(), InjectionState::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_succeeds_eventually() {
        let injector = Arc::new(OverlayInjector::new(&OverlayConfig::default()));
        let page = Arc::new(FlakyPage::new(2));
        let retry = BoundedRetry::new(3, Duration::from_millis(500), CancellationToken::new());

        let outcome = retry
            .run(|_| {
                let injector = injector.clone();
                let page = page.clone();
                async move { injector.inject(page.as_ref()).await }
            })
            .await;
        assert_eq!(outcome, Some(InjectOutcome::Injected));
        assert_eq!(page.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let retry = BoundedRetry::new(3, Duration::from_millis(500), CancellationToken::new());
        let outcome: Option<()> = retry
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(WebEvalError::InjectionFailure("nope".into()))
                }
            })
            .await;
        assert!(outcome.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_cancelled() {
        let cancel = CancellationToken::new();
        let retry = BoundedRetry::new(10, Duration::from_secs(60), cancel.clone());
        let task = tokio::spawn(async move {
            retry
                .run(|_| async { Ok::<_, WebEvalError>(()) })
                .await
        });
        cancel.cancel();
        assert_eq!(task.await.unwrap(), None);
    }
}
