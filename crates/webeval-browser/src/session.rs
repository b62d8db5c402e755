//! Browser session manager.
//!
//! [`BrowserSession`] owns a one-slot registry: at most one session is
//! running per manager, and a second `start` fails with `AlreadyRunning`
//! until the first is torn down. The agent loop drives the page through the
//! returned [`SessionHandle`] and calls [`SessionHandle::before_step`] before
//! every action.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OnceCell, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use webeval_core::config::Config;
use webeval_core::control::{
    ControlCommand, ControlOrigin, ControlSnapshot, ControlState, Decision,
};
use webeval_core::error::{Result, WebEvalError};
use webeval_core::events::{EventBus, EventPayload, StepEvent};
use webeval_core::report::Report;
use webeval_core::session::{SessionInfo, SessionStatus};

use crate::capture::{NetworkTracker, console_event};
use crate::driver::{BrowserDriver, LivePage, PageSignal, SignalReceiver};
use crate::overlay::{BRIDGE_JS, BoundedRetry, InjectionState, OverlayInjector};
use crate::screencast::ScreencastRelay;

/// How long teardown waits for the event pump to drain.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// How long teardown waits for the browser to close before abandoning it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Task description carried into the report.
    pub task: Option<String>,
}

type Registry = watch::Sender<Option<SessionHandle>>;

/// State shared between the handle and the event pump.
struct Shared {
    info: SessionInfo,
    config: Arc<Config>,
    control: ControlState,
    events: Arc<EventBus>,
    screencast: ScreencastRelay,
    overlay: OverlayInjector,
    page: Arc<dyn LivePage>,
    status: Mutex<SessionStatus>,
    crash: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl Shared {
    fn crash_reason(&self) -> Option<String> {
        lock(&self.crash).clone()
    }

    /// First crash wins. Forces the control state to its terminal phase.
    fn crashed(&self, reason: String) {
        {
            let mut crash = lock(&self.crash);
            if crash.is_some() {
                return;
            }
            error!(session_id = %self.info.id, %reason, "Browser crashed");
            *crash = Some(reason);
        }
        *lock(&self.status) = SessionStatus::Crashed;
        self.control.seal();
    }
}

struct SessionInner {
    shared: Arc<Shared>,
    steps: AtomicU32,
    pump: Mutex<Option<JoinHandle<()>>>,
    report: OnceCell<Arc<Report>>,
    registry: Weak<Registry>,
}

/// Handle to the running session. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.inner.shared.info.id
    }

    /// Session metadata with the current status.
    pub fn info(&self) -> SessionInfo {
        let mut info = self.inner.shared.info.clone();
        info.status = self.status();
        info
    }

    pub fn status(&self) -> SessionStatus {
        *lock(&self.inner.shared.status)
    }

    pub fn control(&self) -> &ControlState {
        &self.inner.shared.control
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.shared.events
    }

    pub fn screencast(&self) -> &ScreencastRelay {
        &self.inner.shared.screencast
    }

    /// The page the agent loop drives.
    pub fn page(&self) -> Arc<dyn LivePage> {
        self.inner.shared.page.clone()
    }

    pub fn overlay_state(&self) -> InjectionState {
        self.inner.shared.overlay.state()
    }

    pub fn crash_reason(&self) -> Option<String> {
        self.inner.shared.crash_reason()
    }

    /// The report, once the session has been torn down.
    pub fn report(&self) -> Option<Arc<Report>> {
        self.inner.report.get().cloned()
    }

    /// Checkpoint before every automation step.
    ///
    /// Suspends while paused, re-checking at least every
    /// `control.poll_interval_ms`. Returns `Abort` once stopped.
    pub async fn before_step(&self) -> Result<Decision> {
        let shared = &self.inner.shared;
        if let Some(reason) = shared.crash_reason() {
            return Err(WebEvalError::SessionCrashed(reason));
        }
        let decision = shared
            .control
            .wait_runnable(shared.config.poll_interval())
            .await;
        if decision == Decision::Abort {
            if let Some(reason) = shared.crash_reason() {
                return Err(WebEvalError::SessionCrashed(reason));
            }
        }
        Ok(decision)
    }

    /// Record one agent step. Returns the event's sequence number.
    pub fn record_step(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        outcome: Option<String>,
    ) -> u64 {
        let index = self.inner.steps.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.shared.events.record(EventPayload::Step(StepEvent {
            index,
            action: action.into(),
            target: target.into(),
            outcome,
        }))
    }

    /// Release the browser and build the report. Idempotent: later calls
    /// return the same report without touching the browser again.
    pub async fn teardown(&self) -> Arc<Report> {
        self.inner
            .report
            .get_or_init(|| self.inner.finish())
            .await
            .clone()
    }
}

impl SessionInner {
    async fn finish(&self) -> Arc<Report> {
        let shared = &self.shared;
        let session_id = shared.info.id;
        debug!(%session_id, "Tearing down session");

        let final_state = shared.control.snapshot();
        shared.control.seal();
        shared.cancel.cancel();

        let pump = lock(&self.pump).take();
        if let Some(mut pump) = pump {
            match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut pump).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%session_id, %e, "Event pump failed"),
                Err(_) => {
                    warn!(%session_id, "Event pump did not drain in time");
                    pump.abort();
                }
            }
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, shared.page.close()).await {
            Ok(Ok(())) => debug!(%session_id, "Browser released"),
            Ok(Err(e)) => warn!(%session_id, %e, "Browser close failed"),
            Err(_) => warn!(%session_id, "Browser close timed out, abandoning it"),
        }

        let crash_reason = shared.crash_reason();
        let status = Report::status_for(final_state.phase, crash_reason.as_deref());
        *lock(&shared.status) = status;

        let (events, truncated) = shared.events.snapshot_with_truncation();
        let mut session = shared.info.clone();
        session.status = status;
        let report = Arc::new(Report {
            session,
            events,
            truncated,
            final_state,
            status,
            crash_reason,
        });

        if let Some(registry) = self.registry.upgrade() {
            registry.send_if_modified(|current| {
                if current.as_ref().is_some_and(|h| h.id() == session_id) {
                    *current = None;
                    true
                } else {
                    false
                }
            });
        }

        info!(
            %session_id,
            %status,
            events = report.events.len(),
            truncated,
            "Session ended"
        );
        report
    }
}

/// Owner of the one live browser session.
pub struct BrowserSession {
    driver: Arc<dyn BrowserDriver>,
    config: Arc<Config>,
    starting: AsyncMutex<()>,
    current: Arc<Registry>,
}

impl BrowserSession {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: Arc<Config>) -> Self {
        let (current, _rx) = watch::channel(None);
        Self {
            driver,
            config,
            starting: AsyncMutex::new(()),
            current: Arc::new(current),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// The registered session, if any (running, or crashed and not yet torn down).
    pub fn active(&self) -> Option<SessionHandle> {
        self.current.borrow().clone()
    }

    /// Join the session some other caller started.
    pub fn attach(&self) -> Result<SessionHandle> {
        self.active().ok_or(WebEvalError::NoSession)
    }

    /// Observe sessions starting and ending.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionHandle>> {
        self.current.subscribe()
    }

    /// Launch the browser, open `target_url`, and install the in-page controls.
    pub async fn start(&self, target_url: &str, options: StartOptions) -> Result<SessionHandle> {
        let _starting = self.starting.lock().await;

        if let Some(existing) = self.active() {
            if existing.status() == SessionStatus::Running {
                return Err(WebEvalError::AlreadyRunning {
                    session_id: existing.id().to_string(),
                });
            }
            debug!(session_id = %existing.id(), "Releasing crashed session before restart");
            existing.teardown().await;
        }

        let browser = self.config.browser();
        let overlay = self.config.overlay();
        let (signal_tx, signal_rx) = tokio::sync::mpsc::unbounded_channel();
        let page = self.driver.launch(&browser, signal_tx).await?;

        let info = SessionInfo::new(target_url, options.task);
        let session_id = info.id;
        info!(
            %session_id,
            url = target_url,
            driver = self.driver.name(),
            "Starting session"
        );

        let shared = Arc::new(Shared {
            info,
            config: self.config.clone(),
            control: ControlState::new(),
            events: Arc::new(EventBus::new(self.config.retention_cap())),
            screencast: ScreencastRelay::new(browser.screencast.format),
            overlay: OverlayInjector::new(&overlay),
            page: page.clone(),
            status: Mutex::new(SessionStatus::Running),
            crash: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        let handle = SessionHandle {
            inner: Arc::new(SessionInner {
                shared: shared.clone(),
                steps: AtomicU32::new(0),
                pump: Mutex::new(None),
                report: OnceCell::new(),
                registry: Arc::downgrade(&self.current),
            }),
        };

        if let Err(e) = page.expose_control(BRIDGE_JS).await {
            warn!(%session_id, %e, "Control bridge unavailable, in-page controls disabled");
        }
        if browser.screencast.enabled {
            if let Err(e) = page.start_screencast(&browser.screencast).await {
                warn!(%session_id, %e, "Screencast unavailable");
            }
        }

        let pump = tokio::spawn(run_pump(shared.clone(), signal_rx));
        *lock(&handle.inner.pump) = Some(pump);

        let navigated = match tokio::time::timeout(browser.timeout(), page.goto(target_url)).await
        {
            Ok(result) => result,
            Err(_) => Err(WebEvalError::Browser(format!(
                "navigation to {target_url} timed out"
            ))),
        };
        if let Err(e) = navigated {
            warn!(%session_id, %e, "Navigation failed, releasing browser");
            handle.teardown().await;
            return Err(e);
        }

        if overlay.enabled {
            if let Err(e) = shared.overlay.inject(page.as_ref()).await {
                warn!(%session_id, %e, "Overlay injection failed, retrying in background");
                spawn_reinjection(&shared, shared.cancel.child_token());
            }
        }

        self.current.send_replace(Some(handle.clone()));
        Ok(handle)
    }
}

/// Consume page signals until the session is cancelled, then drain what is
/// already queued and flush unanswered requests.
async fn run_pump(shared: Arc<Shared>, mut signals: SignalReceiver) {
    let mut network = NetworkTracker::new();
    let mut reinjection: Option<CancellationToken> = None;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => handle_signal(&shared, &mut network, &mut reinjection, signal),
                None => {
                    debug!(session_id = %shared.info.id, "Page signal channel closed");
                    break;
                }
            },
        }
    }

    while let Ok(signal) = signals.try_recv() {
        if matches!(
            signal,
            PageSignal::Console { .. }
                | PageSignal::Request { .. }
                | PageSignal::Response { .. }
                | PageSignal::LoadingFailed { .. }
        ) {
            handle_signal(&shared, &mut network, &mut reinjection, signal);
        }
    }
    for event in network.flush() {
        shared.events.record(EventPayload::Network(event));
    }
    if let Some(token) = reinjection {
        token.cancel();
    }
}

fn handle_signal(
    shared: &Arc<Shared>,
    network: &mut NetworkTracker,
    reinjection: &mut Option<CancellationToken>,
    signal: PageSignal,
) {
    match signal {
        PageSignal::Console {
            level,
            text,
            location,
        } => {
            shared
                .events
                .record(EventPayload::Console(console_event(&level, text, location)));
        }
        PageSignal::Request {
            id,
            method,
            url,
            resource_type,
        } => network.request(id, method, url, resource_type),
        PageSignal::Response {
            id,
            url,
            status,
            resource_type,
        } => {
            let event = network.response(&id, url, status, resource_type);
            shared.events.record(EventPayload::Network(event));
        }
        PageSignal::LoadingFailed { id, error } => match network.failed(&id, error) {
            Some(event) => {
                shared.events.record(EventPayload::Network(event));
            }
            None => debug!(request_id = %id, "Failure for unknown request"),
        },
        PageSignal::Frame { data } => {
            shared.screencast.publish(data);
        }
        PageSignal::ControlCall { id, call } => answer_control_call(shared, id, &call),
        PageSignal::Navigated { url } => {
            let generation = shared.overlay.navigated();
            debug!(session_id = %shared.info.id, %url, generation, "Page navigated");
            if shared.config.overlay().enabled {
                if let Some(previous) = reinjection.take() {
                    previous.cancel();
                }
                let token = shared.cancel.child_token();
                spawn_reinjection(shared, token.clone());
                *reinjection = Some(token);
            }
        }
        PageSignal::Crashed(reason) => shared.crashed(reason),
    }
}

/// Route a bridge call through the same control path the dashboard uses.
fn answer_control_call(shared: &Arc<Shared>, id: u64, call: &str) {
    let result = match call {
        "pause" => shared
            .control
            .request(ControlCommand::Pause, ControlOrigin::Overlay),
        "resume" => shared
            .control
            .request(ControlCommand::Resume, ControlOrigin::Overlay),
        "stop" => shared
            .control
            .request(ControlCommand::Stop, ControlOrigin::Overlay),
        "state" => Ok(shared.control.snapshot()),
        other => Err(WebEvalError::Other(anyhow::anyhow!(
            "unknown control call: {other}"
        ))),
    };
    let (ok, value) = match result {
        Ok(snapshot) => (true, agent_state_json(&snapshot)),
        Err(e) => (
            false,
            serde_json::json!({ "code": e.error_code(), "message": e.to_string() }),
        ),
    };

    let page = shared.page.clone();
    tokio::spawn(async move {
        if let Err(e) = page.resolve_call(id, ok, value).await {
            debug!(call_id = id, %e, "Could not settle control call");
        }
    });
}

fn agent_state_json(snapshot: &ControlSnapshot) -> serde_json::Value {
    let state = snapshot.agent_state();
    serde_json::json!({ "paused": state.paused, "stopped": state.stopped })
}

fn spawn_reinjection(shared: &Arc<Shared>, cancel: CancellationToken) {
    let shared = shared.clone();
    let retry = BoundedRetry::from_config(&shared.config.overlay(), cancel);
    tokio::spawn(async move {
        let outcome = retry
            .run(|_| shared.overlay.inject(shared.page.as_ref()))
            .await;
        match outcome {
            Some(outcome) => debug!(session_id = %shared.info.id, ?outcome, "Overlay re-injected"),
            None => debug!(session_id = %shared.info.id, "Overlay re-injection abandoned"),
        }
    });
}
