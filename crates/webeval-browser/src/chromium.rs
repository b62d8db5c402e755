//! Chromium driver over the DevTools protocol (chromiumoxide).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig as CdpConfig};
use chromiumoxide::cdp::browser_protocol::inspector::{
    EnableParams as InspectorEnable, EventTargetCrashed,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnable, EventLoadingFailed, EventRequestWillBeSent,
    EventResponseReceived,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventFrameNavigated, EventScreencastFrame,
    ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams, StopScreencastParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, EventBindingCalled, EventConsoleApiCalled,
};
use chromiumoxide::handler::viewport::Viewport;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webeval_core::config::{BrowserConfig, ScreencastConfig, ScreencastFormat};
use webeval_core::error::{Result, WebEvalError};

use crate::driver::{BrowserDriver, CONTROL_BINDING, LivePage, PageSignal, SignalSender};

fn browser_err<E: std::fmt::Display>(err: E) -> WebEvalError {
    WebEvalError::Browser(err.to_string())
}

/// Lower-case wire name of a CDP enum (`Warning` -> `warning`).
fn wire_name<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_ascii_lowercase))
}

/// Launches a local Chromium, or attaches to `browser.cdp_url` when set.
#[derive(Default)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }
}

fn build_config(config: &BrowserConfig) -> Result<CdpConfig> {
    let viewport = Viewport {
        width: config.viewport_width,
        height: config.viewport_height,
        device_scale_factor: None,
        emulating_mobile: false,
        is_landscape: config.viewport_width >= config.viewport_height,
        has_touch: false,
    };

    let mut builder = CdpConfig::builder()
        .viewport(viewport)
        .window_size(config.viewport_width, config.viewport_height)
        .request_timeout(config.timeout());
    if let Some(path) = &config.chrome_path {
        builder = builder.chrome_executable(path);
    }
    if !config.headless {
        builder = builder.with_head();
    }
    builder.build().map_err(WebEvalError::Browser)
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    fn name(&self) -> &str {
        "chromium"
    }

    async fn launch(
        &self,
        config: &BrowserConfig,
        signals: SignalSender,
    ) -> Result<Arc<dyn LivePage>> {
        let (browser, mut handler, owned) = match &config.cdp_url {
            Some(url) => {
                info!(url, "Attaching to running browser");
                let (browser, handler) = Browser::connect(url).await.map_err(browser_err)?;
                (browser, handler, false)
            }
            None => {
                info!(headless = config.headless, "Launching Chromium");
                let (browser, handler) = Browser::launch(build_config(config)?)
                    .await
                    .map_err(browser_err)?;
                (browser, handler, true)
            }
        };

        let cancel = CancellationToken::new();
        let closing = Arc::new(AtomicBool::new(false));

        // The handler drives the CDP connection; when it ends, the browser is gone.
        {
            let signals = signals.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                while let Some(result) = handler.next().await {
                    if let Err(e) = result {
                        debug!(%e, "CDP handler error");
                    }
                }
                if !closing.load(Ordering::Acquire) {
                    let _ = signals.send(PageSignal::Crashed(
                        "browser connection closed".to_string(),
                    ));
                }
            });
        }

        let page = match (owned, browser.pages().await) {
            (false, Ok(pages)) if !pages.is_empty() => pages.into_iter().next(),
            _ => None,
        };
        let page = match page {
            Some(page) => page,
            None => browser.new_page("about:blank").await.map_err(browser_err)?,
        };

        page.execute(NetworkEnable::default())
            .await
            .map_err(browser_err)?;
        if let Err(e) = page.execute(InspectorEnable::default()).await {
            debug!(%e, "Inspector domain unavailable, crash detection limited to disconnects");
        }

        let live = ChromiumPage {
            page,
            browser: Mutex::new(Some(browser)),
            owned,
            closing,
            cancel,
            signals,
        };
        live.spawn_listeners().await?;
        Ok(Arc::new(live))
    }
}

#[derive(Deserialize)]
struct BindingPayload {
    id: u64,
    call: String,
}

pub struct ChromiumPage {
    page: Page,
    browser: Mutex<Option<Browser>>,
    owned: bool,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
    signals: SignalSender,
}

impl ChromiumPage {
    /// Forward every event of a CDP stream as a page signal until cancelled.
    fn forward<T, S, F>(&self, mut stream: S, map: F)
    where
        T: Send + Sync + 'static,
        S: Stream<Item = Arc<T>> + Unpin + Send + 'static,
        F: Fn(&T) -> Option<PageSignal> + Send + 'static,
    {
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => {
                            if let Some(signal) = map(event.as_ref()) {
                                if signals.send(signal).is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    async fn spawn_listeners(&self) -> Result<()> {
        let console = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(browser_err)?;
        self.forward(console, |e: &EventConsoleApiCalled| {
            let text = e
                .args
                .iter()
                .map(|arg| match (&arg.value, &arg.description) {
                    (Some(serde_json::Value::String(s)), _) => s.clone(),
                    (Some(value), _) => value.to_string(),
                    (None, Some(description)) => description.clone(),
                    (None, None) => String::new(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            let location = e
                .stack_trace
                .as_ref()
                .and_then(|st| st.call_frames.first())
                .map(|f| format!("{}:{}", f.url, f.line_number + 1));
            Some(PageSignal::Console {
                level: wire_name(&e.r#type).unwrap_or_else(|| "log".into()),
                text,
                location,
            })
        });

        let requests = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(browser_err)?;
        self.forward(requests, |e: &EventRequestWillBeSent| {
            Some(PageSignal::Request {
                id: e.request_id.as_ref().to_string(),
                method: e.request.method.clone(),
                url: e.request.url.clone(),
                resource_type: e.r#type.as_ref().and_then(wire_name),
            })
        });

        let responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(browser_err)?;
        self.forward(responses, |e: &EventResponseReceived| {
            Some(PageSignal::Response {
                id: e.request_id.as_ref().to_string(),
                url: e.response.url.clone(),
                status: u16::try_from(e.response.status).unwrap_or(0),
                resource_type: wire_name(&e.r#type),
            })
        });

        let failures = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(browser_err)?;
        self.forward(failures, |e: &EventLoadingFailed| {
            Some(PageSignal::LoadingFailed {
                id: e.request_id.as_ref().to_string(),
                error: e.error_text.clone(),
            })
        });

        let navigations = self
            .page
            .event_listener::<EventFrameNavigated>()
            .await
            .map_err(browser_err)?;
        self.forward(navigations, |e: &EventFrameNavigated| {
            e.frame.parent_id.is_none().then(|| PageSignal::Navigated {
                url: e.frame.url.clone(),
            })
        });

        let bindings = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(browser_err)?;
        self.forward(bindings, |e: &EventBindingCalled| {
            if e.name != CONTROL_BINDING {
                return None;
            }
            match serde_json::from_str::<BindingPayload>(&e.payload) {
                Ok(payload) => Some(PageSignal::ControlCall {
                    id: payload.id,
                    call: payload.call,
                }),
                Err(err) => {
                    warn!(%err, "Malformed control binding payload");
                    None
                }
            }
        });

        let crashes = self
            .page
            .event_listener::<EventTargetCrashed>()
            .await
            .map_err(browser_err)?;
        self.forward(crashes, |_: &EventTargetCrashed| {
            Some(PageSignal::Crashed("page target crashed".to_string()))
        });

        // Frames are acknowledged here, before anyone looks at them, so the
        // browser never waits on observers.
        let mut frames = self
            .page
            .event_listener::<EventScreencastFrame>()
            .await
            .map_err(browser_err)?;
        let page = self.page.clone();
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.next() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = page
                            .execute(ScreencastFrameAckParams::new(frame.session_id))
                            .await
                        {
                            debug!(%e, "Screencast ack failed");
                        }
                        let data = serde_json::to_value(&frame.data)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string));
                        if let Some(data) = data {
                            if signals.send(PageSignal::Frame { data }).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl LivePage for ChromiumPage {
    async fn expose_control(&self, bridge_script: &str) -> Result<()> {
        self.page
            .execute(AddBindingParams::new(CONTROL_BINDING))
            .await
            .map_err(browser_err)?;
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(bridge_script))
            .await
            .map_err(browser_err)?;
        self.evaluate(bridge_script).await.map(|_| ())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await.map_err(browser_err)?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(script).await.map_err(browser_err)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn start_screencast(&self, config: &ScreencastConfig) -> Result<()> {
        let format = match config.format {
            ScreencastFormat::Jpeg => StartScreencastFormat::Jpeg,
            ScreencastFormat::Png => StartScreencastFormat::Png,
        };
        let params = StartScreencastParams {
            format: Some(format),
            quality: Some(i64::from(config.quality.min(100))),
            max_width: Some(i64::from(config.max_width)),
            max_height: Some(i64::from(config.max_height)),
            every_nth_frame: Some(i64::from(config.every_nth_frame.max(1))),
        };
        self.page.execute(params).await.map_err(browser_err)?;
        debug!(format = config.format.as_str(), "Screencast started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        let _ = self.page.execute(StopScreencastParams::default()).await;
        self.cancel.cancel();

        let browser = self.browser.lock().await.take();
        let Some(mut browser) = browser else {
            return Ok(());
        };
        if self.owned {
            browser.close().await.map_err(browser_err)?;
            if let Err(e) = browser.wait().await {
                debug!(%e, "Browser process did not exit cleanly");
            }
        }
        Ok(())
    }
}
