//! Runs the real in-page overlay inside Chromium.
//!
//! Run with: `cargo test -p webeval-browser --features browser --test overlay_chromium -- --ignored`
#![cfg(feature = "browser")]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use webeval_browser::ChromiumDriver;
use webeval_browser::driver::{BrowserDriver, LivePage, SignalReceiver};
use webeval_browser::overlay::{InjectOutcome, InjectionState, OverlayInjector};
use webeval_core::config::{BrowserConfig, OverlayConfig};
use webeval_core::error::WebEvalError;

/// A page whose element under the overlay is `#target`, a shadow host with a
/// full-viewport `#inner` inside its open shadow root.
const FIXTURE: &str = r#"
(() => {
  document.body.innerHTML = "";
  const target = document.createElement("div");
  target.id = "target";
  target.style.cssText = "position: fixed; inset: 0";
  const root = target.attachShadow({ mode: "open" });
  root.innerHTML = '<span id="inner" style="display: block; position: fixed; inset: 0"></span>';
  document.body.appendChild(target);
  return true;
})()
"#;

/// Center of the overlay host, where its controls sit.
const OVERLAY_POINT: &str = r#"
(() => {
  const host = document.querySelector("webeval-overlay");
  const rect = host.getBoundingClientRect();
  return { x: rect.left + rect.width / 2, y: rect.top + rect.height / 2, w: rect.width, h: rect.height };
})()
"#;

async fn launch() -> Option<(Arc<dyn LivePage>, SignalReceiver)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = BrowserConfig {
        headless: true,
        ..BrowserConfig::default()
    };
    match ChromiumDriver::new().launch(&config, tx).await {
        Ok(page) => Some((page, rx)),
        Err(e) => {
            eprintln!("Skipping test: {e}");
            None
        }
    }
}

async fn eval(page: &Arc<dyn LivePage>, script: &str) -> Value {
    page.evaluate(script).await.unwrap()
}

fn overlay_config() -> OverlayConfig {
    OverlayConfig {
        stacking_window_ms: 10_000,
        ..OverlayConfig::default()
    }
}

#[tokio::test]
#[ignore] // Requires Chrome/Chromium to be installed
async fn test_failed_setup_releases_guard_and_retry_succeeds() {
    let Some((page, _signals)) = launch().await else {
        return;
    };
    page.goto("about:blank").await.unwrap();
    eval(&page, FIXTURE).await;

    // Fail after the hit-test patches and the host are in place.
    eval(
        &page,
        r#"
        window.__savedObserver = window.MutationObserver;
        window.MutationObserver = function () { throw new Error("observer unavailable"); };
        true
        "#,
    )
    .await;

    let injector = OverlayInjector::new(&overlay_config());
    let err = injector.inject(page.as_ref()).await.unwrap_err();
    assert!(matches!(err, WebEvalError::InjectionFailure(_)));
    assert!(matches!(
        injector.state(),
        InjectionState::Failed { attempts: 1, .. }
    ));

    let leftovers = eval(
        &page,
        r#"
        ({
          guard: "__webevalOverlay" in window,
          host: document.querySelector("webeval-overlay") !== null,
          documentPatched: !Document.prototype.elementFromPoint.toString().includes("[native code]"),
          shadowPatched: !ShadowRoot.prototype.elementsFromPoint.toString().includes("[native code]"),
        })
        "#,
    )
    .await;
    assert_eq!(
        leftovers,
        json!({ "guard": false, "host": false, "documentPatched": false, "shadowPatched": false })
    );

    eval(
        &page,
        "window.MutationObserver = window.__savedObserver; true",
    )
    .await;
    let outcome = injector.inject(page.as_ref()).await.unwrap();
    assert_eq!(outcome, InjectOutcome::Injected);
    assert_eq!(
        injector.state(),
        InjectionState::Injected {
            generation: injector.generation()
        }
    );
    assert_eq!(
        eval(&page, "window.__webevalOverlay.status").await,
        json!("ready")
    );

    // The page-side guard still holds if the Rust side forgets the document.
    injector.navigated();
    let outcome = injector.inject(page.as_ref()).await.unwrap();
    assert_eq!(outcome, InjectOutcome::AlreadyPresent);
    assert_eq!(
        eval(&page, r#"document.querySelectorAll("webeval-overlay").length"#).await,
        json!(1)
    );

    page.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Chrome/Chromium to be installed
async fn test_point_lookups_see_through_overlay() {
    let Some((page, _signals)) = launch().await else {
        return;
    };
    page.goto("about:blank").await.unwrap();
    eval(&page, FIXTURE).await;

    let injector = OverlayInjector::new(&overlay_config());
    assert_eq!(
        injector.inject(page.as_ref()).await.unwrap(),
        InjectOutcome::Injected
    );

    let point = eval(&page, OVERLAY_POINT).await;
    assert!(point["w"].as_f64().unwrap() > 0.0);
    assert!(point["h"].as_f64().unwrap() > 0.0);
    let (x, y) = (point["x"].as_f64().unwrap(), point["y"].as_f64().unwrap());

    let seen = eval(
        &page,
        &format!(
            r#"
            (() => {{
              const host = document.querySelector("webeval-overlay");
              const target = document.getElementById("target");
              const single = document.elementFromPoint({x}, {y});
              const many = document.elementsFromPoint({x}, {y});
              const inner = target.shadowRoot.elementFromPoint({x}, {y});
              return {{
                single: single && single.id,
                hostInList: many.includes(host),
                firstInList: many[0] && many[0].id,
                inner: inner && inner.id,
                pointerEvents: host.style.pointerEvents,
              }};
            }})()
            "#
        ),
    )
    .await;
    assert_eq!(seen["single"], "target");
    assert_eq!(seen["hostInList"], false);
    assert_eq!(seen["firstInList"], "target");
    assert_eq!(seen["inner"], "inner");
    // Suppression is released once the lookups return.
    assert_eq!(seen["pointerEvents"], "");

    // Both lookup entry points are wrapped while the overlay is installed.
    let patched = eval(
        &page,
        r#"[Document.prototype.elementFromPoint, Document.prototype.elementsFromPoint,
            ShadowRoot.prototype.elementFromPoint, ShadowRoot.prototype.elementsFromPoint]
            .every((f) => !f.toString().includes("[native code]"))"#,
    )
    .await;
    assert_eq!(patched, json!(true));

    page.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Chrome/Chromium to be installed
async fn test_host_stays_above_highlight_layer() {
    let Some((page, _signals)) = launch().await else {
        return;
    };
    page.goto("about:blank").await.unwrap();
    eval(&page, FIXTURE).await;

    let injector = OverlayInjector::new(&overlay_config());
    injector.inject(page.as_ref()).await.unwrap();

    eval(
        &page,
        r#"
        (() => {
          const layer = document.createElement("div");
          layer.id = "playwright-highlight-container";
          document.documentElement.appendChild(layer);
          return true;
        })()
        "#,
    )
    .await;

    // The observer callback runs after the inserting script returns.
    let mut on_top = Value::Null;
    for _ in 0..20 {
        on_top = eval(
            &page,
            r#"document.documentElement.lastElementChild === document.querySelector("webeval-overlay")"#,
        )
        .await;
        if on_top == json!(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(on_top, json!(true));

    page.close().await.unwrap();
}
