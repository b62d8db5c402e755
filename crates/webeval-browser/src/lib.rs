//! Browser session lifecycle, page event capture, screencast and the in-page overlay.
//!
//! The Chromium driver requires the `browser` feature flag and Chrome/Chromium
//! installed (or a DevTools endpoint in `browser.cdp_url`).

pub mod capture;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod driver;
pub mod overlay;
pub mod screencast;
pub mod session;

#[cfg(feature = "browser")]
pub use chromium::ChromiumDriver;
pub use driver::{BrowserDriver, LivePage, PageSignal};
pub use session::{BrowserSession, SessionHandle, StartOptions};
