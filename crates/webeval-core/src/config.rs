//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level webeval configuration.
///
/// Every section is optional; accessors fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard: Option<DashboardConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

/// Browser automation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Path to Chrome/Chromium binary (auto-detected if omitted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,

    /// Run in headless mode (default: true).
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Attach to an already running browser over CDP instead of launching one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdp_url: Option<String>,

    /// Page operation timeout in ms (default: 30000).
    #[serde(default = "default_browser_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,

    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,

    #[serde(default)]
    pub screencast: ScreencastConfig,
}

fn default_browser_timeout() -> u64 {
    30_000
}

fn default_viewport_width() -> u32 {
    1280
}

fn default_viewport_height() -> u32 {
    800
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            cdp_url: None,
            timeout_ms: default_browser_timeout(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            screencast: ScreencastConfig::default(),
        }
    }
}

impl BrowserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreencastFormat {
    #[default]
    Jpeg,
    Png,
}

impl ScreencastFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }
}

/// CDP screencast parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreencastConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub format: ScreencastFormat,

    /// Compression quality 0-100 (jpeg only, default: 80).
    #[serde(default = "default_screencast_quality")]
    pub quality: u32,

    #[serde(default = "default_screencast_max_width")]
    pub max_width: u32,

    #[serde(default = "default_screencast_max_height")]
    pub max_height: u32,

    /// Capture every Nth frame (default: 1).
    #[serde(default = "default_every_nth_frame")]
    pub every_nth_frame: u32,
}

fn default_screencast_quality() -> u32 {
    80
}

fn default_screencast_max_width() -> u32 {
    1920
}

fn default_screencast_max_height() -> u32 {
    1080
}

fn default_every_nth_frame() -> u32 {
    1
}

impl Default for ScreencastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: ScreencastFormat::default(),
            quality: default_screencast_quality(),
            max_width: default_screencast_max_width(),
            max_height: default_screencast_max_height(),
            every_nth_frame: default_every_nth_frame(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Upper bound between phase re-checks while the agent loop is paused (default: 250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Maximum events retained per session before the oldest are truncated (default: 10000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_cap: Option<usize>,

    /// Hide successful static-asset requests from the default view.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide_static_assets: Option<bool>,
}

/// In-page overlay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the overlay polls `getAgentState()` (default: 1000, max: 1000).
    #[serde(default = "default_state_poll_ms")]
    pub state_poll_ms: u64,

    /// How long the stacking fix watches for the highlight container (default: 5000).
    #[serde(default = "default_stacking_window_ms")]
    pub stacking_window_ms: u64,

    /// Injection attempts after a navigation (default: 3).
    #[serde(default = "default_reinject_attempts")]
    pub reinject_attempts: u32,

    /// Delay before each re-injection attempt (default: 500).
    #[serde(default = "default_reinject_delay_ms")]
    pub reinject_delay_ms: u64,
}

fn default_state_poll_ms() -> u64 {
    1000
}

fn default_stacking_window_ms() -> u64 {
    5000
}

fn default_reinject_attempts() -> u32 {
    3
}

fn default_reinject_delay_ms() -> u64 {
    500
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_poll_ms: default_state_poll_ms(),
            stacking_window_ms: default_stacking_window_ms(),
            reinject_attempts: default_reinject_attempts(),
            reinject_delay_ms: default_reinject_delay_ms(),
        }
    }
}

/// Dashboard server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Serve the embedded dashboard UI at `/` (default: true).
    #[serde(default = "default_true")]
    pub ui: bool,

    /// Open the dashboard in the default browser on startup.
    #[serde(default)]
    pub open_browser: bool,
}

fn default_port() -> u16 {
    5009
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            ui: true,
            open_browser: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "webeval_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted)
            .map_err(|e| crate::error::WebEvalError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn browser(&self) -> BrowserConfig {
        self.browser.clone().unwrap_or_default()
    }

    pub fn overlay(&self) -> OverlayConfig {
        self.overlay.clone().unwrap_or_default()
    }

    pub fn dashboard(&self) -> DashboardConfig {
        self.dashboard.clone().unwrap_or_default()
    }

    pub fn dashboard_port(&self) -> u16 {
        self.dashboard.as_ref().map(|d| d.port).unwrap_or(5009)
    }

    pub fn dashboard_bind(&self) -> String {
        self.dashboard
            .as_ref()
            .and_then(|d| d.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn poll_interval(&self) -> Duration {
        let ms = self
            .control
            .as_ref()
            .and_then(|c| c.poll_interval_ms)
            .unwrap_or(250);
        Duration::from_millis(ms.max(1))
    }

    pub fn retention_cap(&self) -> usize {
        self.events
            .as_ref()
            .and_then(|e| e.retention_cap)
            .unwrap_or(10_000)
    }

    pub fn hide_static_assets(&self) -> bool {
        self.events
            .as_ref()
            .and_then(|e| e.hide_static_assets)
            .unwrap_or(true)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(browser) = &self.browser {
            if let Some(path) = &browser.chrome_path {
                if !Path::new(path).exists() {
                    errors.push(format!("Chrome binary not found: {path}"));
                }
            }
            if browser.cdp_url.is_some() && browser.chrome_path.is_some() {
                warnings.push("browser.cdp_url is set, browser.chrome_path will be ignored".into());
            }
            if browser.screencast.quality > 100 {
                errors.push(format!(
                    "Screencast quality must be 0-100, got {}",
                    browser.screencast.quality
                ));
            }
        }

        if let Some(overlay) = &self.overlay {
            if overlay.state_poll_ms > 1000 {
                warnings.push(format!(
                    "overlay.state_poll_ms is {}; the overlay may lag the dashboard by more than 1s",
                    overlay.state_poll_ms
                ));
            }
            if overlay.state_poll_ms == 0 {
                errors.push("overlay.state_poll_ms cannot be 0".to_string());
            }
        }

        if self.retention_cap() == 0 {
            errors.push("events.retention_cap cannot be 0".to_string());
        }

        if let Some(dash) = &self.dashboard {
            if dash.port == 0 {
                errors.push("Dashboard port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for webeval data: `~/.webeval/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webeval")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_WE_CDP", "ws://127.0.0.1:9222") };
        let input = r#"{"url": "${TEST_WE_CDP}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("ws://127.0.0.1:9222"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_WE_CDP") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_WE_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dashboard_port(), 5009);
        assert_eq!(config.dashboard_bind(), "127.0.0.1");
        assert_eq!(config.retention_cap(), 10_000);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(config.hide_static_assets());
        assert!(config.browser().headless);
        assert_eq!(config.overlay().state_poll_ms, 1000);
    }

    #[test]
    fn test_load_json5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in json5
                browser: { headless: false, screencast: { format: "png" } },
                events: { retention_cap: 50 },
                dashboard: { port: 7001 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.browser().headless);
        assert_eq!(config.browser().screencast.format, ScreencastFormat::Png);
        assert_eq!(config.browser().screencast.quality, 80);
        assert_eq!(config.retention_cap(), 50);
        assert_eq!(config.dashboard_port(), 7001);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/definitely/not/here.json")).unwrap();
        assert!(config.browser.is_none());
    }

    #[test]
    fn test_load_invalid_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ browser: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.error_code(), "config_error");
    }

    #[test]
    fn test_validate() {
        let config = Config {
            overlay: Some(OverlayConfig {
                state_poll_ms: 2500,
                ..Default::default()
            }),
            dashboard: Some(DashboardConfig {
                port: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (warnings, errors) = config.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(errors, vec!["Dashboard port cannot be 0".to_string()]);
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            events: Some(EventsConfig {
                retention_cap: Some(42),
                hide_static_assets: Some(false),
            }),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.retention_cap(), 42);
        assert!(!loaded.hide_static_assets());
    }
}
