use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use webeval_browser::{BrowserSession, ChromiumDriver, StartOptions};
use webeval_core::config::{
    BrowserConfig, Config, ControlConfig, DashboardConfig, EventsConfig, LoggingConfig,
    OverlayConfig,
};
use webeval_core::control::Phase;
use webeval_gateway::DashboardState;

#[derive(Parser)]
#[command(
    name = "webeval",
    about = "Watch and steer browser automation runs from a live dashboard",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a page under observation and serve the dashboard until stopped
    Watch {
        /// Page to open
        #[arg(long)]
        url: String,

        /// Task description recorded in the report
        #[arg(long)]
        task: Option<String>,

        /// Dashboard port (default: 5009)
        #[arg(long)]
        port: Option<u16>,

        /// Serve only /ws and /health, without the dashboard page
        #[arg(long)]
        no_ui: bool,

        /// Open the dashboard in the default browser
        #[arg(long)]
        open: bool,
    },

    /// Serve the dashboard without starting a session.
    ///
    /// Nothing starts a session in this mode: the dashboard shows "no
    /// session" and every control command is answered with a `no_session`
    /// ack. Useful for checking the port, the UI build and `/health`; use
    /// `watch` to observe a run.
    Dashboard {
        /// Dashboard port (default: 5009)
        #[arg(long)]
        port: Option<u16>,

        /// Serve only /ws and /health, without the dashboard page
        #[arg(long)]
        no_ui: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let mut filter = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    for directive in &logging.filters {
        filter.push(',');
        filter.push_str(directive);
    }
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));

    // Logs go to stderr so a printed report stays clean on stdout.
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Every section spelled out with its default, as a starting point for editing.
fn starter_config() -> Config {
    let defaults = Config::default();
    Config {
        browser: Some(BrowserConfig::default()),
        control: Some(ControlConfig {
            poll_interval_ms: Some(defaults.poll_interval().as_millis() as u64),
        }),
        events: Some(EventsConfig {
            retention_cap: Some(defaults.retention_cap()),
            hide_static_assets: Some(defaults.hide_static_assets()),
        }),
        overlay: Some(OverlayConfig::default()),
        dashboard: Some(DashboardConfig::default()),
        logging: Some(LoggingConfig {
            format: "plain".into(),
            ..LoggingConfig::default()
        }),
    }
}

/// Spawn the dashboard server; returns its task and shutdown token.
fn spawn_dashboard(
    state: Arc<DashboardState>,
    port: u16,
    ui: bool,
) -> (tokio::task::JoinHandle<()>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = webeval_gateway::start_dashboard(state, port, ui, token).await {
            tracing::error!(%e, "Dashboard server failed");
        }
    });
    (task, shutdown)
}

fn open_dashboard(config: &Config, port: u16) {
    let url = format!("http://{}:{port}/", config.dashboard_bind());
    if let Err(e) = webbrowser::open(&url) {
        tracing::warn!(%e, %url, "Could not open the dashboard in a browser");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Watch {
            url,
            task,
            port,
            no_ui,
            open,
        } => {
            let config = Arc::new(config);
            let port = port.unwrap_or_else(|| config.dashboard_port());
            let ui = config.dashboard().ui && !no_ui;

            let sessions = Arc::new(BrowserSession::new(
                Arc::new(ChromiumDriver::new()),
                config.clone(),
            ));
            let state = Arc::new(DashboardState::new(sessions.clone()));
            let (server, shutdown) = spawn_dashboard(state, port, ui);
            if ui && (open || config.dashboard().open_browser) {
                open_dashboard(&config, port);
            }

            let handle = match sessions.start(&url, StartOptions { task }).await {
                Ok(handle) => handle,
                Err(e) => {
                    shutdown.cancel();
                    let _ = server.await;
                    return Err(e.into());
                }
            };
            tracing::info!(session_id = %handle.id(), "Watching {url}, stop from the dashboard or press Ctrl-C");

            let mut control = handle.control().subscribe();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
                _ = control.wait_for(|s| s.phase == Phase::Stopped) => {
                    tracing::info!("Session stopped");
                }
            }

            let report = handle.teardown().await;
            println!("{}", report.render());

            shutdown.cancel();
            let _ = server.await;
        }
        Commands::Dashboard { port, no_ui } => {
            let config = Arc::new(config);
            let port = port.unwrap_or_else(|| config.dashboard_port());
            let ui = config.dashboard().ui && !no_ui;

            let sessions = Arc::new(BrowserSession::new(
                Arc::new(ChromiumDriver::new()),
                config.clone(),
            ));
            let state = Arc::new(DashboardState::new(sessions));
            tracing::info!("Serving the dashboard without a session, use `webeval watch` to observe a run");
            if ui && config.dashboard().open_browser {
                open_dashboard(&config, port);
            }
            webeval_gateway::start_dashboard(state, port, ui, CancellationToken::new()).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!(
                        "{} has {} error(s)",
                        config_path.display(),
                        errors.len()
                    );
                }
                println!("{} is valid", config_path.display());
            }
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        config_path.display()
                    );
                }
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                starter_config().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
    }

    Ok(())
}
