use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use relay_agent::config::{self, AgentConfig, normalize_addr};
use relay_agent::server::{self, AppState};
use relay_agent::{HealthChecker, MainProcess, MessageRouter, SessionRegistry, reverse};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    cli.common.init_logging()?;

    let config = cli.resolve_config()?;
    debug!("resolved config: {:#?}", config);

    if cli.print_config {
        let text = toml::to_string_pretty(&config).context("serializing config to TOML")?;
        print!("{text}");
        return Ok(());
    }

    async_main(config)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Relay agent - exec and attach bridge for containers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    /// Listen address (":PORT" means all interfaces)
    #[arg(long, env = "RELAY_AGENT_ADDR", value_name = "HOST:PORT")]
    addr: Option<String>,

    /// Bearer token clients must present; empty disables auth
    #[arg(long, env = "RELAY_AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Spawn and supervise a main process (the trailing ARGS)
    #[arg(long)]
    keep_alive: bool,

    /// Dial this URL instead of listening (reverse mode)
    #[arg(long, env = "RELAY_AGENT_CALLBACK_URL", value_name = "URL")]
    callback: Option<String>,

    /// Extra KEY=VALUE for the main process environment (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    #[command(flatten)]
    health: HealthOpts,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Main process command line
    #[arg(last = true, value_name = "ARGS")]
    args: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct HealthOpts {
    /// Health probe run through /bin/sh -c
    #[arg(long = "health-cmd", value_name = "COMMAND")]
    cmd: Option<String>,
    /// Milliseconds between probes
    #[arg(long = "health-interval", value_name = "MS")]
    interval: Option<u64>,
    /// Milliseconds before a probe is killed
    #[arg(long = "health-timeout", value_name = "MS")]
    timeout: Option<u64>,
    /// Milliseconds to wait before the first probe
    #[arg(long = "health-start-period", value_name = "MS")]
    start_period: Option<u64>,
    /// Consecutive failures before unhealthy
    #[arg(long = "health-retries")]
    retries: Option<u32>,
}

impl CommonOpts {
    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.quiet {
            log::set_max_level(LevelFilter::Error);
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("relay_agent={level}")));

        if self.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else if self.trace {
            LevelFilter::Trace
        } else if self.debug {
            LevelFilter::Debug
        } else {
            match self.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

impl Cli {
    /// Config file and environment, then flags on top.
    fn resolve_config(&self) -> Result<AgentConfig> {
        let path = match &self.common.config {
            Some(path) => Some(path.clone()),
            None => config::default_config_path(),
        };
        let mut config = match &path {
            Some(path) => AgentConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => AgentConfig::default(),
        };

        if let Some(addr) = &self.addr {
            config.server.addr = normalize_addr(addr);
        }
        if let Some(token) = &self.token {
            config.server.token = token.clone();
        }
        if self.keep_alive {
            config.main_process.keep_alive = true;
        }
        if !self.args.is_empty() {
            config.main_process.args = self.args.clone();
        }
        config.main_process.env.extend(self.env.iter().cloned());
        if let Some(url) = &self.callback {
            config.reverse.callback_url = url.clone();
        }

        let health = &mut config.healthcheck;
        if let Some(cmd) = &self.health.cmd {
            health.test = vec!["CMD-SHELL".to_string(), cmd.clone()];
        }
        if let Some(ms) = self.health.interval {
            health.interval_ms = ms;
        }
        if let Some(ms) = self.health.timeout {
            health.timeout_ms = ms;
        }
        if let Some(ms) = self.health.start_period {
            health.start_period_ms = ms;
        }
        if let Some(retries) = self.health.retries {
            health.retries = retries;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn async_main(config: AgentConfig) -> Result<()> {
    let main = if config.main_process.keep_alive {
        let main = MainProcess::spawn(&config.main_process.args, &config.main_process.env)
            .context("starting main process")?;
        if server::is_init_process() {
            server::spawn_reaper().context("installing SIGCHLD handler")?;
            info!("running as PID 1; reaping orphaned children");
        }
        Some(main)
    } else {
        None
    };

    let health = config.healthcheck().map(|hc| {
        let checker = HealthChecker::new(hc);
        checker.start();
        checker
    });

    let router = Arc::new(MessageRouter::new(
        Arc::new(SessionRegistry::new()),
        main,
        health,
    ));

    if let Some(options) = config.reverse_options() {
        info!("reverse mode: dialing {}", options.callback_url);
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            server::shutdown_signal().await;
            trigger.cancel();
        });

        let result = reverse::run(options, router.clone(), shutdown).await;
        server::shutdown_sessions(&router).await;
        return result.context("reverse connection");
    }

    let listener = TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("binding to {}", config.server.addr))?;
    if config.server.token.is_empty() {
        warn!("no token configured; authentication is disabled");
    }

    server::serve(
        listener,
        AppState::new(router, config.server.token.clone()),
        server::shutdown_signal(),
    )
    .await
    .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}
