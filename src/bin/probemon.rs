//! probemon CLI - attach to probes served by probemon processes
//!
//! # Usage
//!
//! ```text
//! probemon watch --class Stat --param pattern='router.*'   # print changes
//! probemon control --class Process refresh                  # run a control
//! probemon ping --port 42000                                # round-trip a ping
//! ```
//!
//! Targets default to `localhost` and the configured application name.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use probemon_core::{MonitorParams, ProbeClasses};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use probemond::config::ProbemonConfig;
use probemond::connection::ConnectionState;
use probemond::monitor::{Monitor, MonitorEvent};
use probemond::router::Router;
use probemond::stats::StatsHub;

/// App name this CLI advertises to peers
const CLI_APP_NAME: &str = "probemon-cli";

// ============================================================================
// CLI Arguments
// ============================================================================

/// probemon - watch and control remote probes
#[derive(Parser, Debug)]
#[command(name = "probemon", version, about)]
struct Args {
    /// Configuration file (defaults to $PROBEMON_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a monitor and print change events as JSON lines
    Watch {
        #[command(flatten)]
        target: Target,
    },
    /// Attach a monitor, invoke one control and print the result
    Control {
        #[command(flatten)]
        target: Target,

        /// Control name
        control: String,

        /// Control parameters as JSON
        #[arg(default_value = "null")]
        params: String,
    },
    /// Connect to one peer and round-trip connection:ping
    Ping {
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Port (defaults to the configured base port)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(ClapArgs, Debug)]
struct Target {
    /// Probe class to attach to
    #[arg(long, conflicts_with = "probe_name")]
    class: Option<String>,

    /// Configured probe name to attach to
    #[arg(long = "probe-name")]
    probe_name: Option<String>,

    /// Init parameter as key=value (value parsed as JSON when possible)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,

    /// Host running the probe
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Application running the probe (defaults to the configured app name)
    #[arg(long)]
    app: Option<String>,

    /// Application instance running the probe
    #[arg(long)]
    instance: Option<String>,
}

impl Target {
    fn monitor_params(&self, default_app: &str) -> Result<MonitorParams> {
        let mut params = match (&self.class, &self.probe_name) {
            (Some(class), _) => MonitorParams::class(class),
            (None, Some(name)) => MonitorParams::named(name),
            (None, None) => bail!("either --class or --probe-name is required"),
        };
        for (key, value) in &self.params {
            params = params.init_param(key, value.clone());
        }
        params = params
            .host(&self.host)
            .app(self.app.as_deref().unwrap_or(default_app));
        if let Some(instance) = &self.instance {
            params = params.instance(instance);
        }
        Ok(params)
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let config = ProbemonConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let target_app = config.app_name.clone();
    let router = Router::new(
        ProbemonConfig {
            app_name: CLI_APP_NAME.to_string(),
            app_instance: None,
            auto_start: Vec::new(),
            ..config
        },
        ProbeClasses::new(),
        StatsHub::new(),
    );

    let result = match args.command {
        Command::Watch { target } => watch(&router, target.monitor_params(&target_app)?).await,
        Command::Control {
            target,
            control: name,
            params,
        } => {
            let params: Value = serde_json::from_str(&params).context("Control parameters are not valid JSON")?;
            control(&router, target.monitor_params(&target_app)?, &name, params).await
        }
        Command::Ping { host, port } => {
            let port = port.unwrap_or(router.config().service_base_port);
            ping(&router, &host, port).await
        }
    };

    router.shutdown().await;
    result
}

async fn watch(router: &Router, params: MonitorParams) -> Result<()> {
    let monitor = Monitor::new(router, params);
    let mut events = monitor.subscribe();
    monitor.connect().await.context("Failed to connect monitor")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            received = events.recv() => match received {
                Ok(MonitorEvent::Change(changes)) => println!("{}", Value::Object(changes)),
                Ok(MonitorEvent::Connect) => debug!("Monitor connected"),
                Ok(MonitorEvent::Disconnect(kind)) => {
                    eprintln!("Monitor disconnected: {}", kind.as_str());
                    break;
                }
                Err(RecvError::Lagged(skipped)) => eprintln!("Skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    monitor.disconnect().await.context("Failed to disconnect monitor")?;
    Ok(())
}

async fn control(router: &Router, params: MonitorParams, name: &str, payload: Value) -> Result<()> {
    let monitor = Monitor::new(router, params);
    monitor.connect().await.context("Failed to connect monitor")?;

    let outcome = monitor.control(name, payload).await;
    monitor.disconnect().await.context("Failed to disconnect monitor")?;

    let result = outcome.with_context(|| format!("Control '{name}' failed"))?;
    println!("{result}");
    Ok(())
}

async fn ping(router: &Router, host: &str, port: u16) -> Result<()> {
    let conn = router.connect_to(host, port);
    let state = conn
        .wait_settled(router.config().connect_timeout() * 2)
        .await;
    if state != ConnectionState::Connected {
        bail!("Could not connect to {host}:{port} ({state})");
    }

    let started = tokio::time::Instant::now();
    let reply = conn.ping().await.context("Ping failed")?;
    let elapsed: Duration = started.elapsed();

    let peer = conn.remote_info();
    println!(
        "{}",
        json!({
            "reply": reply,
            "rtt_ms": elapsed.as_secs_f64() * 1000.0,
            "peer": peer,
        })
    );
    Ok(())
}
