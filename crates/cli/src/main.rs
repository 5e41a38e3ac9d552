use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use envwatch_api::ResourceService;
use envwatch_core::KindTag;
use envwatch_kubehub::{KubeService, KubeSpaceResolver};
use envwatch_registry::{CollectionState, Context, EnvironmentEntry, KindNode, Phase, Registry, RegistryConfig};
use envwatch_store::{LiveConfig, LiveHub};
use envwatch_views::TRACKED;
use serde::Serialize;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "envwatch", version, about = "Live per-environment resource summaries")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Serve Prometheus metrics on this host:port
    #[arg(long = "metrics-addr", env = "ENVWATCH_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the tracked views and the kinds they combine
    Kinds,
    /// One-shot list of a kind in a namespace
    List {
        /// Kind name or plural, e.g. "Pod" or "deploymentconfigs"
        kind: String,
        /// Kubernetes namespace
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
    /// Watch every environment of a space and print a line per change
    Watch {
        /// Space id (the namespace holding the environments ConfigMap)
        space: String,
        /// Only show resources whose `space` label matches (unlabelled ones always show)
        #[arg(long = "label")]
        label: Option<String>,
        /// Base URL of the cluster web console
        #[arg(long = "console-url", env = "ENVWATCH_CONSOLE_URL")]
        console_url: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("ENVWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics on `addr`; no address, no exporter.
fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    let sock: std::net::SocketAddr = addr.parse().with_context(|| format!("metrics address {addr:?} is not host:port"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .context("installing prometheus exporter")?;
    info!(addr = %sock, "Prometheus metrics exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = init_metrics(cli.metrics_addr.as_deref()) {
        warn!(error = %e, "metrics exporter disabled");
    }

    match cli.command {
        Commands::Kinds => print_kinds(cli.output)?,
        Commands::List { kind, namespace } => {
            let kind = KindTag::from_str(&kind)?;
            info!(kind = %kind, ns = %namespace, "list invoked");
            let client = envwatch_kubehub::client().await?;
            let items = KubeService::new(client, kind)
                .list(&namespace)
                .await
                .with_context(|| format!("listing {} in {}", kind.plural(), namespace))?;
            match cli.output {
                Output::Human => {
                    let now = Utc::now();
                    println!("{:<40} AGE", "NAME");
                    for r in items.iter() {
                        println!("{:<40} {}", r.name, render_age(r.creation_ts, now));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Watch { space, label, console_url } => {
            info!(space = %space, label = ?label, "watch invoked");
            let client = envwatch_kubehub::client().await?;
            let hub = Arc::new(LiveHub::new(envwatch_kubehub::services(client.clone()), LiveConfig::from_env()));
            let mut cfg = RegistryConfig::from_env();
            if console_url.is_some() {
                cfg.console_url = console_url;
            }
            let mut registry = Registry::new(hub, Arc::new(KubeSpaceResolver::new(client)), cfg);
            watch_space(&mut registry, Context::new(space, label), cli.output).await?;
        }
    }

    Ok(())
}

fn print_kinds(output: Output) -> Result<()> {
    #[derive(Serialize)]
    struct Row<'a> { title: &'a str, path: &'a str, inputs: &'a [KindTag] }
    match output {
        Output::Human => {
            println!("{:<12} {:<14} INPUTS", "TITLE", "PATH");
            for v in TRACKED.iter() {
                let inputs: Vec<_> = v.inputs.iter().map(|k| k.as_str()).collect();
                println!("{:<12} {:<14} {}", v.title, v.path, inputs.join(", "));
            }
        }
        Output::Json => {
            let rows: Vec<_> = TRACKED.iter().map(|v| Row { title: v.title, path: v.path, inputs: v.inputs }).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Line {
    environment: String,
    view: &'static str,
    console_url: Option<String>,
    #[serde(flatten)]
    state: CollectionState,
}

fn print_line(line: &Line, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            let suffix = if line.state.loading() { " (loading)" } else { "" };
            println!("{} • {}{}", line.environment, line.state.title, suffix);
        }
        Output::Json => println!("{}", serde_json::to_string(line)?),
    }
    Ok(())
}

fn spawn_printer(entry: &EnvironmentEntry, node: KindNode, tx: mpsc::Sender<Line>) -> JoinHandle<()> {
    let environment = entry.environment.name.clone();
    let console_url = entry.console_url.clone();
    tokio::spawn(async move {
        let mut rx = node.state.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            if state.phase != Phase::Unstarted {
                let line = Line { environment: environment.clone(), view: node.view.path, console_url: console_url.clone(), state };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

fn rewire(entries: &[EnvironmentEntry], tx: &mpsc::Sender<Line>, printers: &mut Vec<JoinHandle<()>>) {
    for p in printers.drain(..) {
        p.abort();
    }
    for entry in entries {
        for node in entry.kinds.iter() {
            printers.push(spawn_printer(entry, node.clone(), tx.clone()));
        }
    }
}

async fn watch_space(registry: &mut Registry, ctx: Context, output: Output) -> Result<()> {
    let mut notes = registry.notifications();
    let mut envs = registry.environments();
    registry.select(ctx).await;

    let (tx, mut rx) = mpsc::channel::<Line>(256);
    let mut printers = Vec::new();
    let current = envs.borrow_and_update().clone();
    rewire(&current, &tx, &mut printers);

    loop {
        tokio::select! {
            Some(line) = rx.recv() => print_line(&line, output)?,
            note = notes.recv() => match note {
                Ok(n) => eprintln!("warning: {}", n.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "notifications lagged"),
                Err(broadcast::error::RecvError::Closed) => {
                    error!("registry notifications closed");
                    break;
                }
            },
            changed = envs.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = envs.borrow_and_update().clone();
                if current.is_empty() && output == Output::Human {
                    println!("(no environments)");
                }
                rewire(&current, &tx, &mut printers);
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }

    for p in printers {
        p.abort();
    }
    registry.clear().await;
    warn!("watch loop ended (graceful shutdown)");
    Ok(())
}

/// Compact age of a resource created at `creation_ts` (epoch seconds), `-` when unknown.
fn render_age(creation_ts: i64, now: DateTime<Utc>) -> String {
    let Some(created) = DateTime::<Utc>::from_timestamp(creation_ts, 0).filter(|_| creation_ts > 0) else {
        return "-".to_string();
    };
    let age = now.signed_duration_since(created).max(chrono::Duration::zero());
    match (age.num_days(), age.num_hours() % 24, age.num_minutes() % 60) {
        (d, h, _) if d > 0 => format!("{}d{}h", d, h),
        (_, h, m) if h > 0 => format!("{}h{}m", h, m),
        (_, _, m) if m > 0 => format!("{}m", m),
        _ => format!("{}s", age.num_seconds()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_render_in_their_largest_units() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let ts = now.timestamp();
        assert_eq!(render_age(0, now), "-");
        assert_eq!(render_age(ts - 42, now), "42s");
        assert_eq!(render_age(ts - 5 * 60 - 7, now), "5m");
        assert_eq!(render_age(ts - 3 * 3600 - 120, now), "3h2m");
        assert_eq!(render_age(ts - 2 * 86_400 - 5 * 3600, now), "2d5h");
        assert_eq!(render_age(ts + 30, now), "0s", "clock skew never renders negative ages");
    }
}
