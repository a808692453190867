use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use orka_core::Object;
use orka_kubehub::KubeListerWatcher;
use orka_reflector::{Reflector, ReflectorConfig};
use orka_store::{Cache, Store, StoreEvent};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "orkactl", version, about = "Mirror Kubernetes collections into a local store")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List objects once the local mirror has synced
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Keep a local mirror in sync and print its changes until Ctrl-C
    Mirror {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Reflector name used in logs and metrics (default: the GVK key)
        #[arg(long = "name")]
        name: Option<String>,
        /// Force a full re-list this often; 0 disables
        #[arg(long = "resync-secs", env = "ORKA_RESYNC_SECS")]
        resync_secs: Option<u64>,
        /// Lower bound of the randomized watch timeout
        #[arg(long = "min-watch-timeout-secs", env = "ORKA_MIN_WATCH_TIMEOUT_SECS")]
        min_watch_timeout_secs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("ORKA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ORKA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ORKA_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let lw = KubeListerWatcher::for_gvk(&gvk, ns).await?;
            let expected = lw.expected_type();
            let cache = Arc::new(Cache::namespace_keyed());
            let reflector = Arc::new(Reflector::new(gvk.clone(), Arc::new(lw), expected, cache.clone(), ReflectorConfig::from_env()));
            let stop = CancellationToken::new();
            let handle = reflector.clone().run_until(stop.clone());

            // Wait for the first full sync (configurable)
            let wait_secs = std::env::var("ORKA_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
            let mut rx = cache.subscribe_epoch();
            let deadline = Instant::now() + Duration::from_secs(wait_secs);
            while *rx.borrow() == 0 {
                let now = Instant::now();
                if now >= deadline { break; }
                let rem = deadline.duration_since(now).min(Duration::from_secs(2));
                if tokio::time::timeout(rem, rx.changed()).await.is_err() { break; }
            }
            if cache.epoch() == 0 {
                warn!(gvk = %gvk, wait_secs, "no sync before deadline; output is empty");
            }

            let mut items = cache.list();
            items.sort_by_key(|o| (o.namespace().map(str::to_string), o.name().map(str::to_string)));
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE   NAME                 AGE");
                    for item in &items {
                        let ns_col = item.namespace().unwrap_or("-");
                        let age = render_age(creation_ts(item));
                        println!("{:<11} {:<20} {}", ns_col, item.name().unwrap_or(""), age);
                    }
                }
                Output::Json => {
                    let raw: Vec<&serde_json::Value> = items.iter().map(|o| o.raw()).collect();
                    println!("{}", serde_json::to_string_pretty(&raw)?);
                }
            }
            stop.cancel();
            handle.await?;
        }
        Commands::Mirror { gvk, name, resync_secs, min_watch_timeout_secs } => {
            info!(gvk = %gvk, ns = ?ns, "mirror invoked");
            let lw = KubeListerWatcher::for_gvk(&gvk, ns).await?;
            let expected = lw.expected_type();
            let mut config = ReflectorConfig::from_env();
            if let Some(s) = resync_secs {
                config = config.with_resync_period(Duration::from_secs(s));
            }
            if let Some(s) = min_watch_timeout_secs {
                config = config.with_min_watch_timeout(Duration::from_secs(s));
            }
            let cache = Arc::new(Cache::namespace_keyed());
            let mut events = cache.subscribe();
            let reflector = Arc::new(Reflector::new(name.unwrap_or_else(|| gvk.clone()), Arc::new(lw), expected, cache.clone(), config));
            let version = reflector.version_handle();
            let stop = CancellationToken::new();
            let handle = reflector.clone().run_until(stop.clone());

            let ctrl_c = signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        info!("interrupt received, stopping");
                        break;
                    }
                    ev = events.recv() => match ev {
                        Ok(ev) => print_event(&ev, &cache, cli.output)?,
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagging"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            stop.cancel();
            handle.await?;
            info!(gvk = %gvk, resource_version = %version.get(), items = cache.len(), "mirror stopped");
        }
    }

    Ok(())
}

fn print_event(ev: &StoreEvent, cache: &Cache, output: Output) -> Result<()> {
    match output {
        Output::Human => match ev {
            StoreEvent::Replaced { items, resource_version } => println!("= replaced {} items @{}", items, resource_version),
            StoreEvent::Added { key } => println!("+ {}", key),
            StoreEvent::Updated { key } => println!("~ {}", key),
            StoreEvent::Deleted { key } => println!("- {}", key),
        },
        Output::Json => {
            let line = match ev {
                StoreEvent::Replaced { items, resource_version } => {
                    serde_json::json!({ "event": "replaced", "items": items, "resourceVersion": resource_version })
                }
                StoreEvent::Added { key } | StoreEvent::Updated { key } => {
                    let kind = if matches!(ev, StoreEvent::Added { .. }) { "added" } else { "updated" };
                    let object = cache.get_by_key(key).map(|o| o.raw().clone());
                    serde_json::json!({ "event": kind, "key": key, "object": object })
                }
                StoreEvent::Deleted { key } => serde_json::json!({ "event": "deleted", "key": key }),
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

fn creation_ts(obj: &Object) -> i64 {
    obj.raw()
        .pointer("/metadata/creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_timestamp_is_parsed() {
        let obj = Object::new(serde_json::json!({ "metadata": { "name": "a", "creationTimestamp": "2024-01-02T03:04:05Z" } }));
        assert_eq!(creation_ts(&obj), 1_704_164_645);
        assert_eq!(creation_ts(&Object::new(serde_json::json!({ "metadata": { "name": "a" } }))), 0);
    }

    #[test]
    fn age_buckets() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(render_age(0), "-");
        assert_eq!(render_age(now - 2 * 86_400 - 3 * 3600), "2d3h");
        assert_eq!(render_age(now - 5 * 60), "5m");
    }

    #[test]
    fn cli_parses_mirror_flags() {
        let cli = Cli::try_parse_from(["orkactl", "--ns", "default", "mirror", "v1/ConfigMap", "--resync-secs", "30"]).unwrap();
        assert_eq!(cli.namespace.as_deref(), Some("default"));
        match cli.command {
            Commands::Mirror { gvk, resync_secs, .. } => {
                assert_eq!(gvk, "v1/ConfigMap");
                assert_eq!(resync_secs, Some(30));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
