//! Headless FRTM Proxy.
//!
//! Starts the interception engine and prints every completed flow that
//! matches an optional search query.
//!
//! Usage:
//! ```
//! cargo run --bin frtmproxy_headless -- --port 8080 --filter "host:api.example.com status:>=400"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use frtmproxy_core::api::{default_storage_dir, resolve_log_level, ControlPlane};
use frtmproxy_core::models::{Flow, TrafficProfile};
use frtmproxy_core::query::FlowQuery;
use frtmproxy_core::storage::FlowChange;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::FmtSubscriber;

struct Options {
    storage_path: Option<PathBuf>,
    port: Option<u16>,
    engine: Option<PathBuf>,
    addon: Option<PathBuf>,
    hosts: Vec<String>,
    traffic: Option<String>,
    filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let options = parse_args();

    let plane = Arc::new(ControlPlane::open(
        options.storage_path.clone().or_else(default_storage_dir),
    )?);

    let mut settings = plane.settings();
    if let Some(port) = options.port {
        settings.port = port;
    }
    if let Some(engine) = &options.engine {
        settings.engine_path = Some(engine.clone());
    }
    if let Some(addon) = &options.addon {
        settings.addon_script = Some(addon.clone());
    }
    if !options.hosts.is_empty() {
        settings.pinned_hosts = options.hosts.clone();
        settings.restrict_to_pinned_hosts = true;
    }
    plane.apply_settings(settings)?;

    let query = FlowQuery::parse(&options.filter);
    let mut changes = plane.flows().subscribe();
    let mut running = plane.supervisor().subscribe_running();

    plane.start_proxy().await?;
    tracing::info!(
        "Proxy listening on port {} (engine pid {:?})",
        plane.settings().port,
        plane.supervisor().pid()
    );

    if let Some(id) = &options.traffic {
        match TrafficProfile::preset_by_id(id) {
            Some(profile) => {
                plane.apply_traffic_profile(profile);
            }
            None => tracing::warn!("Unknown traffic profile {:?}", id),
        }
    }

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(FlowChange::Upserted(id)) => {
                    if let Some(flow) = plane.flows().get(&id) {
                        if flow.response.is_some() && query.matches(&flow) {
                            println!("{}", summary(&flow));
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Output fell behind, skipped {} changes", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            result = running.changed() => {
                if result.is_err() || !*running.borrow() {
                    tracing::warn!("Engine is no longer running");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping proxy");
                break;
            }
        }
    }

    let shutdown = Arc::clone(&plane);
    tokio::task::spawn_blocking(move || shutdown.shutdown()).await?;
    Ok(())
}

fn summary(flow: &Flow) -> String {
    let status = flow
        .status()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "---".to_string());
    let client = flow
        .client
        .as_ref()
        .map(|c| c.ip.as_str())
        .unwrap_or("-");
    format!("{} {:<7} {} ({})", status, flow.method(), flow.url(), client)
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(resolve_log_level())
        // stdout carries the flow listing
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_args() -> Options {
    let mut args = std::env::args().skip(1);
    let mut options = Options {
        storage_path: None,
        port: None,
        engine: None,
        addon: None,
        hosts: Vec::new(),
        traffic: None,
        filter: String::new(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--storage-path" => options.storage_path = args.next().map(PathBuf::from),
            "--port" => match args.next().map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => options.port = Some(port),
                _ => eprintln!("--port expects a number between 1 and 65535"),
            },
            "--engine" => options.engine = args.next().map(PathBuf::from),
            "--addon" => options.addon = args.next().map(PathBuf::from),
            "--allow-host" => options.hosts.extend(args.next()),
            "--traffic" => options.traffic = args.next(),
            "--filter" => options.filter = args.next().unwrap_or_default(),
            "--help" | "-h" => {
                eprintln!("FRTM Proxy (headless)");
                eprintln!();
                eprintln!("Usage: frtmproxy_headless [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --storage-path <PATH>  Settings, rules and logs (default: platform data dir)");
                eprintln!("  --port <PORT>          Listen port (default: 8080)");
                eprintln!("  --engine <PATH>        Engine executable (default: $FRTM_ENGINE_PATH or mitmdump on PATH)");
                eprintln!("  --addon <PATH>         Bridge addon script passed with -s");
                eprintln!("  --allow-host <HOST>    Only intercept HOST and its subdomains (repeatable)");
                eprintln!("  --traffic <PRESET>     Traffic profile: edge, 3g, lte, lossy-wifi");
                eprintln!("  --filter <QUERY>       Only print flows matching QUERY");
                eprintln!("  --help, -h             Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    options
}
