// controller: Scans the test LAN for idle drones and reports what it finds.
//
// Group orchestration is driven through the library API by test harnesses;
// this binary is the operator's cabling check.

use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "controller starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => controller::config::load_config_from_path(std::path::Path::new(&path)),
        None => controller::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(multicast = %cfg.network.multicast_addr, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if cfg.network.source_addr.is_none() {
        warn!(
            "no source address configured; if drones cannot be reached, set \
             network.source_addr to a locally configured address on the drone \
             LAN (drones must reach it via unicast)"
        );
    }

    let host = match controller::Host::bind(cfg.host_config()) {
        Ok(host) => host,
        Err(e) => {
            eprintln!("FATAL: failed to bind controller socket: {e}");
            std::process::exit(1);
        }
    };

    info!(uniqueid = host.uniqueid(), "scanning for idle drones");
    match host
        .whois(ud_protocol::GROUP_DEFAULT, None, None, None)
        .await
    {
        Ok(idle) if idle.is_empty() => info!("no idle drones found"),
        Ok(idle) => info!(count = idle.len(), drones = ?idle, "idle drones found"),
        Err(e) => warn!(error = %e, "discovery failed"),
    }

    host.disband(None).await;
}
