//! Client Guard Daemon
//!
//! Runs a guard against an in-process document and reports what it enforces.

use clap::Parser;
use client_guard::{AlertPriority, ClientGuard, Dom, GuardConfig, MemoryDocument};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "client-guard", about = "Poll the opacity authority and enforce the overlay")]
struct Cli {
    /// TOML file with api_key, project_slug, heading, message and api_url
    #[arg(short, long)]
    config: PathBuf,

    /// Poll once, print the enforced state and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = GuardConfig::load(&cli.config)?;

    let doc = Arc::new(MemoryDocument::new());
    let guard = ClientGuard::activate(config, doc.clone())?;
    let mut state_rx = guard.subscribe();

    if cli.once {
        guard.refresh().await;
        let state = guard.state();
        println!(
            "opacity={} critical={} tier={:?}",
            state.opacity(),
            state.critical,
            state.tier()
        );
        if let Some(node) = doc.get_element_by_id(guard.overlay_id()) {
            println!("overlay #{}", guard.overlay_id());
            println!("  style: {}", doc.attribute(node, "style").unwrap_or_default());
            println!("  html:  {}", doc.inner_html(node).unwrap_or_default());
        }
        guard.shutdown();
        return Ok(());
    }

    info!("🚀 Client guard running (Ctrl+C to stop)");

    let alerts = guard.tamper_alerts();
    let mut stats = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if state.critical {
                    warn!("⛔ OVERDUE: opacity={:.2}, page blocked", state.opacity());
                } else {
                    info!("🔄 opacity={:.2} tier={:?}", state.opacity(), state.tier());
                }
            },

            _ = stats.tick() => {
                let p0 = alerts.count_by_priority(AlertPriority::Critical);
                let p1 = alerts.count_by_priority(AlertPriority::Warning);
                if p0 > 0 || p1 > 0 {
                    info!("📊 Tamper stats: P0={}, P1={}", p0, p1);
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    guard.shutdown();
    info!("Client guard stopped");

    Ok(())
}
