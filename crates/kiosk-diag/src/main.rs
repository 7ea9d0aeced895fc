//! Kiosk Diagnostics - Main Entry Point
//!
//! Usage: `kiosk-diag [config.toml]`

use kiosk_diag::{init_logging, ConnectRequest, DiagConfig, DiagnosticService};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = DiagConfig::load(path.as_deref())?;
    init_logging(&config.logging);

    info!("=== Kiosk Diagnostics v{} ===", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = config.metrics_listen {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let service = DiagnosticService::new(config)?;
    let connected = service.connect(ConnectRequest::default()).await;
    if !connected.success {
        anyhow::bail!(
            "Adapter connect failed: {}",
            connected.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    info!(
        "Connected to {} ({:?})",
        connected.adapter.as_deref().unwrap_or("unidentified adapter"),
        connected.protocol
    );

    let check = service.self_check().await;
    info!("Self-check: {}", serde_json::to_string(&check)?);
    let status = service.read_status().await;
    info!("Status: {}", serde_json::to_string(&status)?);
    let codes = service.read_dtc().await;
    match (&codes.data, &codes.message) {
        (Some(codes), _) if codes.is_empty() => info!("No stored trouble codes"),
        (Some(codes), _) => {
            for dtc in codes {
                warn!("{} [{:?}] {}", dtc.code, dtc.severity, dtc.description);
            }
        }
        (None, message) => error!("DTC read failed: {}", message.as_deref().unwrap_or("unknown error")),
    }

    let mut readings = service.subscribe_readings();
    service.start_polling();
    info!("Polling live data, Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            reading = readings.recv() => match reading {
                Ok(r) => info!("{} = {} {}", r.pid, r.value, r.unit),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} readings", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Metrics: {}", serde_json::to_string(&service.metrics())?);
    service.shutdown().await;
    Ok(())
}
