//! Full path from the service facade down to the simulated adapter

use kiosk_diag::{AdapterMode, ConnectRequest, DiagConfig, DiagnosticService};
use obd_protocol::{Pid, SimulatedAdapter, SimulatedVehicle};
use obd_session::{HistoryStatus, OperationKind, TimelineQuery};

fn service_with(codes: &[&str]) -> DiagnosticService {
    let mut config = DiagConfig::default();
    config.adapter.mode = AdapterMode::Simulated;
    config.adapter.command_timeout_ms = 100;
    let simulator = SimulatedAdapter::new(SimulatedVehicle::with_dtcs(codes.iter().copied()));
    DiagnosticService::with_simulator(config, simulator).unwrap()
}

#[tokio::test]
async fn test_read_clear_read() {
    let service = service_with(&["P0420", "P0300"]);
    assert!(service.connect(ConnectRequest::default()).await.success);

    let codes: Vec<String> = service
        .read_dtc()
        .await
        .data
        .unwrap()
        .into_iter()
        .map(|d| d.code)
        .collect();
    assert_eq!(codes, vec!["P0300", "P0420"]);

    assert_eq!(service.clear_dtc().await.data, Some(true));
    assert_eq!(service.read_dtc().await.data, Some(vec![]));

    let metrics = service.metrics();
    assert_eq!(metrics.operations[&OperationKind::ReadDtc].successes, 2);
    assert_eq!(metrics.operations[&OperationKind::ClearDtc].successes, 1);
    assert_eq!(metrics.total_failures, 0);

    match service.historical_summary() {
        HistoryStatus::Available(summary) => assert_eq!(summary.operations[&OperationKind::ReadDtc].success, 2),
        other => panic!("history unavailable: {other:?}"),
    }
}

#[tokio::test]
async fn test_timeline_and_insights_after_session() {
    let service = service_with(&["P0171"]);
    assert!(service.connect(ConnectRequest::default()).await.success);

    assert!(service.read_status().await.success);
    let live = service.read_live_data(Some(&[Pid::Rpm, Pid::FuelLevel][..])).await;
    let live = live.data.unwrap();
    assert_eq!(live.readings.len(), 1);
    assert_eq!(live.unsupported, vec![Pid::FuelLevel]);
    assert!(service.self_check().await.success);

    let all = service.timeline(&TimelineQuery::default());
    let ops = all.iter().filter(|e| e.operation().is_some()).count();
    assert_eq!(ops, 3);

    let tail = service.timeline(&TimelineQuery {
        newer_than: Some(all[1].id),
        limit: None,
    });
    assert_eq!(tail[..], all[2..]);

    let insights = service.insights(None);
    assert_eq!(insights.operations, 3);
    assert_eq!(insights.failure_rate, 0.0);

    service.shutdown().await;
    assert!(!service.read_status().await.success);
}
