//! Monitoring state tests

mod helpers;

use chrono::Utc;
use helpers::fixtures::{FIL, FOLD};
use helpers::{FakeExtractor, FakeFitter, TestRoot};
use std::sync::Arc;
use tmg_pipeline::config;
use tmg_pipeline::models::PulsarSource;
use tmg_pipeline::services::monitor::{self, STATE_FILE};
use tmg_pipeline::services::pulsar_pipeline;

const CRAB: &str = "B0531+21";
const VELA: &str = "B0833-45";

async fn process(root: &TestRoot, source: &PulsarSource, fitter: Arc<FakeFitter>) {
    let global = root.global_config();
    root.ingest(&global).await;
    let cfg = config::resolve(&root.db, &global, source).await.unwrap();
    let ctx = root.context(global, Arc::new(FakeExtractor::default()), fitter);
    pulsar_pipeline::process(&ctx, source, &cfg).await.unwrap();
}

/// Crab: good fit over 300 days. Vela: chi2r far above threshold.
async fn two_pulsars() -> (TestRoot, Vec<PulsarSource>) {
    let root = TestRoot::new().await;
    let crab = root.add_pulsar(CRAB);
    let vela = root.add_pulsar(VELA);
    root.register(&crab).await;
    root.register(&vela).await;

    root.add_observation(FIL, CRAB, 60000);
    root.add_observation(FOLD, CRAB, 60000);
    root.add_observation(FIL, CRAB, 60300);
    process(&root, &crab, Arc::new(FakeFitter::default())).await;

    root.add_observation(FIL, VELA, 60100);
    root.add_observation(FIL, VELA, 60400);
    let bad = Arc::new(FakeFitter::default());
    bad.set_chi2_reduced(50.0);
    process(&root, &vela, bad).await;

    (root, vec![crab, vela])
}

#[tokio::test]
async fn test_pulsars_ranked_by_warning_score() {
    let (root, sources) = two_pulsars().await;
    let config = root.global_config();
    let state = monitor::refresh(&root.db, &sources, &config, &root.layout.workspace_dir(), Utc::now())
        .await
        .unwrap();

    let order: Vec<&str> = state.pulsars.iter().map(|p| p.psr_id.as_str()).collect();
    assert_eq!(order, vec![VELA, CRAB]);

    let vela = &state.pulsars[0];
    assert_eq!(vela.warning_count, 1);
    assert_eq!(vela.warning_score, 2);
    assert_eq!(vela.latest.as_ref().unwrap().chi2_reduced, 50.0);
    assert_eq!(vela.residuals.len(), 2);

    let crab = &state.pulsars[1];
    assert_eq!(crab.warning_count, 0);
    assert_eq!(crab.latest.as_ref().unwrap().ntoa, 3);
    assert_eq!(crab.artifacts.parfile, sources[0].parfile_path());
    assert_eq!(crab.last_updated_text.as_deref(), Some("Updated just now"));
}

#[tokio::test]
async fn test_trends_exclude_unreliable_fits() {
    let (root, sources) = two_pulsars().await;
    let state = monitor::refresh(
        &root.db,
        &sources,
        &root.global_config(),
        &root.layout.workspace_dir(),
        Utc::now(),
    )
    .await
    .unwrap();

    let points: Vec<_> = state.trends.values().flatten().collect();
    assert_eq!(points.len(), 1);
    let crab = points[0];
    assert_eq!(crab.psr_id, CRAB);
    assert!((crab.period.unwrap() - 1.0 / 29.9469).abs() < 1e-12);
    assert!((crab.ra_deg.unwrap() - 83.633).abs() < 1e-3);
    assert!(crab.period_derivative.unwrap() > 0.0);
}

#[tokio::test]
async fn test_heatmap_counts_toas_per_day() {
    let (root, sources) = two_pulsars().await;
    let state = monitor::refresh(
        &root.db,
        &sources,
        &root.global_config(),
        &root.layout.workspace_dir(),
        Utc::now(),
    )
    .await
    .unwrap();

    let heatmap = &state.heatmap;
    assert_eq!(heatmap.end_mjd, Some(60400));
    // 60000 is 2023-02-25; both Crab backends observed that day
    assert_eq!(heatmap.days["2023-02-25"].count, 2);
    assert_eq!(heatmap.days["2023-02-25"].intensity, 1.0);
    assert_eq!(heatmap.days["2023-02-26"].count, 0);
    assert_eq!(heatmap.days.len(), 1050);
}

#[tokio::test]
async fn test_state_file_written_atomically() {
    let (root, sources) = two_pulsars().await;
    let state = monitor::refresh(
        &root.db,
        &sources,
        &root.global_config(),
        &root.layout.workspace_dir(),
        Utc::now(),
    )
    .await
    .unwrap();

    let path = monitor::write_state(&root.layout.output_dir, &state).await.unwrap();
    assert_eq!(path, root.layout.output_dir.join(STATE_FILE));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["pulsars"].as_array().unwrap().len(), 2);
    assert_eq!(json["pulsars"][0]["psr_id"], VELA);
    assert_eq!(json["pulsars"][0]["warnings"][0]["kind"], "unreliable_ephemeris");

    let leftovers: Vec<_> = std::fs::read_dir(&root.layout.output_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_pulsar_without_history_listed_empty() {
    let root = TestRoot::new().await;
    let source = root.add_pulsar(CRAB);
    root.register(&source).await;

    let state = monitor::refresh(
        &root.db,
        &[source],
        &root.global_config(),
        &root.layout.workspace_dir(),
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(state.pulsars.len(), 1);
    assert!(state.pulsars[0].latest.is_none());
    assert!(state.last_updated.is_none());
    assert!(state.heatmap.days.is_empty());
    assert!(state.trends.is_empty());
}
