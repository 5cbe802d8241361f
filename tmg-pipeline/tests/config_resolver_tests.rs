//! Config Resolver integration tests: overrides, fallback and their effect
//! on candidate selection

mod helpers;

use helpers::fixtures::{FIL, FOLD};
use helpers::{FakeExtractor, FakeFitter, TestRoot, PSR};
use std::sync::Arc;
use tmg_common::BackendId;
use tmg_pipeline::config::{self, ActiveBackends};
use tmg_pipeline::db::{pulsars, toas};
use tmg_pipeline::services::pulsar_pipeline::{self, PulsarStatus};

#[tokio::test]
async fn test_earlier_than_excludes_old_observations() {
    let root = TestRoot::new().await;
    let global = root.global_config();
    let source = root.add_pulsar(PSR);
    root.register(&source).await;
    root.write_override(PSR, r#"{"ignore_mjds": {"earlier_than": 60300}}"#);

    root.add_observation(FIL, PSR, 60200);
    root.add_observation(FIL, PSR, 60400);
    root.add_observation(FIL, PSR, 60500);
    root.ingest(&global).await;

    let cfg = config::resolve(&root.db, &global, &source).await.unwrap();
    assert!(cfg.is_ignored(60200.0));
    assert!(!cfg.is_ignored(60400.0));

    let fitter = Arc::new(FakeFitter::default());
    let ctx = root.context(global, Arc::new(FakeExtractor::default()), fitter.clone());
    let report = pulsar_pipeline::process(&ctx, &source, &cfg).await.unwrap();

    assert!(matches!(report.status, PulsarStatus::Succeeded { .. }));
    assert_eq!(report.new_toas, 2);
    let stored: Vec<f64> = toas::load_toas(&root.db, PSR)
        .await
        .unwrap()
        .iter()
        .map(|t| t.obs_mjd)
        .collect();
    assert_eq!(stored, vec![60400.0, 60500.0]);
}

#[tokio::test]
async fn test_use_filters_restricts_backends() {
    let root = TestRoot::new().await;
    let global = root.global_config();
    let source = root.add_pulsar(PSR);
    root.register(&source).await;
    root.write_override(PSR, &format!(r#"{{"settings": {{"use_filters": ["{}"]}}}}"#, FOLD));

    root.add_observation(FIL, PSR, 60100);
    root.add_observation(FOLD, PSR, 60110);
    root.add_observation(FOLD, PSR, 60120);
    root.ingest(&global).await;

    let cfg = config::resolve(&root.db, &global, &source).await.unwrap();
    assert_eq!(
        cfg.active_backends,
        ActiveBackends::Only([BackendId::new(FOLD)].into())
    );

    let ctx = root.context(
        global,
        Arc::new(FakeExtractor::default()),
        Arc::new(FakeFitter::default()),
    );
    pulsar_pipeline::process(&ctx, &source, &cfg).await.unwrap();

    let stored = toas::load_toas(&root.db, PSR).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|t| t.backend.as_str() == FOLD));
    // Fold backend jump carried onto its TOAs
    assert_eq!(stored[0].jump.value, 0.25165824);
}

#[tokio::test]
async fn test_malformed_override_falls_back_to_prior_config() {
    let root = TestRoot::new().await;
    let global = root.global_config();
    let source = root.add_pulsar(PSR);
    root.register(&source).await;

    root.write_override(PSR, r#"{"metadata": {"tag": "msp"}, "ignore_mjds": {"earlier_than": 60000}}"#);
    let first = config::resolve(&root.db, &global, &source).await.unwrap();
    assert_eq!(first.tag, "msp");

    root.write_override(PSR, r#"{"metadata": {"tag": "#);
    let second = config::resolve(&root.db, &global, &source).await.unwrap();
    assert_eq!(second, first);

    // Unknown backend name is malformed too
    root.write_override(PSR, r#"{"settings": {"use_filters": ["arecibo"]}}"#);
    let third = config::resolve(&root.db, &global, &source).await.unwrap();
    assert_eq!(third, first);
}

#[tokio::test]
async fn test_malformed_override_without_history_uses_defaults() {
    let root = TestRoot::new().await;
    let global = root.global_config();
    let source = root.add_pulsar(PSR);
    root.register(&source).await;
    root.write_override(PSR, r#"{"settings": {"reset_params": "yes"}}"#);

    let cfg = config::resolve(&root.db, &global, &source).await.unwrap();
    assert!(!cfg.reset_params);
    assert_eq!(cfg.tag, "untagged");
    assert_eq!(cfg.fit_params, vec!["F0", "F1", "RAJ", "DECJ"]);
}

#[tokio::test]
async fn test_successful_resolution_is_persisted() {
    let root = TestRoot::new().await;
    let global = root.global_config();
    let source = root.add_pulsar(PSR);
    root.register(&source).await;
    root.write_override(PSR, r#"{"metadata": {"tag": "magnetar"}, "future_section": {}}"#);

    config::resolve(&root.db, &global, &source).await.unwrap();
    let row = pulsars::get_pulsar(&root.db, PSR).await.unwrap().unwrap();
    assert_eq!(row.tag, "magnetar");
    assert!(row.effective_config.unwrap().contains("magnetar"));
}
