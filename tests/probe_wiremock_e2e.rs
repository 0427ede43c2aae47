//! End-to-end estimation against a mocked OpenRouter server.

use std::sync::Arc;
use std::time::Duration;

use credence_harness::cache::SqliteSampleCache;
use credence_harness::config::RunConfig;
use credence_harness::elicit::GatewayExecutor;
use credence_harness::estimator::estimate;
use credence_harness::gateway::openrouter::OpenRouterAdapter;
use credence_harness::gateway::{GatewayConfig, ProviderGateway};
use credence_harness::templates::TemplateCatalog;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn probe_body(p: f64) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": format!("{{\"p_true\": {p}}}") },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 50, "completion_tokens": 8 }
    })
}

fn mock_gateway(server: &MockServer) -> Arc<ProviderGateway> {
    let adapter = OpenRouterAdapter::with_config(
        "sk-test",
        server.uri(),
        Duration::from_secs(5),
        None,
        None,
    )
    .unwrap();
    Arc::new(ProviderGateway::with_config(
        adapter,
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ))
}

fn run_config() -> RunConfig {
    let mut config = RunConfig::new("the test claim", "openai/gpt-5-mini");
    config.paraphrase_slots = 4;
    config.replicates = 2;
    config.bootstrap_replicas = 200;
    config.seed = Some(11);
    config
}

#[tokio::test]
async fn constant_provider_answers_collapse_to_that_probability() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(0.73)))
        .mount(&server)
        .await;

    let config = run_config();
    let catalog = TemplateCatalog::builtin();
    let executor = GatewayExecutor::new(mock_gateway(&server), catalog.clone(), &config);

    let session = estimate(&executor, &catalog, &config).await.unwrap();
    let est = &session.estimate;

    assert!((est.probability - 0.73).abs() < 1e-9);
    assert_eq!(est.totals.succeeded, 8);
    assert!((est.compliance_rate - 1.0).abs() < 1e-12);
    // Every answer identical: the interval collapses onto the estimate.
    assert!((est.ci_lower - 0.73).abs() < 1e-9);
    assert!((est.ci_upper - 0.73).abs() < 1e-9);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 8);
}

#[tokio::test]
async fn boundary_probability_is_a_compliance_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(1.0)))
        .mount(&server)
        .await;

    let config = run_config();
    let catalog = TemplateCatalog::builtin();
    let executor = GatewayExecutor::new(mock_gateway(&server), catalog.clone(), &config);

    let err = estimate(&executor, &catalog, &config).await.unwrap_err();
    let diagnostics = match err {
        credence_harness::estimator::EstimateError::InsufficientData { diagnostics } => diagnostics,
        other => panic!("expected InsufficientData, got {other:?}"),
    };
    assert_eq!(diagnostics.totals.failed, 8);
    assert_eq!(diagnostics.compliance_rate, 0.0);
}

#[tokio::test]
async fn second_run_is_served_from_the_sample_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(probe_body(0.6)))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let cache = Arc::new(SqliteSampleCache::new(dir.path().join("cache.sqlite")).unwrap());

    let config = run_config();
    let catalog = TemplateCatalog::builtin();

    let executor = GatewayExecutor::new(mock_gateway(&server), catalog.clone(), &config)
        .with_cache(cache.clone());
    let first = estimate(&executor, &catalog, &config).await.unwrap();

    let executor = GatewayExecutor::new(mock_gateway(&server), catalog.clone(), &config)
        .with_cache(cache);
    let second = estimate(&executor, &catalog, &config).await.unwrap();

    assert_eq!(first.estimate.probability, second.estimate.probability);
    assert_eq!(first.estimate.ci_lower, second.estimate.ci_lower);

    // 8 probes for the first run; the second run never hits the provider.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 8);
}
