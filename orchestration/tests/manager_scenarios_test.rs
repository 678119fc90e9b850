//! End-to-end manager behaviour against scripted providers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{first_token_timeout, manager_with, settings, ScriptedProvider, Step};
use futures::future::join_all;
use orchestration::{
    ErrorKind, ModelHealth, ModelKey, PriorityEntry, ProviderError, RejectReason, SelectionPhase,
};

fn health_of(models: &[orchestration::ModelDescriptor], provider: &str, model: &str) -> ModelHealth {
    models
        .iter()
        .find(|d| d.provider_id == provider && d.id == model)
        .map(|d| d.health)
        .unwrap_or_else(|| panic!("{}/{} not catalogued", provider, model))
}

// ---------------------------------------------------------------------------
// Demotion and fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_threshold_timeouts_blacklist_and_fall_back_to_remote() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"])
            .then(Step::Fail(first_token_timeout()))
            .then(Step::Fail(first_token_timeout()))
            .then(Step::Fail(first_token_timeout())),
    );
    let remote = Arc::new(ScriptedProvider::remote("remote-b", &["m2"]));
    let manager = manager_with(vec![local.clone(), remote.clone()], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    for round in 1..=2 {
        let failure = manager.infer("top 10 customers", None).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout, "round {}", round);
        assert!(failure.retryable);
        let models = manager.list_models().await;
        assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Degraded);
    }

    let outcome = manager.infer("top 10 customers", None).await.unwrap();
    assert_eq!(outcome.provider_id, "remote-b");
    assert_eq!(outcome.model_id, "m2");
    assert_eq!(outcome.text, "ok from m2");
    assert_eq!(outcome.fell_back_from, Some(ModelKey::new("local-a", "m1")));
    assert!(outcome
        .transitions
        .iter()
        .any(|t| t.key == ModelKey::new("local-a", "m1") && t.to == ModelHealth::Blacklisted));

    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Blacklisted);
    assert_eq!(health_of(&models, "remote-b", "m2"), ModelHealth::Healthy);

    let state = manager.current_state().await;
    assert_eq!(state.selected_provider, "remote-b");
    assert_eq!(state.selected_model, "m2");
    assert_eq!(state.last_query.as_deref(), Some("top 10 customers"));
    assert_eq!(local.calls(), 3);
    assert_eq!(remote.calls(), 1);

    let order = manager.fallback_order().await;
    assert!(!order.is_empty());
    assert!(!order.iter().any(|k| k.provider_id == "local-a"));
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"])
            .then(Step::Fail(first_token_timeout()))
            .then(Step::Fail(first_token_timeout()))
            .then(Step::Answer("SELECT 1".to_string()))
            .then(Step::Fail(first_token_timeout()))
            .then(Step::Fail(first_token_timeout())),
    );
    let manager = manager_with(vec![local], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    assert!(manager.infer("q", None).await.is_err());
    assert!(manager.infer("q", None).await.is_err());
    assert_eq!(manager.infer("q", None).await.unwrap().text, "SELECT 1");
    assert!(manager.infer("q", None).await.is_err());
    assert!(manager.infer("q", None).await.is_err());

    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Degraded);
    assert_eq!(manager.phase().await, SelectionPhase::Active);
}

#[tokio::test]
async fn test_incompatible_model_blacklisted_immediately() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1", "m3"]).then(Step::Fail(
            ProviderError::IncompatibleModel("unknown model architecture".to_string()),
        )),
    );
    let manager = manager_with(vec![local.clone()], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let outcome = manager.infer("q", None).await.unwrap();
    assert_eq!(outcome.model_id, "m3");
    assert_eq!(outcome.fell_back_from, Some(ModelKey::new("local-a", "m1")));
    assert_eq!(local.calls(), 2);

    let rejected = manager.select("local-a", "m1").await.unwrap_err();
    assert_eq!(rejected.reason, RejectReason::Blacklisted);
}

#[tokio::test]
async fn test_last_candidate_blacklisted_clears_selection() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"]).then(Step::Fail(
            ProviderError::IncompatibleModel("tensor 'blk.0' not found".to_string()),
        )),
    );
    let manager = manager_with(vec![local], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let failure = manager.infer("q", None).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::IncompatibleModel);
    assert!(!failure.retryable);
    assert_eq!(manager.phase().await, SelectionPhase::Unselected);

    let failure = manager.infer("q", None).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::SelectionRejected);
}

#[tokio::test]
async fn test_connection_failure_retries_other_provider_without_reselecting() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"]).then(Step::Fail(
            ProviderError::ConnectionUnavailable("connection refused".to_string()),
        )),
    );
    let remote = Arc::new(ScriptedProvider::remote("remote-b", &["m2"]));
    let manager = manager_with(vec![local, remote], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let outcome = manager.infer("q", None).await.unwrap();
    assert_eq!(outcome.provider_id, "remote-b");
    assert_eq!(outcome.fell_back_from, Some(ModelKey::new("local-a", "m1")));

    let state = manager.current_state().await;
    assert_eq!(state.selected_provider, "local-a");
    assert_eq!(state.selected_model, "m1");
    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Degraded);
}

#[tokio::test]
async fn test_connection_failure_without_alternative_reports_backoff() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"])
            .then(Step::Fail(ProviderError::ConnectionUnavailable("refused".to_string())))
            .then(Step::Fail(ProviderError::ConnectionUnavailable("refused".to_string()))),
    );
    let manager = manager_with(vec![local], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let first = manager.infer("q", None).await.unwrap_err();
    assert_eq!(first.kind, ErrorKind::ConnectionUnavailable);
    assert!(first.retryable);
    assert_eq!(first.retry_after_ms, Some(2000));

    let second = manager.infer("q", None).await.unwrap_err();
    assert_eq!(second.retry_after_ms, Some(4000));

    // Connection problems never blacklist.
    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Degraded);
}

// ---------------------------------------------------------------------------
// Credentials and deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_credential_errors_leave_health_untouched() {
    let remote = Arc::new(
        ScriptedProvider::remote("remote-b", &["m2"])
            .then(Step::Fail(ProviderError::CredentialNotFound("remote-b".to_string())))
            .then(Step::Fail(ProviderError::CredentialRejected(401))),
    );
    let local = Arc::new(ScriptedProvider::local("local-a", &["m1"]));
    let manager = manager_with(vec![local.clone(), remote], settings()).await;
    manager.select("remote-b", "m2").await.unwrap();

    let missing = manager.infer("q", None).await.unwrap_err();
    assert_eq!(missing.kind, ErrorKind::CredentialNotFound);
    assert!(!missing.retryable);
    assert!(missing.transitions.is_empty());

    let rejected = manager.infer("q", None).await.unwrap_err();
    assert_eq!(rejected.kind, ErrorKind::CredentialRejected);

    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "remote-b", "m2"), ModelHealth::Unknown);
    assert_eq!(local.calls(), 0, "credential errors must not fall back");
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_counts_as_timeout() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"]).then(Step::Stall(Duration::from_secs(30))),
    );
    let manager = manager_with(vec![local], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let failure = manager
        .infer("q", Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Timeout);

    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_not_binding_lets_slow_answer_through() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"]).then(Step::Stall(Duration::from_secs(5))),
    );
    let manager = manager_with(vec![local], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let outcome = manager
        .infer("q", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(outcome.text, "late answer from m1");
}

// ---------------------------------------------------------------------------
// Selection and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_selecting_blacklisted_model_leaves_session_unchanged() {
    let mut settings = settings();
    settings.known_incompatible = vec!["bad".to_string()];
    let local = Arc::new(ScriptedProvider::local("local-a", &["m1", "bad"]));
    let manager = manager_with(vec![local], settings).await;
    manager.select("local-a", "m1").await.unwrap();
    let before = manager.current_state().await;

    let rejected = manager.select("local-a", "bad").await.unwrap_err();
    assert_eq!(rejected.reason, RejectReason::Blacklisted);

    let after = manager.current_state().await;
    assert_eq!(after.selected_provider, before.selected_provider);
    assert_eq!(after.selected_model, before.selected_model);
    assert_eq!(manager.phase().await, SelectionPhase::Active);
}

async fn ordering_manager(settings: orchestration::ManagerSettings) -> orchestration::ModelManager {
    manager_with(
        vec![
            Arc::new(ScriptedProvider::local("local-a", &["m3", "m2"])),
            Arc::new(ScriptedProvider::remote("remote-b", &["m9", "m1"])),
            Arc::new(ScriptedProvider::local("local-c", &["m1"])),
        ],
        settings,
    )
    .await
}

#[tokio::test]
async fn test_fallback_order_is_deterministic() {
    let mut settings = settings();
    settings.priority = vec![
        PriorityEntry::pinned("remote-b", "m9"),
        PriorityEntry::model("m2"),
    ];

    let first = ordering_manager(settings.clone()).await.fallback_order().await;
    let second = ordering_manager(settings).await.fallback_order().await;
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![
            ModelKey::new("remote-b", "m9"),
            ModelKey::new("local-a", "m2"),
            ModelKey::new("local-a", "m3"),
            ModelKey::new("local-c", "m1"),
            ModelKey::new("remote-b", "m1"),
        ]
    );
}

#[tokio::test]
async fn test_ensure_selection_uses_default_then_fallback() {
    let local = Arc::new(ScriptedProvider::local("local-a", &["m1"]));
    let manager = manager_with(vec![local], settings()).await;
    let selected = manager.ensure_selection().await.unwrap();
    assert_eq!(selected.key(), ModelKey::new("local-a", "m1"));

    let mut other = settings();
    other.default_model = "absent".to_string();
    let manager = manager_with(
        vec![Arc::new(ScriptedProvider::local("local-a", &["m7"]))],
        other,
    )
    .await;
    let selected = manager.ensure_selection().await.unwrap();
    assert_eq!(selected.key(), ModelKey::new("local-a", "m7"));
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let manager = manager_with(
        vec![Arc::new(ScriptedProvider::local("local-a", &["m1"]))],
        settings(),
    )
    .await;
    let mut rx = manager.subscribe();
    rx.borrow_and_update();

    manager.set_database("inventory").await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().selected_database, "inventory");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_blacklist_exactly_once() {
    let local = Arc::new(ScriptedProvider::local("local-a", &["m1"]));
    for _ in 0..3 {
        local.push(Step::FailAfter(Duration::from_secs(1), first_token_timeout()));
    }
    let remote = Arc::new(ScriptedProvider::remote("remote-b", &["m2"]));
    let manager = manager_with(vec![local.clone(), remote.clone()], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let results = join_all((0..3).map(|_| manager.infer("q", None))).await;

    let mut transitions = Vec::new();
    let mut answered = 0;
    for result in results {
        match result {
            Ok(outcome) => {
                answered += 1;
                assert_eq!(outcome.provider_id, "remote-b");
                transitions.extend(outcome.transitions);
            }
            Err(failure) => {
                assert_eq!(failure.kind, ErrorKind::Timeout);
                transitions.extend(failure.transitions);
            }
        }
    }
    assert_eq!(answered, 1, "only the call that crossed the threshold retries");

    let blacklisted: Vec<_> = transitions
        .iter()
        .filter(|t| t.key == ModelKey::new("local-a", "m1") && t.to == ModelHealth::Blacklisted)
        .collect();
    assert_eq!(blacklisted.len(), 1);
    assert!(blacklisted[0].reason.contains("3/3"));

    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Blacklisted);
    let state = manager.current_state().await;
    assert_eq!(state.selected_provider, "remote-b");
    assert_eq!(state.selected_model, "m2");
    assert_eq!(manager.phase().await, SelectionPhase::Active);
    assert_eq!(local.calls(), 3);
    assert_eq!(remote.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_calls_on_different_providers_overlap() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"]).then(Step::Stall(Duration::from_secs(5))),
    );
    let remote = Arc::new(
        ScriptedProvider::remote("remote-b", &["m2"]).then(Step::Stall(Duration::from_secs(5))),
    );
    let manager = manager_with(vec![local, remote], settings()).await;
    manager.select("local-a", "m1").await.unwrap();

    let started = tokio::time::Instant::now();
    let on_local = manager.infer("q1", None);
    let on_remote = async {
        // Runs once the first call is parked inside its backend request.
        manager.select("remote-b", "m2").await.unwrap();
        manager.infer("q2", None).await
    };
    let (first, second) = tokio::join!(on_local, on_remote);

    assert_eq!(first.unwrap().provider_id, "local-a");
    assert_eq!(second.unwrap().provider_id, "remote-b");
    assert!(started.elapsed() < Duration::from_secs(10));
}

// ---------------------------------------------------------------------------
// Pull and probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pull_adds_model_to_catalog() {
    let local = Arc::new(ScriptedProvider::local("local-a", &["m1"]).with_pullable(&["m4"]));
    let manager = manager_with(vec![local], settings()).await;

    let pulled = manager.pull_model("local-a", "m4").await.unwrap();
    assert_eq!(pulled.health, ModelHealth::Unknown);
    assert!(manager
        .fallback_order()
        .await
        .contains(&ModelKey::new("local-a", "m4")));

    let failure = manager.pull_model("local-a", "nope").await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Backend);
    assert_eq!(failure.model_id, "nope");
}

#[tokio::test]
async fn test_ensure_selection_pulls_missing_priority_model() {
    let mut settings = settings();
    settings.default_model = "absent".to_string();
    settings.auto_pull = true;
    settings.priority = vec![PriorityEntry::model("unpullable"), PriorityEntry::model("m4")];
    let local = Arc::new(ScriptedProvider::local("local-a", &[]).with_pullable(&["m4"]));
    let manager = manager_with(vec![local], settings).await;

    let selected = manager.ensure_selection().await.unwrap();
    assert_eq!(selected.key(), ModelKey::new("local-a", "m4"));
    assert_eq!(manager.phase().await, SelectionPhase::Active);
}

#[tokio::test]
async fn test_ensure_selection_without_auto_pull_fails() {
    let mut settings = settings();
    settings.default_model = "absent".to_string();
    settings.priority = vec![PriorityEntry::model("m4")];
    let local = Arc::new(ScriptedProvider::local("local-a", &[]).with_pullable(&["m4"]));
    let manager = manager_with(vec![local], settings).await;

    assert!(manager.ensure_selection().await.is_err());
    assert!(manager.list_models().await.is_empty());
}

#[tokio::test]
async fn test_probe_classifies_model_health() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1", "m3"])
            .then(Step::Answer("Hello World".to_string()))
            .then(Step::Fail(ProviderError::IncompatibleModel(
                "tensor 'output.weight' not found".to_string(),
            ))),
    );
    let manager = manager_with(vec![local], settings()).await;
    manager.select("local-a", "m3").await.unwrap();

    let report = manager.probe_model("local-a", "m1").await.unwrap();
    assert_eq!(report.health, ModelHealth::Healthy);
    assert_eq!(report.transitions.len(), 1);

    let failure = manager.probe_model("local-a", "m3").await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::IncompatibleModel);

    // The probed model was selected: the selection moves off it.
    let state = manager.current_state().await;
    assert_eq!(state.selected_model, "m1");
    assert!(state.last_query.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_probe_times_out_under_first_token_budget() {
    let local = Arc::new(
        ScriptedProvider::local("local-a", &["m1"]).then(Step::Stall(Duration::from_secs(120))),
    );
    let manager = manager_with(vec![local], settings()).await;

    let started = tokio::time::Instant::now();
    let failure = manager.probe_model("local-a", "m1").await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert!(started.elapsed() <= Duration::from_secs(61));

    let models = manager.list_models().await;
    assert_eq!(health_of(&models, "local-a", "m1"), ModelHealth::Degraded);
}
