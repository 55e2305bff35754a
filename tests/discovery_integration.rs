//! End-to-end discovery runs against the in-process container engine
//!
//! `MockEngine` records builds and plays scripted workers against the real
//! capture server, so these tests exercise the whole pipeline without Docker.

mod support;

use nimbus::discovery::proto::{init_request, SubscriptionWorker};
use nimbus::discovery::{
    AccessGrant, AccessMode, Action, Declaration, DiscoveryError, DiscoveryOrchestrator,
    GraphWarning, PolicyDeclaration, ResourceKey, ResourceKind,
};
use nimbus::engine::{MockEngine, WorkerScript, LABEL_COMPONENT};
use nimbus::runtime::{RuntimeRegistry, TypeScriptRuntime};
use nimbus::Project;
use std::sync::Arc;
use std::time::Duration;
use support::{bucket, leftover_workspaces, test_config, topic, write_project};

fn policy(actions: &[Action], bucket: &str) -> Declaration {
    Declaration::Policy(
        PolicyDeclaration::new(
            None,
            actions.iter().copied(),
            [ResourceKey::new(ResourceKind::Bucket, bucket)],
        )
        .expect("valid policy"),
    )
}

fn two_function_project() -> tempfile::TempDir {
    write_project(&[
        ("functions/reader.ts", "export default {}\n"),
        ("functions/writer.py", "print('writer')\n"),
    ])
}

#[tokio::test]
async fn test_merged_graph_unions_access() {
    let dir = two_function_project();
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    engine.script(
        "reader",
        WorkerScript::plain(vec![
            bucket("uploads"),
            policy(&[Action::BucketFileGet], "uploads"),
        ]),
    );
    engine.script(
        "writer",
        WorkerScript::plain(vec![
            bucket("uploads"),
            policy(&[Action::BucketFilePut], "uploads"),
        ]),
    );

    let outcome = DiscoveryOrchestrator::new(engine.clone(), test_config(10))
        .discover(&project)
        .await
        .expect("discovery runs");

    assert!(outcome.is_complete(), "failures: {:?}", outcome.failures);

    let key = ResourceKey::new(ResourceKind::Bucket, "uploads");
    let uploads = outcome.graph.resource(&key).expect("bucket merged");
    assert_eq!(uploads.claimed_by.len(), 2);
    assert_eq!(
        outcome.graph.access(&key).into_iter().collect::<Vec<_>>(),
        vec![
            AccessGrant::new("reader", AccessMode::Read),
            AccessGrant::new("writer", AccessMode::Write),
        ]
    );
    assert_eq!(
        outcome
            .graph
            .resources()
            .filter(|r| r.kind == ResourceKind::Bucket)
            .count(),
        1
    );

    // One dev image per language, one discovery image per function
    let components: Vec<String> = engine
        .builds()
        .iter()
        .filter_map(|b| b.request.labels.get(LABEL_COMPONENT).cloned())
        .collect();
    assert!(components.contains(&"dev-typescript".to_string()));
    assert!(components.contains(&"dev-python".to_string()));
    assert_eq!(engine.builds().len(), 4);

    assert_eq!(engine.running(), 0);
    assert!(leftover_workspaces(dir.path()).is_empty());
}

#[tokio::test]
async fn test_build_failure_is_isolated() {
    let dir = write_project(&[
        ("functions/alpha.ts", "export default {}\n"),
        ("functions/beta.ts", "export default {}\n"),
    ]);
    let project = Project::load(dir.path()).unwrap();
    let beta_tag = project.function("beta").unwrap().discovery_tag(project.name());

    let engine = Arc::new(MockEngine::new());
    engine.fail_build(&beta_tag);
    engine.script("alpha", WorkerScript::plain(vec![bucket("uploads")]));

    let outcome = DiscoveryOrchestrator::new(engine.clone(), test_config(10))
        .discover(&project)
        .await
        .unwrap();

    assert!(outcome.dependencies.contains_key("alpha"));
    assert!(matches!(
        outcome.failures.get("beta"),
        Some(DiscoveryError::BuildError { .. })
    ));
    // beta never got a container
    assert_eq!(engine.runs().len(), 1);

    let failure = outcome.into_result(false).unwrap_err();
    assert_eq!(failure.failures.len(), 1);
    assert!(failure
        .partial
        .resource(&ResourceKey::new(ResourceKind::Bucket, "uploads"))
        .is_some());
}

#[tokio::test]
async fn test_silent_worker_times_out() {
    let dir = write_project(&[("functions/sleepy.js", "setInterval(() => {}, 1000)\n")]);
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    engine.script("sleepy", WorkerScript::Silent);

    let outcome = DiscoveryOrchestrator::new(engine.clone(), test_config(1))
        .discover(&project)
        .await
        .unwrap();

    assert!(matches!(
        outcome.failures.get("sleepy"),
        Some(DiscoveryError::DiscoveryTimeout { timeout, .. }) if *timeout == Duration::from_secs(1)
    ));
    assert_eq!(engine.stopped().len(), 1);
    assert_eq!(engine.running(), 0);
}

#[tokio::test]
async fn test_cancellation_cleans_up() {
    let dir = write_project(&[
        ("functions/one.ts", "export default {}\n"),
        ("functions/two.ts", "export default {}\n"),
    ]);
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    engine.script("one", WorkerScript::Silent);
    engine.script("two", WorkerScript::Silent);

    let result = DiscoveryOrchestrator::new(engine.clone(), test_config(60))
        .discover_until(&project, tokio::time::sleep(Duration::from_millis(500)))
        .await;

    assert!(matches!(result, Err(DiscoveryError::Cancelled)));
    assert_eq!(engine.running(), 0);
    assert_eq!(engine.stopped().len(), engine.runs().len());
    assert!(leftover_workspaces(dir.path()).is_empty());
}

#[tokio::test]
async fn test_lingering_worker_is_captured_after_handshake() {
    let dir = write_project(&[("functions/gateway.ts", "export default {}\n")]);
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    engine.script("gateway", WorkerScript::linger(vec![bucket("assets")], None));

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        DiscoveryOrchestrator::new(engine.clone(), test_config(30)).discover(&project),
    )
    .await
    .expect("discovery does not wait for the worker to hang up")
    .unwrap();

    assert!(outcome.is_complete());
    assert!(outcome
        .graph
        .resource(&ResourceKey::new(ResourceKind::Bucket, "assets"))
        .is_some());
    assert_eq!(engine.running(), 0);
}

#[tokio::test]
async fn test_cancellation_during_teardown_stops_containers() {
    let dir = write_project(&[
        ("functions/one.ts", "export default {}\n"),
        ("functions/two.ts", "export default {}\n"),
    ]);
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    engine.delay_stop(Duration::from_millis(500));

    let result = DiscoveryOrchestrator::new(engine.clone(), test_config(60))
        .discover_until(&project, tokio::time::sleep(Duration::from_millis(200)))
        .await;

    assert!(matches!(result, Err(DiscoveryError::Cancelled)));
    assert_eq!(engine.running(), 0);
    assert_eq!(engine.stopped().len(), engine.runs().len());
    assert!(leftover_workspaces(dir.path()).is_empty());
}

#[tokio::test]
async fn test_slow_discovery_build_counts_against_timeout() {
    let dir = write_project(&[("functions/heavy.ts", "export default {}\n")]);
    let project = Project::load(dir.path()).unwrap();
    let tag = project.function("heavy").unwrap().discovery_tag(project.name());

    let engine = Arc::new(MockEngine::new());
    engine.delay_build(&tag, Duration::from_secs(5));

    let outcome = DiscoveryOrchestrator::new(engine.clone(), test_config(1))
        .discover(&project)
        .await
        .unwrap();

    assert!(matches!(
        outcome.failures.get("heavy"),
        Some(DiscoveryError::DiscoveryTimeout { .. })
    ));
    assert!(engine.runs().is_empty());
    assert!(leftover_workspaces(dir.path()).is_empty());
}

#[tokio::test]
async fn test_dangling_subscription_warns() {
    let dir = write_project(&[
        ("functions/listener.ts", "export default {}\n"),
        ("functions/publisher.ts", "export default {}\n"),
    ]);
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    engine.script(
        "listener",
        WorkerScript::serve(
            Vec::new(),
            Some(init_request::Worker::Subscription(SubscriptionWorker {
                topic: "orders".to_string(),
            })),
        ),
    );
    engine.script("publisher", WorkerScript::plain(vec![topic("events")]));

    let outcome = DiscoveryOrchestrator::new(engine, test_config(10))
        .discover(&project)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(
        outcome.graph.warnings(),
        &[GraphWarning::DanglingSubscription {
            function: "listener".to_string(),
            topic: "orders".to_string(),
        }]
    );
    let triggers = outcome.graph.triggers("listener").unwrap();
    assert!(triggers.subscriptions.contains("orders"));
    assert!(outcome.graph.triggers("publisher").unwrap().is_empty());
}

#[tokio::test]
async fn test_unsupported_handler_fails_alone() {
    let dir = write_project(&[
        ("functions/ok.py", "print('ok')\n"),
        ("nimbus.yaml", "handlers:\n  - functions/*.py\n  - functions/*.rb\n"),
        ("functions/legacy.rb", "puts 'hi'\n"),
    ]);
    let project = Project::load(dir.path()).unwrap();

    let engine = Arc::new(MockEngine::new());
    let outcome = DiscoveryOrchestrator::new(engine, test_config(10))
        .discover(&project)
        .await
        .unwrap();

    assert!(outcome.dependencies.contains_key("ok"));
    assert!(matches!(
        outcome.failures.get("legacy"),
        Some(DiscoveryError::UnsupportedRuntime(_))
    ));
}

#[tokio::test]
async fn test_custom_registry_limits_runtimes() {
    let dir = two_function_project();
    let project = Project::load(dir.path()).unwrap();

    let mut registry = RuntimeRegistry::new();
    registry.register(Arc::new(TypeScriptRuntime));

    let engine = Arc::new(MockEngine::new());
    let outcome = DiscoveryOrchestrator::new(engine.clone(), test_config(10))
        .with_registry(registry)
        .discover(&project)
        .await
        .unwrap();

    assert!(outcome.dependencies.contains_key("reader"));
    assert!(matches!(
        outcome.failures.get("writer"),
        Some(DiscoveryError::UnsupportedRuntime(_))
    ));
    assert!(engine
        .built_tags()
        .iter()
        .all(|tag| !tag.contains("python")));
}
