// ABOUTME: End-to-end tests against a real Docker daemon, plus behavior when the daemon is unreachable
// ABOUTME: Daemon-dependent tests are skipped when Docker is not available on the test host

use std::sync::Arc;
use std::time::Duration;

use bollard::{Docker, API_DEFAULT_VERSION};

use neuroforge_sandbox::{
    ContainerRuntime, DockerRuntime, ErrorKind, ExecutionRequest, SandboxError,
    SandboxOrchestrator, SandboxSettings,
};
use tempfile::TempDir;

async fn docker() -> Option<Arc<dyn ContainerRuntime>> {
    let runtime = DockerRuntime::new().ok()?;
    if !runtime.is_available().await {
        return None;
    }
    Some(Arc::new(runtime))
}

fn settings(cache: &TempDir) -> SandboxSettings {
    SandboxSettings {
        max_concurrency: 2,
        cache_dir: cache.path().to_path_buf(),
        ..SandboxSettings::default()
    }
}

#[tokio::test]
async fn test_python_hello_world_in_docker() {
    let Some(runtime) = docker().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let cache = TempDir::new().unwrap();
    let orch = SandboxOrchestrator::new(settings(&cache), runtime.clone()).unwrap();

    let result = orch
        .execute(ExecutionRequest::python("print('hello from the sandbox')").with_timeout_secs(30))
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "hello from the sandbox");

    let leftovers = runtime.list_managed().await.unwrap();
    assert!(leftovers
        .iter()
        .all(|c| c.request_id.as_deref() != Some(result.request_id.as_str())));
}

#[tokio::test]
async fn test_network_none_blocks_outbound_traffic() {
    let Some(runtime) = docker().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let cache = TempDir::new().unwrap();
    let orch = SandboxOrchestrator::new(settings(&cache), runtime).unwrap();

    let code = "import urllib.request\nurllib.request.urlopen('http://example.com', timeout=3)\n";
    let err = orch
        .execute(ExecutionRequest::python(code).with_timeout_secs(30))
        .await
        .unwrap_err();

    match err {
        SandboxError::Execution(result) => assert_ne!(result.exit_code, 0),
        other => panic!("expected execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_in_docker() {
    let Some(runtime) = docker().await else {
        println!("Skipping test: Docker not available");
        return;
    };
    let cache = TempDir::new().unwrap();
    let orch = SandboxOrchestrator::new(settings(&cache), runtime).unwrap();

    let err = orch
        .execute(ExecutionRequest::python("while True:\n    pass\n").with_timeout_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Timeout { .. }));
}

/// A daemon that cannot be reached is reported as unavailable, and requests
/// fail as infrastructure errors without leaving a slot taken
#[tokio::test]
async fn test_unreachable_daemon_is_infrastructure_error() {
    let client = Docker::connect_with_socket(
        "/nonexistent/neuroforge-docker.sock",
        2,
        API_DEFAULT_VERSION,
    )
    .unwrap();
    let runtime = DockerRuntime::with_client(client, Duration::from_secs(5));
    assert!(!runtime.is_available().await);

    let cache = TempDir::new().unwrap();
    let orch = SandboxOrchestrator::new(settings(&cache), Arc::new(runtime)).unwrap();
    let err = orch
        .execute(ExecutionRequest::python("print(1)"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(orch.admission_stats().in_flight, 0);
}
