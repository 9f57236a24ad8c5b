// ABOUTME: Tests for container teardown guarantees at the lifecycle level
// ABOUTME: Teardown is idempotent and a dropped lifecycle keeps its slot until the container is removed

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{orchestrator, test_settings, FakeRuntime, RuntimeCall};
use neuroforge_sandbox::{
    AdmissionController, ContainerLifecycle, ContainerRuntime, ExecutionRequest, InstallPlan,
    LifecycleContext, LifecycleEvent, LifecyclePlan, LifecycleState, NetworkMode, PackageCache,
    SandboxError,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

struct Harness {
    runtime: Arc<FakeRuntime>,
    admission: AdmissionController,
    ctx: LifecycleContext,
    events: broadcast::Receiver<LifecycleEvent>,
    _cache: TempDir,
}

fn harness(runtime: FakeRuntime) -> Harness {
    let cache = TempDir::new().unwrap();
    let settings = test_settings(&cache, 1);
    let runtime = Arc::new(runtime);
    let (tx, events) = broadcast::channel(64);
    let dyn_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let ctx = LifecycleContext {
        runtime: dyn_runtime,
        cache: Arc::new(PackageCache::new(cache.path()).unwrap()),
        settings: Arc::new(settings),
        events: Some(tx),
    };
    Harness {
        runtime,
        admission: AdmissionController::new(1, 4, Duration::from_secs(5)).unwrap(),
        ctx,
        events,
        _cache: cache,
    }
}

fn plan() -> LifecyclePlan {
    LifecyclePlan {
        network_mode: NetworkMode::None,
        timeout: Duration::from_secs(5),
        install_plan: InstallPlan::default(),
    }
}

fn torn_down_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if event.state == LifecycleState::TornDown {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_teardown_twice_removes_and_releases_once() {
    let mut h = harness(FakeRuntime::new());
    let slot = h.admission.acquire().await.unwrap();
    let mut lifecycle = ContainerLifecycle::new(
        h.ctx.clone(),
        ExecutionRequest::python("print(1)"),
        plan(),
        slot,
    );

    lifecycle.run(&CancellationToken::new()).await.unwrap();
    lifecycle.teardown().await;
    lifecycle.teardown().await;

    assert_eq!(lifecycle.state(), LifecycleState::TornDown);
    assert_eq!(
        lifecycle
            .history()
            .iter()
            .filter(|s| **s == LifecycleState::TornDown)
            .count(),
        1
    );
    assert!(lifecycle.finished_at().is_some());
    assert_eq!(h.runtime.count(|c| matches!(c, RuntimeCall::Remove(_))), 1);
    assert_eq!(torn_down_events(&mut h.events), 1);

    let stats = h.admission.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.available, 1);

    drop(lifecycle);
    assert_eq!(torn_down_events(&mut h.events), 0);
}

#[tokio::test]
async fn test_teardown_before_create_skips_runtime() {
    let mut h = harness(FakeRuntime::new());
    let slot = h.admission.acquire().await.unwrap();
    let mut lifecycle = ContainerLifecycle::new(
        h.ctx.clone(),
        ExecutionRequest::python("print(1)"),
        plan(),
        slot,
    );

    lifecycle.teardown().await;
    lifecycle.teardown().await;

    assert!(h.runtime.calls().is_empty());
    assert_eq!(lifecycle.history(), &[LifecycleState::Pending, LifecycleState::TornDown]);
    assert_eq!(torn_down_events(&mut h.events), 1);
    assert_eq!(h.admission.stats().in_flight, 0);
}

#[tokio::test]
async fn test_dropped_lifecycle_releases_slot_after_removal() {
    let h = harness(
        FakeRuntime::new()
            .with_run_delay(Duration::from_secs(30))
            .with_kill_delay(Duration::from_millis(100)),
    );
    let admission = Arc::new(h.admission);
    let slot = admission.acquire().await.unwrap();
    let lifecycle = ContainerLifecycle::new(
        h.ctx.clone(),
        ExecutionRequest::python("import time\ntime.sleep(30)"),
        plan(),
        slot,
    );

    let task = tokio::spawn(async move {
        let mut lifecycle = lifecycle;
        lifecycle.run(&CancellationToken::new()).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.runtime.live(), 1);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // The next slot is only granted once the container is gone
    let started = Instant::now();
    let next = admission.acquire().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(h.runtime.live(), 0);

    let calls = h.runtime.calls();
    let kill = calls.iter().position(|c| matches!(c, RuntimeCall::Kill(_)));
    let remove = calls.iter().position(|c| matches!(c, RuntimeCall::Remove(_)));
    assert!(kill.unwrap() < remove.unwrap());
    drop(next);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_request_never_exceeds_concurrency() {
    let cache = TempDir::new().unwrap();
    let runtime = Arc::new(
        FakeRuntime::new()
            .with_run_delay(Duration::from_secs(30))
            .with_kill_delay(Duration::from_millis(100)),
    );
    let orch = orchestrator(test_settings(&cache, 1), &runtime);

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.execute(ExecutionRequest::python("while True: pass").with_timeout_secs(20))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.execute(ExecutionRequest::python("while True: pass").with_timeout_secs(1))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orch.admission_stats().waiting, 1);

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    assert!(matches!(
        second.await.unwrap(),
        Err(SandboxError::Timeout { .. })
    ));
    assert_eq!(runtime.max_live(), 1);
    assert_eq!(runtime.count(|c| matches!(c, RuntimeCall::Create(_))), 2);
    assert_eq!(runtime.live(), 0);
    assert_eq!(orch.admission_stats().in_flight, 0);
}
