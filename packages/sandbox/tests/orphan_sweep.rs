// ABOUTME: Tests for removing managed containers left behind by earlier processes
// ABOUTME: Only containers older than the sweep age are killed and removed

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{orchestrator, test_settings, FakeRuntime, RuntimeCall};
use neuroforge_sandbox::ManagedContainer;
use tempfile::TempDir;

fn managed(name: &str, age: chrono::Duration) -> ManagedContainer {
    ManagedContainer {
        id: format!("id-{}", name),
        name: name.to_string(),
        request_id: Some(format!("req-{}", name)),
        created_at: Some(Utc::now() - age),
    }
}

#[tokio::test]
async fn test_sweep_removes_only_stale_containers() {
    let cache = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new().with_orphans(vec![
        managed("nf-old", chrono::Duration::hours(3)),
        managed("nf-fresh", chrono::Duration::seconds(5)),
        ManagedContainer {
            id: "id-unknown".to_string(),
            name: "nf-unknown".to_string(),
            request_id: None,
            created_at: None,
        },
    ]));
    let orch = orchestrator(test_settings(&cache, 1), &runtime);

    let report = orch
        .sweep_orphans(Duration::from_secs(3600))
        .await
        .unwrap();

    assert_eq!(report.found, 2);
    assert_eq!(report.removed, 2);
    assert!(report.errors.is_empty());

    let calls = runtime.calls();
    assert!(calls.contains(&RuntimeCall::Remove("nf-old".to_string())));
    assert!(calls.contains(&RuntimeCall::Remove("nf-unknown".to_string())));
    assert!(!calls.contains(&RuntimeCall::Remove("nf-fresh".to_string())));
}
