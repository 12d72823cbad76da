mod common;

use std::time::Duration;

use common::{harness, running_generic_manager, spawn_manager, FakeManager};
use netconpaas::{
    entity::state::{LifecycleState, ServiceKind, TaskFarmMode},
    error::Error,
    frontend::CallerContext,
    poll::PollOutcome,
    registry::ServiceRegistry,
    schema::RemoteStatus,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_generic_service_reaches_running() {
    let h = harness();
    let server = spawn_manager(running_generic_manager()).await;
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    assert_eq!(created.lifecycle_state, LifecycleState::Init);
    let ctx = CallerContext::new(created.service_id, "alice");

    // Nothing provisioned yet
    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Init);
    assert!(summary.nodes.is_empty());

    h.oracle.set_address(Some(&server.address));
    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Running);
    assert!(!summary.needs_polling);
    assert_eq!(summary.manager_address.as_deref(), Some(server.address.as_str()));
    assert_eq!(summary.nodes["master"].len(), 1);
    assert_eq!(summary.nodes["node"].len(), 2);
    assert_eq!(summary.nodes["master"][0].ip_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(summary.current_code_version.as_deref(), Some("code-default"));

    let stored = h.registry.load(created.service_id).await.unwrap();
    assert_eq!(stored.nodes.len(), 3);
    assert!(stored.nodes.get_node("3").is_ok());
}

#[tokio::test]
async fn test_service_waits_in_starting_for_missing_roles() {
    let h = harness();
    let fake = running_generic_manager();
    fake.reply("list_nodes", json!({"result": {"master": [1], "node": []}}));
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");

    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Starting);
    assert!(summary.needs_polling);

    fake.reply("list_nodes", json!({"result": {"master": [1], "node": [2]}}));
    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Running);
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let h = harness();
    let server = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");

    let first = h.frontend.refresh(&ctx).await.unwrap();
    let first_record = h.registry.load(created.service_id).await.unwrap();
    let second = h.frontend.refresh(&ctx).await.unwrap();
    let second_record = h.registry.load(created.service_id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first_record.cached_state.map(|c| c.payload),
        second_record.cached_state.map(|c| c.payload)
    );
    assert_eq!(first_record.nodes, second_record.nodes);
}

#[tokio::test]
async fn test_manager_move_resets_to_init() {
    let h = harness();
    let first = spawn_manager(running_generic_manager()).await;
    let second = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&first.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Running
    );

    h.oracle.set_address(Some(&second.address));
    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Init);
    assert!(summary.nodes.is_empty());
    assert_eq!(summary.manager_address.as_deref(), Some(second.address.as_str()));
    let stored = h.registry.load(created.service_id).await.unwrap();
    assert!(stored.nodes.is_empty());
    assert!(stored.cached_state.is_none());

    // The next round starts over against the new manager
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Running
    );
}

#[tokio::test]
async fn test_action_on_moved_manager_reports_stale() {
    let h = harness();
    let first = spawn_manager(running_generic_manager()).await;
    let second = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&first.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    h.frontend.refresh(&ctx).await.unwrap();

    first.shutdown().await;
    h.oracle.set_address(Some(&second.address));
    let err = h
        .frontend
        .execute_script(&ctx, netconpaas::entity::state::ScriptCommand::Run, String::new())
        .await
        .unwrap_err();
    match err {
        Error::StaleManager { address, .. } => assert_eq!(address, second.address),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(
        h.frontend.summary(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Init
    );
}

#[tokio::test]
async fn test_script_status_error_is_absorbed() {
    let h = harness();
    let fake = running_generic_manager();
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    h.frontend.refresh(&ctx).await.unwrap();
    assert!(h.frontend.script_status(&ctx).await.unwrap().is_some());

    fake.reply("get_script_status", json!({"error": "agent unreachable"}));
    assert_eq!(h.frontend.script_status(&ctx).await.unwrap(), None);
}

#[tokio::test]
async fn test_execute_script_sends_command() {
    let h = harness();
    let fake = running_generic_manager();
    fake.reply("execute_script", json!({"result": {}}));
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    h.frontend.refresh(&ctx).await.unwrap();

    h.frontend
        .execute_script(
            &ctx,
            netconpaas::entity::state::ScriptCommand::Interrupt,
            "--fast".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(
        fake.params_of("execute_script"),
        Some(json!({"command": "interrupt", "parameters": "--fast"}))
    );
    // A successful mutation drops the cached status
    let stored = h.registry.load(created.service_id).await.unwrap();
    assert!(stored.cached_state.is_none());
}

#[tokio::test]
async fn test_volumes_follow_known_nodes() {
    let h = harness();
    let fake = running_generic_manager();
    fake.reply(
        "list_volumes",
        json!({"result": {"volumes": [
            {"volumeName": "logs", "volumeSize": 512, "agentId": "2"},
            {"volumeName": "data", "volumeSize": 1024, "agentId": 1},
            {"volumeName": "orphan", "volumeSize": 64, "agentId": 99}
        ]}}),
    );
    let server = spawn_manager(fake).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    h.frontend.refresh(&ctx).await.unwrap();

    let volumes = h.frontend.list_volumes(&ctx).await.unwrap();
    let mut names: Vec<_> = volumes.iter().map(|v| v.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["data", "logs"]);

    let stored = h.registry.load(created.service_id).await.unwrap();
    let node1 = stored.nodes.get_node("1").unwrap();
    assert_eq!(node1.volumes.len(), 1);
    assert_eq!(node1.volumes[0].name, "data");
    assert!(stored.nodes.get_node("3").unwrap().volumes.is_empty());
}

fn taskfarm_manager(completed: u64, total: u64) -> FakeManager {
    let fake = FakeManager::default();
    fake.reply(
        "get_service_info",
        json!({"result": {"mode": "DEMO", "moneySpent": 3.5, "noCompletedTasks": completed, "noTotalTasks": total}}),
    );
    fake.reply("set_service_mode", json!({"result": "REAL"}));
    fake.reply("start_execution", json!({"result": {}}));
    fake
}

#[tokio::test]
async fn test_set_mode_rejected_during_execution() {
    let h = harness();
    let fake = taskfarm_manager(5, 10);
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("bob", "farm", ServiceKind::TaskFarm, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "bob");

    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Running);
    // Still polling because an execution is in flight
    assert!(summary.needs_polling);

    assert!(matches!(
        h.frontend.set_mode(&ctx, TaskFarmMode::Real).await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        h.frontend
            .start_execution(&ctx, "samples.json".to_string(), 0)
            .await,
        Err(Error::Conflict(_))
    ));
    let summary = h.frontend.summary(&ctx).await.unwrap();
    assert_eq!(summary.taskfarm.unwrap().mode, TaskFarmMode::Demo);
    assert!(!fake.calls().iter().any(|m| m == "set_service_mode"));

    fake.reply(
        "get_service_info",
        json!({"result": {"mode": "DEMO", "moneySpent": 7.0, "noCompletedTasks": 10, "noTotalTasks": 10}}),
    );
    h.frontend.set_mode(&ctx, TaskFarmMode::Real).await.unwrap();
    assert_eq!(fake.params_of("set_service_mode"), Some(json!(["REAL"])));
    let summary = h.frontend.summary(&ctx).await.unwrap();
    assert_eq!(summary.taskfarm.unwrap().mode, TaskFarmMode::Real);

    h.frontend
        .start_execution(&ctx, "samples.json".to_string(), 2)
        .await
        .unwrap();
    assert_eq!(
        fake.params_of("start_execution"),
        Some(json!(["samples.json", 2]))
    );
}

#[tokio::test]
async fn test_taskfarm_null_status_is_unavailable() {
    let h = harness();
    let fake = FakeManager::default();
    fake.reply("get_service_info", json!({"result": null}));
    fake.reply("get_sampling_results", json!({"result": ""}));
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("bob", "farm", ServiceKind::TaskFarm, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "bob");

    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Starting);
    assert_eq!(
        h.frontend.progress(&ctx).await.unwrap(),
        RemoteStatus::Unavailable
    );
    assert!(h.frontend.sampling_results(&ctx).await.unwrap().is_empty());

    fake.reply(
        "get_sampling_results",
        json!({"result": "[{\"name\": \"s1\", \"timestamp\": 1.0, \"schedules\": [{\"time\": 60, \"cost\": 0.5}]}]"}),
    );
    let samples = h.frontend.sampling_results(&ctx).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].schedules[0].estimated_cost, 0.5);
}

#[tokio::test]
async fn test_watch_converges() {
    let h = harness();
    let server = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    let mut seen = Vec::new();
    let outcome = h
        .frontend
        .watch(&ctx, |s| seen.push(s.lifecycle_state), CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        PollOutcome::Converged(summary) => {
            assert_eq!(summary.lifecycle_state, LifecycleState::Running)
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(seen.last(), Some(&LifecycleState::Running));
}

#[tokio::test]
async fn test_watch_gives_up_on_unreachable_manager() {
    let h = harness();
    let server = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    server.shutdown().await;

    let outcome = h
        .frontend
        .watch(&ctx, |_| {}, CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        PollOutcome::PersistentFailure { failures: 3, .. }
    ));
    // Absorbed failures left the service where it was
    assert_eq!(
        h.frontend.summary(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Starting
    );
}

#[tokio::test]
async fn test_terminate_and_confirm_shutdown() {
    let h = harness();
    let fake = running_generic_manager();
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    h.frontend.refresh(&ctx).await.unwrap();

    let summary = h.frontend.terminate(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Stopping);
    assert!(summary.needs_polling);
    assert_eq!(*h.oracle.terminations.lock().unwrap(), vec![created.service_id]);

    // Manager still winding down
    fake.reply("get_service_info", json!({"result": {"state": "EPILOGUE"}}));
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Stopping
    );

    fake.reply("get_service_info", json!({"result": {"state": "STOPPED"}}));
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Stopped
    );
    assert!(matches!(
        h.registry.load(created.service_id).await,
        Err(Error::ServiceNotFound(_))
    ));
}

#[tokio::test]
async fn test_remote_failure_needs_recovery() {
    let h = harness();
    let fake = running_generic_manager();
    fake.reply("get_service_info", json!({"result": {"state": "ERROR"}}));
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");

    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Error
    );
    fake.reply("get_service_info", json!({"result": {"state": "RUNNING"}}));
    // ERROR holds until the user recovers
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Error
    );
    assert_eq!(
        h.frontend.recover(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Init
    );
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Running
    );
}

#[tokio::test]
async fn test_slow_refresh_does_not_undo_terminate() {
    let h = harness();
    let fake = running_generic_manager();
    fake.delay("list_nodes", Duration::from_millis(400));
    let server = spawn_manager(fake.clone()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");

    // Terminate lands while the refresh waits on list_nodes
    let (refreshed, terminated) = tokio::join!(h.frontend.refresh(&ctx), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.frontend.terminate(&ctx).await
    });
    assert_eq!(
        terminated.unwrap().lifecycle_state,
        LifecycleState::Stopping
    );
    assert_eq!(refreshed.unwrap().lifecycle_state, LifecycleState::Stopping);
    let stored = h.registry.load(created.service_id).await.unwrap();
    assert_eq!(stored.lifecycle_state, LifecycleState::Stopping);
    assert!(stored.stopping_since.is_some());
    // The node listing was still a valid observation
    assert_eq!(stored.nodes.len(), 3);
}

#[tokio::test]
async fn test_concurrent_terminate_reaches_oracle_once() {
    let h = harness();
    let server = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&server.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    h.frontend.refresh(&ctx).await.unwrap();

    let (first, second) = tokio::join!(h.frontend.terminate(&ctx), h.frontend.terminate(&ctx));
    for result in [&first, &second] {
        match result {
            Ok(summary) => assert_eq!(summary.lifecycle_state, LifecycleState::Stopping),
            Err(e) => assert!(matches!(e, Error::Conflict(_)), "unexpected {e}"),
        }
    }
    assert!(first.is_ok() || second.is_ok());
    assert_eq!(*h.oracle.terminations.lock().unwrap(), vec![created.service_id]);
}

#[tokio::test]
async fn test_manager_move_lifts_error() {
    let h = harness();
    let failed = running_generic_manager();
    failed.reply("get_service_info", json!({"result": {"state": "ERROR"}}));
    let first = spawn_manager(failed.clone()).await;
    let second = spawn_manager(running_generic_manager()).await;
    h.oracle.set_address(Some(&first.address));
    let created = h
        .frontend
        .create_service("alice", "web", ServiceKind::Generic, None)
        .await
        .unwrap();
    let ctx = CallerContext::new(created.service_id, "alice");
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Error
    );

    // Same manager: ERROR holds and the manager is left alone
    let calls = failed.calls().len();
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Error
    );
    assert_eq!(failed.calls().len(), calls);

    h.oracle.set_address(Some(&second.address));
    let summary = h.frontend.refresh(&ctx).await.unwrap();
    assert_eq!(summary.lifecycle_state, LifecycleState::Init);
    assert_eq!(summary.manager_address.as_deref(), Some(second.address.as_str()));
    assert_eq!(
        h.frontend.refresh(&ctx).await.unwrap().lifecycle_state,
        LifecycleState::Running
    );
}
