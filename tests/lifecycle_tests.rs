mod common;

use std::time::Duration;

use game_node_agent::error::ErrorKind;
use game_node_agent::models::{InstallState, ServerStatus};

#[tokio::test]
async fn test_start_requires_installation() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::create_server(&state, "alpha", None).await;

    let err = state.lifecycle.start(&server.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let after = state.store.require_server(&server.id).unwrap();
    assert_eq!(after.status, ServerStatus::Offline);
    assert_eq!(after.install_state, InstallState::NotInstalled);
    assert!(after.pid.is_none());
    assert!(!state.lifecycle.is_running(&server.id));

    let err = state.lifecycle.start("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_start_command_stop_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let id = server.id.clone();
    let mut status_rx = state.events.status.subscribe();

    state.lifecycle.start(&id).await.unwrap();
    assert!(state.lifecycle.is_running(&id));
    common::assert_pid_invariant(&state.store.require_server(&id).unwrap());

    let err = state.lifecycle.start(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert!(common::wait_for_status(&state, &id, ServerStatus::Online).await);
    let online = state.store.require_server(&id).unwrap();
    assert!(online.pid.is_some());
    assert!(online.last_error.is_none());

    state.lifecycle.send_command(&id, "say hi").await.unwrap();
    let echoed = common::wait_for(Duration::from_secs(5), || {
        state
            .store
            .recent_logs(&id, 50)
            .unwrap()
            .iter()
            .any(|l| l.message == "got: say hi")
    })
    .await;
    assert!(echoed);
    let logs = state.store.recent_logs(&id, 50).unwrap();
    assert!(logs.iter().any(|l| l.message == "> say hi"));
    assert!(logs.iter().any(|l| l.message == "Server started"));

    state.lifecycle.stop(&id).await.unwrap();
    let stopped = state.store.require_server(&id).unwrap();
    assert_eq!(stopped.status, ServerStatus::Offline);
    assert!(stopped.pid.is_none());
    assert!(stopped.last_error.is_none());
    assert!(!state.lifecycle.is_running(&id));

    let mut statuses = Vec::new();
    while let Ok(event) = status_rx.try_recv() {
        if event.server_id == id {
            statuses.push(event.status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            ServerStatus::Starting,
            ServerStatus::Online,
            ServerStatus::Stopping,
            ServerStatus::Offline
        ]
    );
}

#[tokio::test]
async fn test_crash_records_exit_reason() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let id = server.id.clone();
    let mut notifications = state.events.notification.subscribe();

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::Online).await);

    state.lifecycle.send_command(&id, "crash").await.unwrap();
    assert!(common::wait_for(Duration::from_secs(10), || !state.lifecycle.is_running(&id)).await);

    let crashed = state.store.require_server(&id).unwrap();
    assert_eq!(crashed.status, ServerStatus::Offline);
    assert!(crashed.pid.is_none());
    let reason = crashed.last_error.unwrap();
    assert!(reason.contains("unexpectedly"), "{reason}");
    assert!(reason.contains("exit code 3"), "{reason}");

    let logs = state.store.recent_logs(&id, 50).unwrap();
    let stderr_line = logs
        .iter()
        .find(|l| l.message == "SEVERE: fatal error")
        .unwrap();
    assert_eq!(stderr_line.level, game_node_agent::models::LogLevel::Error);

    let mut crash_notified = false;
    while let Ok(n) = notifications.try_recv() {
        crash_notified |= n.title == "Server crashed";
    }
    assert!(crash_notified);

    let err = state.lifecycle.send_command(&id, "say hi").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_stop_and_command_require_live_process() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;

    let err = state.lifecycle.stop(&server.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = state
        .lifecycle
        .send_command(&server.id, "say hi")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = state.lifecycle.send_command(&server.id, "   ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = state
        .lifecycle
        .send_command(&server.id, "a\nb")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_reconcile_forces_stale_status_offline() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let online = common::create_server(&state, "online", None).await;
    let stopping = common::create_server(&state, "stopping", None).await;
    let idle = common::create_server(&state, "idle", None).await;

    state
        .store
        .update_status(&online.id, ServerStatus::Online, Some(3_999_999))
        .unwrap();
    state
        .store
        .update_status(&stopping.id, ServerStatus::Stopping, None)
        .unwrap();

    let reconciled = state.lifecycle.reconcile().unwrap();
    assert_eq!(reconciled, 2);

    for id in [&online.id, &stopping.id] {
        let s = state.store.require_server(id).unwrap();
        assert_eq!(s.status, ServerStatus::Offline);
        assert!(s.pid.is_none());
        assert!(!s.last_error.unwrap_or_default().is_empty());
    }
    let untouched = state.store.require_server(&idle.id).unwrap();
    assert!(untouched.last_error.is_none());

    assert_eq!(state.lifecycle.reconcile().unwrap(), 0);
}

#[tokio::test]
async fn test_delete_rejects_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let id = server.id.clone();

    state.lifecycle.start(&id).await.unwrap();
    let err = state.lifecycle.delete_server(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    state.lifecycle.stop(&id).await.unwrap();
    state.lifecycle.delete_server(&id).await.unwrap();
    assert!(state.store.get_server(&id).unwrap().is_none());
    assert!(!state.config.server_dir(&id).exists());
}

#[tokio::test]
async fn test_command_text_is_written_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let id = server.id.clone();

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::Online).await);

    state.lifecycle.send_command(&id, "  say  hi").await.unwrap();
    let echoed = common::wait_for(Duration::from_secs(5), || {
        state
            .store
            .recent_logs(&id, 50)
            .unwrap()
            .iter()
            .any(|l| l.message == "got:   say  hi")
    })
    .await;
    assert!(echoed);

    state.lifecycle.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_auth_prompt_is_not_cleared_by_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::scripted_server(
        &state,
        dir.path(),
        "alpha",
        "echo 'Please authenticate with /auth login'; exec sleep 30",
    )
    .await;
    let id = server.id.clone();
    common::configure_server(&state, &id, |cfg| cfg.ready_markers.clear()).await;

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::AuthRequired).await);

    // Grace period is one second in tests.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let waiting = state.store.require_server(&id).unwrap();
    assert_eq!(waiting.status, ServerStatus::AuthRequired);
    common::assert_pid_invariant(&waiting);

    state.lifecycle.stop(&id).await.unwrap();
    let stopped = state.store.require_server(&id).unwrap();
    assert_eq!(stopped.status, ServerStatus::Offline);
    assert!(stopped.last_error.is_none());
}

#[tokio::test]
async fn test_ready_marker_after_auth_goes_online() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::scripted_server(
        &state,
        dir.path(),
        "alpha",
        "echo 'Please authenticate'; read line; echo 'Server started'; exec sleep 30",
    )
    .await;
    let id = server.id.clone();

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::AuthRequired).await);

    state.lifecycle.send_command(&id, "/auth login device").await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::Online).await);
    common::assert_pid_invariant(&state.store.require_server(&id).unwrap());

    state.lifecycle.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_server_without_ready_marker_is_killed_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state_with(dir.path(), |cfg| cfg.startup_timeout_secs = 1);
    let server =
        common::scripted_server(&state, dir.path(), "alpha", "echo booting; exec sleep 30").await;
    let id = server.id.clone();
    common::configure_server(&state, &id, |cfg| {
        cfg.ready_markers = vec!["Never printed".to_string()]
    })
    .await;

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for(Duration::from_secs(10), || !state.lifecycle.is_running(&id)).await);

    let failed = state.store.require_server(&id).unwrap();
    assert_eq!(failed.status, ServerStatus::Offline);
    assert!(failed.pid.is_none());
    let reason = failed.last_error.unwrap();
    assert!(reason.contains("did not report ready within 1s"), "{reason}");
}

#[tokio::test]
async fn test_exit_before_ready_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::scripted_server(&state, dir.path(), "alpha", "echo booting; exit 2").await;
    let id = server.id.clone();
    common::configure_server(&state, &id, |cfg| {
        cfg.ready_markers = vec!["Never printed".to_string()]
    })
    .await;

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for(Duration::from_secs(10), || !state.lifecycle.is_running(&id)).await);

    let failed = state.store.require_server(&id).unwrap();
    assert_eq!(failed.status, ServerStatus::Offline);
    let reason = failed.last_error.unwrap();
    assert!(reason.contains("exited before becoming ready"), "{reason}");
    assert!(reason.contains("exit code 2"), "{reason}");
}

#[tokio::test]
async fn test_stop_after_exit_keeps_crash_reason() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let exited = dir.path().join("exited");
    // The background sleep keeps stdout open, so output draining outlasts
    // the exit itself.
    let script = format!(
        "echo 'Server started'; sleep 5 & read line; touch '{}'; exit 3",
        exited.display()
    );
    let server = common::scripted_server(&state, dir.path(), "alpha", &script).await;
    let id = server.id.clone();

    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::Online).await);

    state.lifecycle.send_command(&id, "go").await.unwrap();
    assert!(common::wait_for(Duration::from_secs(5), || exited.exists()).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = state.lifecycle.stop(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert!(common::wait_for(Duration::from_secs(10), || !state.lifecycle.is_running(&id)).await);
    let crashed = state.store.require_server(&id).unwrap();
    assert_eq!(crashed.status, ServerStatus::Offline);
    assert!(crashed.pid.is_none());
    let reason = crashed.last_error.unwrap();
    assert!(reason.contains("unexpectedly"), "{reason}");
    assert!(reason.contains("exit code 3"), "{reason}");

    // Nothing is left half-stopped; the server can be started again.
    state.lifecycle.start(&id).await.unwrap();
    assert!(common::wait_for_status(&state, &id, ServerStatus::Online).await);
}

#[tokio::test]
async fn test_stats_are_persisted_and_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let id = server.id.clone();
    let mut stats_rx = state.events.stats.subscribe();

    state.lifecycle.start(&id).await.unwrap();
    let sample = tokio::time::timeout(Duration::from_secs(5), stats_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sample.server_id, id);
    assert_eq!(sample.max_players, 20);
    assert_eq!(sample.players, 0);
    assert!(sample.memory > 0);

    let persisted = state.store.recent_stats(&id, 10).unwrap();
    assert!(!persisted.is_empty());
    assert!(persisted.iter().all(|s| s.server_id == id));

    state.lifecycle.stop(&id).await.unwrap();
}

#[tokio::test]
async fn test_reconcile_kills_orphan_in_server_root() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let root = server.server_root.clone().unwrap();

    let mut orphan = std::process::Command::new("sleep")
        .arg("30")
        .current_dir(&root)
        .spawn()
        .unwrap();
    state
        .store
        .update_status(&server.id, ServerStatus::Online, Some(orphan.id()))
        .unwrap();

    assert_eq!(state.lifecycle.reconcile().unwrap(), 1);
    let reaped = common::wait_for(Duration::from_secs(5), || {
        orphan.try_wait().unwrap().is_some()
    })
    .await;
    if !reaped {
        let _ = orphan.kill();
    }
    assert!(reaped);

    let s = state.store.require_server(&server.id).unwrap();
    assert_eq!(s.status, ServerStatus::Offline);
    assert!(s.pid.is_none());
}

#[tokio::test]
async fn test_start_and_install_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = common::test_state(dir.path());
    let server = common::installed_server(&state, dir.path(), "alpha").await;
    let id = server.id.clone();

    let (started, installing) = tokio::join!(
        state.lifecycle.start(&id),
        state.installer.install_server(&id)
    );
    match (started, installing) {
        (Ok(()), Err(e)) => {
            assert_eq!(e.kind(), ErrorKind::Conflict);
            assert!(!state.installer.is_installing(&id));
            state.lifecycle.stop(&id).await.unwrap();
        }
        (Err(e), Ok(task)) => {
            assert_eq!(e.kind(), ErrorKind::Conflict);
            assert!(!state.lifecycle.is_running(&id));
            task.await.unwrap();
        }
        (Ok(()), Ok(_)) => panic!("server started while an installation was accepted"),
        (Err(a), Err(b)) => panic!("both operations were rejected: {a}; {b}"),
    }

    let after = state.store.require_server(&id).unwrap();
    assert_eq!(after.status, ServerStatus::Offline);
    assert_eq!(after.install_state, InstallState::Installed);
}
