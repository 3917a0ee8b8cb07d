mod support;

use std::time::Duration;

use deck_protocol::{CONTROL_PREFIX, ClientMessage, HostMessage};
use libdeck::{DeckError, RestoreReport, SessionRegistry, StateStore, TerminalEvent, TerminalStatus};
use support::{in_memory_registry, terminal_harness, wait_for};

fn ready(session_id: &str, is_reconnect: bool, buffered: Option<&str>) -> HostMessage {
    HostMessage::Ready {
        is_reconnect,
        session_id: session_id.to_string(),
        buffered_output: buffered.map(str::to_string),
    }
}

#[tokio::test]
async fn restore_resumes_persisted_session_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = StateStore::open(dir.path()).unwrap();
        SessionRegistry::new(store)
            .put("h-1", "sess-1", "api")
            .unwrap();
    }

    let registry = SessionRegistry::new(StateStore::open(dir.path()).unwrap());
    let mut h = terminal_harness(registry);
    let manager = h.manager.clone();
    let restore = tokio::spawn(async move { manager.restore_all().await });

    let mut conn = h.host.accept().await.unwrap();
    assert_eq!(conn.query("session_id").as_deref(), Some("sess-1"));
    assert!(conn.query("project_path").is_none());
    assert_eq!(
        conn.recv_control().await,
        Some(ClientMessage::Resize { rows: 24, cols: 80 })
    );
    conn.send_control(&ready("sess-1", true, Some("output while away\r\n")));

    let report = restore.await.unwrap().unwrap();
    assert_eq!(
        report,
        RestoreReport {
            restored: 1,
            failed: 0,
            timed_out: 0
        }
    );

    let list = h.manager.list().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].handle_id, "h-1");
    assert_eq!(list[0].label, "api");
    assert_eq!(list[0].server_session_id.as_deref(), Some("sess-1"));
    assert_eq!(list[0].status, TerminalStatus::Ready);

    assert_eq!(h.surfaces.get("h-1").contents(), "output while away\r\n");
    let entries = h.registry.get_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].session_id, "sess-1");
}

#[tokio::test]
async fn fresh_session_on_resume_overwrites_registry_entry() {
    let registry = in_memory_registry();
    registry.put("h-1", "sess-old", "api").unwrap();
    let mut h = terminal_harness(registry);
    let manager = h.manager.clone();
    let restore = tokio::spawn(async move { manager.restore_all().await });

    let conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-new", false, Some("stale replay")));

    let report = restore.await.unwrap().unwrap();
    assert_eq!(report.restored, 1);

    let entries = h.registry.get_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].handle_id, "h-1");
    assert_eq!(entries[0].session_id, "sess-new");
    assert_eq!(entries[0].label, "api");

    // Only a genuine reconnect replays buffered output.
    assert_eq!(h.surfaces.get("h-1").contents(), "");
    let list = h.manager.list().await.unwrap();
    assert_eq!(list[0].server_session_id.as_deref(), Some("sess-new"));
}

#[tokio::test]
async fn create_is_refused_until_restoration_completes() {
    let registry = in_memory_registry();
    registry.put("h-1", "sess-1", "api").unwrap();
    let mut h = terminal_harness(registry);

    // Registry not read yet.
    assert!(h.manager.create(None).await.unwrap().is_none());

    let manager = h.manager.clone();
    let restore = tokio::spawn(async move { manager.restore_all().await });
    let conn = h.host.accept().await.unwrap();

    // Restoration in flight.
    assert!(h.manager.create(None).await.unwrap().is_none());
    assert_eq!(h.manager.list().await.unwrap().len(), 1);

    conn.send_control(&ready("sess-1", true, None));
    restore.await.unwrap().unwrap();

    let created = h
        .manager
        .create(Some("/work/billing-api"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.label, "billing-api");
    assert_eq!(created.status, TerminalStatus::Connecting);
    assert!(created.server_session_id.is_none());

    let fresh = h.host.accept().await.unwrap();
    assert_eq!(fresh.query("project_path").as_deref(), Some("/work/billing-api"));
    assert!(fresh.query("session_id").is_none());

    // A second pass is a no-op and reports the first.
    assert_eq!(h.manager.restore_all().await.unwrap().restored, 1);
}

#[tokio::test(start_paused = true)]
async fn restoration_gives_up_waiting_after_grace_window() {
    let registry = in_memory_registry();
    registry.put("h-1", "sess-1", "api").unwrap();
    registry.put("h-2", "sess-2", "web").unwrap();
    let mut h = terminal_harness(registry);
    let manager = h.manager.clone();
    let restore = tokio::spawn(async move { manager.restore_all().await });

    let first = h.host.accept().await.unwrap();
    let _silent = h.host.accept().await.unwrap();
    let session_id = first.query("session_id").unwrap();
    first.send_control(&ready(&session_id, true, None));

    let report = restore.await.unwrap().unwrap();
    assert_eq!(
        report,
        RestoreReport {
            restored: 1,
            failed: 0,
            timed_out: 1
        }
    );
    assert!(h.manager.create(None).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_session_ids_are_restored_once() {
    let registry = in_memory_registry();
    registry.put("h-1", "sess-1", "api").unwrap();
    registry.put("h-2", "sess-1", "api (copy)").unwrap();
    let mut h = terminal_harness(registry);
    let manager = h.manager.clone();
    let restore = tokio::spawn(async move { manager.restore_all().await });

    let conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-1", true, None));
    restore.await.unwrap().unwrap();

    assert!(h.host.try_accept().is_none());
    let entries = h.registry.get_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].handle_id, "h-1");
}

#[tokio::test(start_paused = true)]
async fn closing_cancels_pending_reconnect() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();

    let created = h.manager.create(None).await.unwrap().unwrap();
    assert_eq!(created.label, "Terminal 1");
    let conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-1", false, None));
    wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;
    assert_eq!(h.registry.get_all().unwrap().len(), 1);

    drop(conn);
    let event = wait_for(&mut h.events, |e| {
        matches!(e, TerminalEvent::Reconnecting { .. })
    })
    .await;
    assert_eq!(
        event,
        TerminalEvent::Reconnecting {
            handle_id: created.handle_id.clone(),
            attempt: 1,
            delay: Duration::from_secs(2),
        }
    );

    assert!(h.manager.close(&created.handle_id).await.unwrap());
    assert_eq!(h.api.closed(), vec!["sess-1".to_string()]);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.host.try_accept().is_none());
    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.registry.get_all().unwrap().is_empty());
    assert!(h.surfaces.get(&created.handle_id).is_disposed());
    assert!(!h.manager.close(&created.handle_id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_same_session_and_resets_attempts() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    let created = h.manager.create(Some("/srv/app")).await.unwrap().unwrap();

    let conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-9", false, None));
    wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;

    conn.close(1011);
    let resumed = h.host.accept().await.unwrap();
    assert_eq!(resumed.query("session_id").as_deref(), Some("sess-9"));
    resumed.send_control(&ready("sess-9", true, Some("still here")));
    let event = wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;
    assert_eq!(
        event,
        TerminalEvent::Ready {
            handle_id: created.handle_id.clone(),
            session_id: "sess-9".into(),
            is_reconnect: true,
        }
    );
    assert_eq!(h.surfaces.get(&created.handle_id).contents(), "still here");

    // Attempts were reset by the successful open.
    drop(resumed);
    let event = wait_for(&mut h.events, |e| {
        matches!(e, TerminalEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(event, TerminalEvent::Reconnecting { attempt: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn reconnection_is_abandoned_after_max_attempts() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    h.dialer.set_refusing(true);

    let created = h.manager.create(None).await.unwrap().unwrap();
    let mut connecting = Vec::new();
    let mut reconnecting = Vec::new();
    loop {
        match wait_for(&mut h.events, |_| true).await {
            TerminalEvent::Connecting { attempt, .. } => connecting.push(attempt),
            TerminalEvent::Reconnecting { attempt, .. } => reconnecting.push(attempt),
            TerminalEvent::Exhausted { handle_id } => {
                assert_eq!(handle_id, created.handle_id);
                break;
            }
            _ => {}
        }
    }
    // The first connect plus three reconnects before giving up.
    assert_eq!(connecting, vec![0, 1, 2, 3]);
    assert_eq!(reconnecting, vec![1, 2, 3]);

    h.dialer.set_refusing(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.host.try_accept().is_none());
    let list = h.manager.list().await.unwrap();
    assert_eq!(list[0].status, TerminalStatus::Exhausted);
    assert!(h.registry.get_all().unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_all_closes_every_terminal_even_when_a_close_fails() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    h.api.fail_close_for("sess-2");

    let mut conns = Vec::new();
    for n in 1..=3 {
        h.manager.create(None).await.unwrap().unwrap();
        let conn = h.host.accept().await.unwrap();
        conn.send_control(&ready(&format!("sess-{n}"), false, None));
        wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;
        conns.push(conn);
    }
    assert_eq!(h.registry.get_all().unwrap().len(), 3);

    assert_eq!(h.manager.cleanup_all().await.unwrap(), 3);
    assert_eq!(
        h.api.closed(),
        vec!["sess-1".to_string(), "sess-2".to_string(), "sess-3".to_string()]
    );
    assert!(h.registry.get_all().unwrap().is_empty());
    assert!(h.manager.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shell_exit_forgets_session_without_reconnecting() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    let created = h.manager.create(None).await.unwrap().unwrap();

    let conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-1", false, None));
    conn.send_control(&HostMessage::Exit {
        code: Some(0),
        output: Some("logout\r\n".into()),
    });
    let event = wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Exited { .. })).await;
    assert_eq!(
        event,
        TerminalEvent::Exited {
            handle_id: created.handle_id.clone(),
            code: Some(0)
        }
    );
    drop(conn);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.host.try_accept().is_none());
    assert!(h.registry.get_all().unwrap().is_empty());
    assert_eq!(h.surfaces.get(&created.handle_id).contents(), "logout\r\n");

    // The session is already gone remotely.
    assert!(h.manager.close(&created.handle_id).await.unwrap());
    assert!(h.api.closed().is_empty());
}

#[tokio::test]
async fn raw_output_is_forwarded_and_malformed_envelopes_dropped() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    let created = h.manager.create(None).await.unwrap().unwrap();

    let conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-1", false, None));
    conn.send_text("$ ls\r\n");
    conn.send_text(&format!("{CONTROL_PREFIX}{{not json"));
    conn.send_text(r#"{"type":"exit","code":1}"#);
    conn.send_raw(b"\r\n");
    conn.send_control(&HostMessage::Error {
        message: "disk full".into(),
    });

    let event = wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Error { .. })).await;
    assert_eq!(
        event,
        TerminalEvent::Error {
            handle_id: created.handle_id.clone(),
            message: "disk full".into()
        }
    );
    assert_eq!(
        h.surfaces.get(&created.handle_id).contents(),
        "$ ls\r\n{\"type\":\"exit\",\"code\":1}\r\n"
    );
    let list = h.manager.list().await.unwrap();
    assert_eq!(list[0].status, TerminalStatus::Ready);
}

#[tokio::test]
async fn input_and_resize_reach_the_host() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    let created = h.manager.create(None).await.unwrap().unwrap();

    let mut conn = h.host.accept().await.unwrap();
    conn.send_control(&ready("sess-1", false, None));
    wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;
    assert_eq!(
        conn.recv_control().await,
        Some(ClientMessage::Resize { rows: 24, cols: 80 })
    );

    assert!(h.manager.input(&created.handle_id, "ls -la\n").await.unwrap());
    assert!(h.manager.resize(&created.handle_id, 50, 132).await.unwrap());
    assert_eq!(
        conn.recv_control().await,
        Some(ClientMessage::Input {
            data: "ls -la\n".into()
        })
    );
    assert_eq!(
        conn.recv_control().await,
        Some(ClientMessage::Resize { rows: 50, cols: 132 })
    );

    assert!(matches!(
        h.manager.input("no-such-handle", "x").await,
        Err(DeckError::UnknownHandle(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn frames_from_a_replaced_connection_are_ignored() {
    let mut h = terminal_harness(in_memory_registry());
    h.manager.restore_all().await.unwrap();
    let created = h.manager.create(None).await.unwrap().unwrap();

    let old = h.host.accept().await.unwrap();
    old.send_control(&ready("sess-1", false, None));
    old.send_raw(b"before\r\n");
    wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;

    old.fail("connection reset");
    wait_for(&mut h.events, |e| {
        matches!(e, TerminalEvent::Reconnecting { .. })
    })
    .await;
    let current = h.host.accept().await.unwrap();
    assert_eq!(current.query("session_id").as_deref(), Some("sess-1"));
    current.send_control(&ready("sess-1", true, None));
    wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Ready { .. })).await;

    old.send_raw(b"stale output");
    old.send_control(&ready("sess-stale", false, Some("stale buffer")));
    current.send_raw(b"live\r\n");
    current.send_control(&HostMessage::Error {
        message: "marker".into(),
    });
    wait_for(&mut h.events, |e| matches!(e, TerminalEvent::Error { .. })).await;

    assert_eq!(
        h.surfaces.get(&created.handle_id).contents(),
        "before\r\nlive\r\n"
    );
    let list = h.manager.list().await.unwrap();
    assert_eq!(list[0].server_session_id.as_deref(), Some("sess-1"));
    assert_eq!(list[0].status, TerminalStatus::Ready);
    let entries = h.registry.get_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].session_id, "sess-1");
}
