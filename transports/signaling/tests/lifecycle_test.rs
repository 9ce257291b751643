//! Connection lifecycle tests against the in-memory hub

mod harness;

use callhub_signaling::{
    token_fn, ConnectionState, Error, HubConnection, LifecycleEvent, LifecycleEventKind, NoToken,
    ReconnectionPolicy, StaticToken,
};
use harness::{presence_config, settle, wait_for_state, EventLog, MockHub};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn presence_connection(hub: &MockHub) -> HubConnection {
    HubConnection::new(presence_config(), hub.connector(), Arc::new(NoToken)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_connected() {
    let hub = MockHub::new();
    let conn = HubConnection::new(
        presence_config(),
        hub.connector(),
        Arc::new(StaticToken("t1".to_string())),
    )
    .unwrap();

    conn.connect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_attempts(), 0);
    assert_eq!(hub.tokens_seen(), vec![Some("t1".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_when_connected_is_noop() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);

    conn.connect().await.unwrap();
    conn.connect().await.unwrap();

    assert_eq!(hub.connect_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_rpc_while_disconnected_fails_without_io() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);

    let err = conn
        .invoke_void("UpdatePresence", vec![json!("online")])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotConnected));
    assert_eq!(hub.connect_attempts(), 0);
    assert!(hub.invocations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_schedules_first_attempt_after_backoff() {
    let hub = MockHub::new();
    hub.refuse_connects(1);
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(_)));

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert_eq!(hub.connect_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_millis(2)).await;
    settle().await;
    assert_eq!(hub.connect_attempts(), 2);
    assert_eq!(conn.state(), ConnectionState::Connected);

    let events = log.snapshot();
    assert!(events.contains(&LifecycleEvent::Reconnecting {
        attempt: 1,
        delay: Duration::from_millis(1000),
    }));
    assert_eq!(log.count(LifecycleEventKind::Restored), 1);
}

fn transitions(log: &EventLog<LifecycleEvent>) -> Vec<(ConnectionState, ConnectionState)> {
    log.snapshot()
        .into_iter()
        .filter_map(|event| match event {
            LifecycleEvent::StateChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_goes_straight_to_reconnecting() {
    let hub = MockHub::new();
    hub.refuse_connects(1);
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());

    assert!(conn.connect().await.is_err());
    wait_for_state(
        conn.watch_state(),
        ConnectionState::Connected,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    use ConnectionState::*;
    assert_eq!(
        transitions(&log),
        vec![
            (Disconnected, Connecting),
            (Connecting, Reconnecting),
            (Reconnecting, Connected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_drop_goes_straight_to_reconnecting() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);
    conn.connect().await.unwrap();
    let log = EventLog::attach(conn.lifecycle());

    hub.drop_link();
    wait_for_state(
        conn.watch_state(),
        ConnectionState::Reconnecting,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    wait_for_state(
        conn.watch_state(),
        ConnectionState::Connected,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    use ConnectionState::*;
    assert_eq!(
        transitions(&log),
        vec![(Connected, Reconnecting), (Reconnecting, Connected)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unintentional_drop_reconnects() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());
    conn.connect().await.unwrap();

    hub.drop_link();

    wait_for_state(
        conn.watch_state(),
        ConnectionState::Reconnecting,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    wait_for_state(
        conn.watch_state(),
        ConnectionState::Connected,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    assert_eq!(hub.connect_attempts(), 2);
    assert_eq!(conn.reconnect_attempts(), 0);
    assert_eq!(log.count(LifecycleEventKind::Restored), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_close_does_not_reconnect() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());
    conn.connect().await.unwrap();

    conn.disconnect().await;
    hub.drop_link();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(hub.connect_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(log.count(LifecycleEventKind::Reconnecting), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_backoff() {
    let hub = MockHub::new();
    hub.refuse_connects(1);
    let conn = presence_connection(&hub);

    assert!(conn.connect().await.is_err());
    settle().await;
    assert_eq!(conn.state(), ConnectionState::Reconnecting);

    conn.disconnect().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(hub.connect_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_is_terminal_until_manual_connect() {
    let hub = MockHub::new();
    hub.refuse_connects(4);
    let mut config = presence_config();
    config.reconnect = ReconnectionPolicy {
        max_attempts: 3,
        base_delay_ms: 100,
        cap_delay_ms: 1000,
    };
    let conn = HubConnection::new(config, hub.connector(), Arc::new(NoToken)).unwrap();
    let log = EventLog::attach(conn.lifecycle());

    assert!(conn.connect().await.is_err());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(hub.connect_attempts(), 4);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(log.count(LifecycleEventKind::Reconnecting), 3);
    assert!(log
        .snapshot()
        .contains(&LifecycleEvent::ReconnectExhausted { attempts: 3 }));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.connect_attempts(), 4);

    conn.connect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_is_not_retried() {
    let hub = MockHub::new();
    hub.reject_next_token();
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.connect_attempts(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(log.count(LifecycleEventKind::AuthenticationRejected), 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_provider_is_asked_on_every_attempt() {
    let hub = MockHub::new();
    let issued = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&issued);
    let tokens = token_fn(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<_, Error>(Some(format!("token-{}", n))) }
    });
    let conn = HubConnection::new(presence_config(), hub.connector(), Arc::new(tokens)).unwrap();

    conn.connect().await.unwrap();
    hub.drop_link();
    wait_for_state(
        conn.watch_state(),
        ConnectionState::Reconnecting,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    wait_for_state(
        conn.watch_state(),
        ConnectionState::Connected,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    assert_eq!(
        hub.tokens_seen(),
        vec![Some("token-1".to_string()), Some("token-2".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_pending_rpc_fails_when_link_drops() {
    let hub = MockHub::new();
    hub.hold("UpdatePresence");
    let conn = Arc::new(presence_connection(&hub));
    conn.connect().await.unwrap();

    let caller = Arc::clone(&conn);
    let pending = tokio::spawn(async move {
        caller
            .invoke_void("UpdatePresence", vec![json!("busy")])
            .await
    });
    settle().await;
    assert_eq!(hub.count("UpdatePresence"), 1);

    hub.drop_link();
    let err = pending.await.unwrap().unwrap_err();

    match err {
        Error::Transport(message) => assert_eq!(message, "connection lost"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_racing_a_drop_never_time_out() {
    let hub = MockHub::new();
    hub.hold("UpdatePresence");
    let mut config = presence_config();
    config.rpc_timeout_ms = 2000;
    let conn = Arc::new(HubConnection::new(config, hub.connector(), Arc::new(NoToken)).unwrap());
    conn.connect().await.unwrap();

    let calls: Vec<_> = (0..64)
        .map(|_| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.invoke_void("UpdatePresence", vec![json!("away")])
                    .await
            })
        })
        .collect();
    hub.drop_link();

    for call in calls {
        let outcome = call.await.unwrap();
        assert!(
            matches!(outcome, Err(Error::Transport(_)) | Err(Error::NotConnected)),
            "unexpected outcome {:?}",
            outcome
        );
    }
    conn.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_completion_maps_to_rpc_error() {
    let hub = MockHub::new();
    hub.fail("UpdatePresence", "status not allowed");
    let conn = presence_connection(&hub);
    conn.connect().await.unwrap();

    let err = conn
        .invoke_void("UpdatePresence", vec![json!("invisible")])
        .await
        .unwrap_err();

    match err {
        Error::Rpc { method, message } => {
            assert_eq!(method, "UpdatePresence");
            assert_eq!(message, "status not allowed");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_without_reconnect_is_terminal() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());
    conn.connect().await.unwrap();

    hub.close(Some("server shutting down"), false).unwrap();
    settle().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(hub.connect_attempts(), 1);
    assert!(log.snapshot().contains(&LifecycleEvent::ServerClosed {
        reason: Some("server shutting down".to_string()),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_keep_link_alive() {
    let hub = MockHub::new();
    let conn = presence_connection(&hub);
    conn.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert!(hub.pings() >= 3);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(hub.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_is_treated_as_drop() {
    let hub = MockHub::new();
    hub.mute_pings();
    let conn = presence_connection(&hub);
    let log = EventLog::attach(conn.lifecycle());
    conn.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(32)).await;

    assert!(log.count(LifecycleEventKind::Reconnecting) >= 1);
    assert!(hub.connect_attempts() >= 2);
}
