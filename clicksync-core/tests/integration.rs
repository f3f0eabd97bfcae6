//! Integration tests: controller/follower sessions, reconnects, port
//! recovery and teardown over real TCP connections on localhost.

use std::fmt::Debug;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clicksync_core::{
    Command, ConnectionEvent, ConnectionManager, ConnectionStatus, DiscoveredPeer, FailureKind,
    LifecycleSettings, MulticastConfig, MulticastDiscovery, Orchestrator, Role, SessionSettings,
    StaticDiscovery, SyncEvent,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

// ── Helpers ──────────────────────────────────────────────────────

fn lifecycle_settings() -> LifecycleSettings {
    LifecycleSettings {
        instance_name: "Test".into(),
        listen_address: Ipv4Addr::LOCALHOST.into(),
        reconnect_delay: Duration::from_millis(100),
    }
}

fn follower(port: u16) -> SessionSettings {
    SessionSettings {
        role: Role::Follower,
        port: port.to_string(),
        preferred_peer: None,
    }
}

fn controller(preferred: Option<&str>) -> SessionSettings {
    SessionSettings {
        role: Role::Controller,
        port: String::new(),
        preferred_peer: preferred.map(str::to_string),
    }
}

fn local_peer(name: &str, port: u16) -> DiscoveredPeer {
    DiscoveredPeer::new(name, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

/// A port nothing is listening on right now.
fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap().port()
}

/// Occupy `count` consecutive localhost ports; returns the first.
fn occupy_range(count: u16) -> (u16, Vec<std::net::TcpListener>) {
    'search: loop {
        let first = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let base = first.local_addr().unwrap().port();
        if base > u16::MAX - count {
            continue;
        }
        let mut held = vec![first];
        for offset in 1..count {
            match std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, base + offset)) {
                Ok(listener) => held.push(listener),
                Err(_) => continue 'search,
            }
        }
        return (base, held);
    }
}

/// Receive until `pred` matches, failing after [`WAIT`].
async fn wait_for<E: Debug>(rx: &mut UnboundedReceiver<E>, mut pred: impl FnMut(&E) -> bool) -> E {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything that arrives within [`QUIET`].
async fn drain<E>(rx: &mut UnboundedReceiver<E>) -> Vec<E> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(QUIET, rx.recv()).await {
        seen.push(event);
    }
    seen
}

fn is_status(event: &SyncEvent, want: &ConnectionStatus) -> bool {
    matches!(event, SyncEvent::StatusChanged(s) if s == want)
}

/// A listener that never accepts and whose accept queue is full, so further
/// connects stay pending.
async fn saturated_listener() -> (SocketAddr, TcpListener, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
    let addr = socket.local_addr().unwrap();
    let listener = socket.listen(0).unwrap();

    let mut queued = Vec::new();
    while let Ok(Ok(stream)) =
        tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await
    {
        queued.push(stream);
        assert!(queued.len() < 16, "accept queue never filled");
    }
    (addr, listener, queued)
}

/// Follow port rotations until the recovery bound is spent; returns the
/// ports moved to.
async fn rotations_until_spent(rx: &mut UnboundedReceiver<SyncEvent>) -> Vec<u16> {
    let mut ports = Vec::new();
    let mut failures = 0;
    while failures < 6 {
        match wait_for(rx, |e| {
            matches!(e, SyncEvent::PortChanged(_) | SyncEvent::StatusChanged(ConnectionStatus::Failed(_)))
        })
        .await
        {
            SyncEvent::PortChanged(port) => ports.push(port),
            SyncEvent::StatusChanged(ConnectionStatus::Failed(reason)) => {
                assert!(reason.is_port_in_use(), "unexpected failure: {reason}");
                failures += 1;
            }
            other => unreachable!("{other:?}"),
        }
    }
    ports
}

// ── Sessions ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_controller_drives_follower() {
    let port = free_port();

    let (follow, mut follow_rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    follow.apply(follower(port)).unwrap();
    wait_for(&mut follow_rx, |e| is_status(e, &ConnectionStatus::Listening)).await;

    let discovery = StaticDiscovery::new(vec![local_peer("Podium", port)]);
    let (control, mut control_rx) = Orchestrator::spawn(Arc::new(discovery), lifecycle_settings());
    control.apply(controller(None)).unwrap();

    wait_for(&mut control_rx, |e| is_status(e, &ConnectionStatus::Connected)).await;
    let named = wait_for(&mut control_rx, |e| {
        matches!(e, SyncEvent::ConnectedPeerChanged(Some(_)))
    })
    .await;
    assert_eq!(named, SyncEvent::ConnectedPeerChanged(Some("Podium".into())));
    wait_for(&mut follow_rx, |e| is_status(e, &ConnectionStatus::Connected)).await;

    control.send(Command::Next).unwrap();
    control.send(Command::Previous).unwrap();

    let first = wait_for(&mut follow_rx, |e| matches!(e, SyncEvent::CommandReceived(_))).await;
    let second = wait_for(&mut follow_rx, |e| matches!(e, SyncEvent::CommandReceived(_))).await;
    assert_eq!(first, SyncEvent::CommandReceived(Command::Next));
    assert_eq!(second, SyncEvent::CommandReceived(Command::Previous));

    control.stop().await.unwrap();
    follow.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_duplicate_dial() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let discovery = Arc::new(StaticDiscovery::new(vec![local_peer("Podium", port)]));

    let (manager, mut rx) = ConnectionManager::spawn(discovery.clone(), lifecycle_settings());
    manager.start_controller(None).unwrap();
    wait_for(&mut rx, |e| {
        matches!(e, ConnectionEvent::StatusChanged(ConnectionStatus::Connected))
    })
    .await;
    let (_first, _) = listener.accept().await.unwrap();

    // Same set twice, in a different internal order the second time.
    discovery.publish(vec![local_peer("Podium", port), local_peer("Zeta", 9)]);
    discovery.publish(vec![local_peer("Zeta", 9), local_peer("Podium", port)]);
    for _ in 0..2 {
        let ev = wait_for(&mut rx, |e| matches!(e, ConnectionEvent::PeersChanged(_))).await;
        let ConnectionEvent::PeersChanged(peers) = ev else { unreachable!() };
        let names: Vec<_> = peers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["Podium", "Zeta"]);
    }

    let second = tokio::time::timeout(QUIET, listener.accept()).await;
    assert!(second.is_err(), "a second dial reached the listener");
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_dial_while_dial_pending() {
    let (slow_addr, _slow, _queued) = saturated_listener().await;
    let alpha = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let alpha_peer = local_peer("alpha", alpha.local_addr().unwrap().port());
    let discovery = Arc::new(StaticDiscovery::new(vec![
        alpha_peer.clone(),
        DiscoveredPeer::new("slow", slow_addr),
    ]));

    let (manager, mut rx) = ConnectionManager::spawn(discovery.clone(), lifecycle_settings());
    manager.start_controller(Some("slow".into())).unwrap();
    wait_for(&mut rx, |e| matches!(e, ConnectionEvent::PeersChanged(p) if p.len() == 2)).await;

    // Without "slow" these would select alpha if anything dialled again.
    discovery.publish(vec![alpha_peer.clone()]);
    wait_for(&mut rx, |e| matches!(e, ConnectionEvent::PeersChanged(p) if p.len() == 1)).await;
    discovery.publish(vec![alpha_peer, local_peer("beta", 9)]);
    wait_for(&mut rx, |e| matches!(e, ConnectionEvent::PeersChanged(p) if p.len() == 2)).await;

    let dialled = tokio::time::timeout(QUIET, alpha.accept()).await;
    assert!(dialled.is_err(), "dialled alpha while the first dial was pending");
    let later = drain(&mut rx).await;
    assert!(
        !later.iter().any(|e| matches!(e, ConnectionEvent::StatusChanged(_))),
        "status moved while the dial was pending: {later:?}"
    );
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_follower_replaces_session() {
    let port = free_port();
    let (manager, mut rx) =
        ConnectionManager::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    manager.start_follower(port.to_string()).unwrap();
    wait_for(&mut rx, |e| {
        matches!(e, ConnectionEvent::StatusChanged(ConnectionStatus::Listening))
    })
    .await;

    let mut old = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let old_name = old.local_addr().unwrap().to_string();
    wait_for(&mut rx, |e| *e == ConnectionEvent::ConnectedPeerChanged(Some(old_name.clone()))).await;

    let mut new = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let new_name = new.local_addr().unwrap().to_string();
    wait_for(&mut rx, |e| *e == ConnectionEvent::ConnectedPeerChanged(Some(new_name.clone()))).await;

    // The replaced session is gone; only the new one is heard.
    let _ = old.write_all(b"NEXT\n").await;
    new.write_all(b"PREV\n").await.unwrap();

    let received = wait_for(&mut rx, |e| matches!(e, ConnectionEvent::CommandReceived(_))).await;
    assert_eq!(received, ConnectionEvent::CommandReceived(Command::Previous));
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_controller_retries_after_dial_failure() {
    let port = free_port();
    let discovery = StaticDiscovery::new(vec![local_peer("Podium", port)]);
    let (manager, mut rx) = ConnectionManager::spawn(Arc::new(discovery), lifecycle_settings());
    manager.start_controller(Some("Podium".into())).unwrap();

    let failed = wait_for(&mut rx, |e| {
        matches!(e, ConnectionEvent::StatusChanged(ConnectionStatus::Failed(_)))
    })
    .await;
    let ConnectionEvent::StatusChanged(ConnectionStatus::Failed(reason)) = failed else {
        unreachable!()
    };
    assert_eq!(reason.kind(), FailureKind::Dial);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    wait_for(&mut rx, |e| {
        matches!(e, ConnectionEvent::StatusChanged(ConnectionStatus::Connected))
    })
    .await;
    let _accepted = listener.accept().await.unwrap();
    manager.stop().await.unwrap();
}

// ── Orchestrator policies ────────────────────────────────────────

#[tokio::test]
async fn test_port_rotation_is_bounded() {
    let (base, _held) = occupy_range(6);
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(follower(base)).unwrap();

    let ports = rotations_until_spent(&mut rx).await;
    assert_eq!(ports, (base + 1..=base + 5).collect::<Vec<_>>());

    let later = drain(&mut rx).await;
    assert!(
        !later.iter().any(|e| matches!(e, SyncEvent::PortChanged(_))),
        "rotation continued past the bound: {later:?}"
    );
}

#[tokio::test]
async fn test_port_rotation_lands_on_free_port() {
    let (base, _held) = loop {
        let (base, held) = occupy_range(1);
        if base < u16::MAX && std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, base + 1)).is_ok() {
            break (base, held);
        }
    };
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(follower(base)).unwrap();

    let moved = wait_for(&mut rx, |e| matches!(e, SyncEvent::PortChanged(_))).await;
    assert_eq!(moved, SyncEvent::PortChanged(base + 1));
    wait_for(&mut rx, |e| is_status(e, &ConnectionStatus::Listening)).await;
    TcpStream::connect((Ipv4Addr::LOCALHOST, base + 1)).await.unwrap();
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn test_rotation_count_restarts_after_listening() {
    let (base, _held) = loop {
        let (base, held) = occupy_range(3);
        if base < u16::MAX - 3 && std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, base + 3)).is_ok() {
            break (base, held);
        }
    };
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(follower(base)).unwrap();

    let mut ports = Vec::new();
    wait_for(&mut rx, |e| {
        if let SyncEvent::PortChanged(port) = e {
            ports.push(*port);
        }
        is_status(e, &ConnectionStatus::Listening)
    })
    .await;
    assert_eq!(ports, vec![base + 1, base + 2, base + 3]);
    orch.stop().await.unwrap();

    // Three rotations were used, but listening reset the count.
    let (second, _held_again) = occupy_range(6);
    orch.apply(follower(second)).unwrap();
    let ports = rotations_until_spent(&mut rx).await;
    assert_eq!(ports, (second + 1..=second + 5).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_reapply_ignores_failure_of_replaced_start() {
    let (taken, _held) = occupy_range(1);
    let port = free_port();
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(follower(taken)).unwrap();
    orch.apply(follower(port)).unwrap();

    let mut seen = Vec::new();
    wait_for(&mut rx, |e| {
        seen.push(e.clone());
        is_status(e, &ConnectionStatus::Listening)
    })
    .await;
    seen.extend(drain(&mut rx).await);

    assert!(
        seen.iter().any(|e| matches!(
            e,
            SyncEvent::StatusChanged(ConnectionStatus::Failed(r)) if r.is_port_in_use()
        )),
        "the first start should have hit the taken port: {seen:?}"
    );
    assert!(
        !seen.iter().any(|e| matches!(e, SyncEvent::PortChanged(_))),
        "recovered a start that was already replaced: {seen:?}"
    );
    TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn test_preference_reset_falls_back_to_first_peer() {
    let alpha = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let beta = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let alpha_peer = local_peer("alpha", alpha.local_addr().unwrap().port());
    let beta_peer = local_peer("beta", beta.local_addr().unwrap().port());

    let discovery = Arc::new(StaticDiscovery::new(vec![alpha_peer.clone(), beta_peer]));
    let (orch, mut rx) = Orchestrator::spawn(discovery.clone(), lifecycle_settings());
    orch.apply(controller(Some("beta"))).unwrap();

    wait_for(&mut rx, |e| *e == SyncEvent::ConnectedPeerChanged(Some("beta".into()))).await;
    let (beta_conn, _) = beta.accept().await.unwrap();

    discovery.publish(vec![alpha_peer.clone()]);
    wait_for(&mut rx, |e| *e == SyncEvent::PreferredPeerChanged(None)).await;
    discovery.publish(vec![alpha_peer]);
    let later = drain(&mut rx).await;
    assert!(
        !later.iter().any(|e| matches!(e, SyncEvent::PreferredPeerChanged(_))),
        "preference cleared twice: {later:?}"
    );

    // Losing beta sends the reconnect to the first peer in sorted order.
    drop(beta_conn);
    wait_for(&mut rx, |e| *e == SyncEvent::ConnectedPeerChanged(Some("alpha".into()))).await;
    let _alpha_conn = alpha.accept().await.unwrap();
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn test_multicast_controller_restarts_browsing() {
    let beacon_port = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let discovery = MulticastDiscovery::new(MulticastConfig {
        port: beacon_port,
        ..MulticastConfig::default()
    });
    let (orch, mut rx) = Orchestrator::spawn(Arc::new(discovery), lifecycle_settings());
    orch.apply(controller(None)).unwrap();
    wait_for(&mut rx, |e| is_status(e, &ConnectionStatus::Connecting)).await;

    // Both restart the controller while the previous browse is winding down.
    orch.select_peer(Some("Podium".into())).unwrap();
    orch.apply(controller(Some("Podium"))).unwrap();

    let seen = drain(&mut rx).await;
    assert!(
        !seen.iter().any(|e| matches!(e, SyncEvent::StatusChanged(ConnectionStatus::Failed(_)))),
        "restart failed: {seen:?}"
    );
    let last_status = seen
        .iter()
        .rev()
        .find(|e| matches!(e, SyncEvent::StatusChanged(_)));
    assert_eq!(
        last_status,
        Some(&SyncEvent::StatusChanged(ConnectionStatus::Connecting)),
        "controller did not resume browsing: {seen:?}"
    );
    orch.stop().await.unwrap();
}

// ── Stop and configuration ───────────────────────────────────────

/// After `stop`, subscribers see a disconnected, empty, unnamed session.
async fn assert_stopped(orch: &Orchestrator, rx: &mut UnboundedReceiver<SyncEvent>) {
    orch.stop().await.unwrap();
    wait_for(rx, |e| is_status(e, &ConnectionStatus::Disconnected)).await;
    wait_for(rx, |e| matches!(e, SyncEvent::PeersChanged(p) if p.is_empty())).await;
    wait_for(rx, |e| *e == SyncEvent::ConnectedPeerChanged(None)).await;
}

#[tokio::test]
async fn test_stop_from_any_state() {
    // Connecting: nothing to dial.
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(controller(None)).unwrap();
    wait_for(&mut rx, |e| is_status(e, &ConnectionStatus::Connecting)).await;
    assert_stopped(&orch, &mut rx).await;
    // Already stopped.
    assert_stopped(&orch, &mut rx).await;

    // Listening.
    let port = free_port();
    orch.apply(follower(port)).unwrap();
    wait_for(&mut rx, |e| is_status(e, &ConnectionStatus::Listening)).await;

    // Connected.
    let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    wait_for(&mut rx, |e| is_status(e, &ConnectionStatus::Connected)).await;
    assert_stopped(&orch, &mut rx).await;

    // Failed.
    orch.apply(follower(0)).unwrap();
    wait_for(&mut rx, |e| matches!(e, SyncEvent::StatusChanged(ConnectionStatus::Failed(_)))).await;
    assert_stopped(&orch, &mut rx).await;
}

#[tokio::test]
async fn test_invalid_port_fails_without_binding() {
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(SessionSettings {
        role: Role::Follower,
        port: "not-a-port".into(),
        preferred_peer: None,
    })
    .unwrap();

    let failed = wait_for(&mut rx, |e| {
        matches!(e, SyncEvent::StatusChanged(ConnectionStatus::Failed(_)))
    })
    .await;
    let SyncEvent::StatusChanged(status) = failed else { unreachable!() };
    assert_eq!(status.to_string(), "Error: Invalid port");
    assert_eq!(status.failure().map(|r| r.kind()), Some(FailureKind::Config));

    // A config error is not a port conflict: nothing rotates.
    let later = drain(&mut rx).await;
    assert!(!later.iter().any(|e| matches!(e, SyncEvent::PortChanged(_))));
}

#[tokio::test]
async fn test_follower_trigger_test_delivers_locally() {
    let (orch, mut rx) =
        Orchestrator::spawn(Arc::new(StaticDiscovery::default()), lifecycle_settings());
    orch.apply(follower(free_port())).unwrap();
    wait_for(&mut rx, |e| is_status(e, &ConnectionStatus::Listening)).await;

    orch.trigger_test(Command::Next).unwrap();
    let got = wait_for(&mut rx, |e| matches!(e, SyncEvent::CommandReceived(_))).await;
    assert_eq!(got, SyncEvent::CommandReceived(Command::Next));
    orch.stop().await.unwrap();
}
