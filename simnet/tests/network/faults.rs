use std::time::Duration;

use simnet::{Alteration, Listener, NodeState, SimNetError, SimNetwork};

use super::{connect, init_tracing, wait_for_queued_reads, wait_for_queued_sends};

/// SHUTDOWN twice leaves the node shut down without error.
#[tokio::test(start_paused = true)]
async fn test_shutdown_is_idempotent() {
    let net = SimNetwork::new();
    let _listener = net.new_server("srv").listen().await.unwrap();

    let first = net.alter_host("srv", Alteration::Shutdown).await.unwrap();
    let second = net.alter_host("srv", Alteration::Shutdown).await.unwrap();
    assert_eq!(first.state, NodeState::Shutdown);
    assert_eq!(second, first);
}

/// Operations against a shut-down server fail instead of hanging.
#[tokio::test(start_paused = true)]
async fn test_server_shutdown_fails_client_operations() {
    init_tracing();
    let net = SimNetwork::new();
    let (listener, _client, conn, _accepted) = connect(&net, "srv", "cli").await;

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        let pending = conn.read(&mut buf).await;
        (conn, pending)
    });
    wait_for_queued_reads(&net, 1).await;

    net.alter_host("srv", Alteration::Shutdown).await.unwrap();

    let (conn, pending) = reader.await.unwrap();
    assert_eq!(pending, Err(SimNetError::Shutdown));
    assert_eq!(conn.write(b"anyone?").await, Err(SimNetError::Shutdown));
    assert_eq!(listener.accept().await.err(), Some(SimNetError::Shutdown));

    let metrics = net.metrics().await.unwrap();
    assert_eq!(metrics.failed_by_alteration, 1);
    assert!(matches!(
        net.new_client("other").dial("srv").await,
        Err(SimNetError::Shutdown)
    ));
}

/// A write parked on the client fails once the server it targets shuts down.
#[tokio::test(start_paused = true)]
async fn test_server_shutdown_fails_pending_write() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, _accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        let pending = conn.write(b"nobody reads this").await;
        (conn, pending)
    });
    wait_for_queued_sends(&net, 1).await;

    net.alter_host("srv", Alteration::Shutdown).await.unwrap();

    let (_conn, pending) = writer.await.unwrap();
    assert_eq!(pending, Err(SimNetError::Shutdown));
    assert!(pending.unwrap_err().is_shutdown());
    assert_eq!(net.metrics().await.unwrap().queued_sends, 0);
}

/// A write queued before a partition survives it and is delivered once the
/// partition lifts.
#[tokio::test(start_paused = true)]
async fn test_queued_write_survives_partition() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        let written = conn.write_all(b"before the cut").await;
        (conn, written)
    });
    wait_for_queued_sends(&net, 1).await;

    net.alter_host("srv", Alteration::Partition).await.unwrap();
    assert_eq!(net.metrics().await.unwrap().queued_sends, 1);
    assert!(!writer.is_finished());

    net.alter_host("srv", Alteration::Unpartition).await.unwrap();

    let mut buf = [0u8; 32];
    let n = accepted.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"before the cut");
    let (_conn, written) = writer.await.unwrap();
    assert_eq!(written, Ok(()));
}

/// A partitioned node keeps its queued operations but rejects new ones
/// until it is unpartitioned.
#[tokio::test(start_paused = true)]
async fn test_partition_keeps_queued_and_rejects_new() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    });
    wait_for_queued_reads(&net, 1).await;

    let info = net.alter_host("srv", Alteration::Partition).await.unwrap();
    assert_eq!(info.state, NodeState::Partitioned);
    // Idempotent.
    net.alter_host("srv", Alteration::Partition).await.unwrap();

    let rejected = accepted.write(b"early").await;
    assert!(matches!(rejected, Err(SimNetError::Partitioned(_))));
    assert!(rejected.unwrap_err().is_retryable());
    assert_eq!(net.metrics().await.unwrap().queued_reads, 1);

    let info = net.alter_host("srv", Alteration::Unpartition).await.unwrap();
    assert_eq!(info.state, NodeState::Active);
    net.alter_host("srv", Alteration::Unpartition).await.unwrap();

    accepted.write_all(b"late").await.unwrap();
    assert_eq!(reader.await.unwrap(), b"late".to_vec());
}

/// Dialing a partitioned server fails with a partition error.
#[tokio::test(start_paused = true)]
async fn test_dial_into_partition_fails() {
    let net = SimNetwork::new();
    let _listener = net.new_server("srv").listen().await.unwrap();
    net.alter_host("srv", Alteration::Partition).await.unwrap();

    let result = net.new_client("cli").dial("srv").await;
    assert!(matches!(result, Err(SimNetError::Partitioned(addr)) if addr == "srv"));
}

/// A severed pair cannot talk, while other pairs are unaffected.
#[tokio::test(start_paused = true)]
async fn test_pair_partition_only_cuts_that_pair() {
    let net = SimNetwork::new();
    let listener = net.new_server("srv").listen().await.unwrap();
    let c1 = net.new_client("c1");
    let c2 = net.new_client("c2");
    let conn1 = c1.dial("srv").await.unwrap();
    let accepted1 = listener.accept().await.unwrap();
    let conn2 = c2.dial("srv").await.unwrap();
    let accepted2 = listener.accept().await.unwrap();

    net.partition_pair("srv", "c1").await.unwrap();

    assert!(matches!(
        conn1.write(b"blocked").await,
        Err(SimNetError::Partitioned(addr)) if addr == "srv"
    ));
    let mut buf = [0u8; 16];
    let (written, read) = tokio::join!(conn2.write_all(b"through"), accepted2.read(&mut buf));
    written.unwrap();
    assert_eq!(&buf[..read.unwrap()], b"through");

    net.heal_partition("c1", "srv").await.unwrap();
    net.heal_partition("c1", "srv").await.unwrap();

    let (written, read) = tokio::join!(conn1.write_all(b"healed"), accepted1.read(&mut buf));
    written.unwrap();
    assert_eq!(&buf[..read.unwrap()], b"healed");
}

/// Pairwise cuts describe the link, so they outlive a restart of either end.
#[tokio::test(start_paused = true)]
async fn test_pair_partition_survives_restart() {
    let net = SimNetwork::new();
    let server = net.new_server("srv");
    let _listener = server.listen().await.unwrap();
    net.partition_pair("cli", "srv").await.unwrap();

    net.alter_host("srv", Alteration::Restart).await.unwrap();
    let _relistened = server.listen().await.unwrap();

    let blocked = net.new_client("cli").dial("srv").await;
    assert!(matches!(blocked, Err(SimNetError::Partitioned(_))));

    let other = net.new_client("other").dial("srv").await;
    assert!(other.is_ok());
}

/// RESTART replaces the identity: the old one stays dead, the new one can
/// be claimed by listening again.
#[tokio::test(start_paused = true)]
async fn test_restart_creates_fresh_identity() {
    init_tracing();
    let net = SimNetwork::new();
    let server = net.new_server("srv");
    let old_listener = server.listen().await.unwrap();
    let old = old_listener.node();

    let fresh = net.alter_host("srv", Alteration::Restart).await.unwrap();
    assert_ne!(fresh.id, old);
    assert_eq!(fresh.state, NodeState::Active);
    assert_eq!(fresh.generation, 1);
    assert_eq!(old_listener.accept().await.err(), Some(SimNetError::Shutdown));

    // The stale identity never comes back.
    let current = net.alter_node(old, Alteration::Restart).await.unwrap();
    assert_eq!(current.id, fresh.id);
    let stale = net.alter_node(old, Alteration::Unpartition).await.unwrap();
    assert_eq!(stale.state, NodeState::Shutdown);

    let listener = server.listen().await.unwrap();
    assert_eq!(listener.node(), fresh.id);
    assert_eq!(server.node(), Some(fresh.id));

    let conn = net.new_client("cli").dial("srv").await.unwrap();
    let accepted = listener.accept().await.unwrap();
    let mut buf = [0u8; 8];
    let (written, read) = tokio::join!(conn.write_all(b"again"), accepted.read(&mut buf));
    written.unwrap();
    assert_eq!(&buf[..read.unwrap()], b"again");

    let metrics = net.metrics().await.unwrap();
    let generations: Vec<_> = metrics
        .nodes
        .iter()
        .filter(|node| node.name == "srv")
        .map(|node| (node.generation, node.state))
        .collect();
    assert_eq!(
        generations,
        vec![(0, NodeState::Shutdown), (1, NodeState::Active)]
    );
}

/// A client whose node was restarted stays failed; its old connections
/// report shutdown.
#[tokio::test(start_paused = true)]
async fn test_restarted_client_handles_stay_failed() {
    let net = SimNetwork::new();
    let (_listener, client, conn, _accepted) = connect(&net, "srv", "cli").await;

    net.alter_host("cli", Alteration::Restart).await.unwrap();

    assert_eq!(conn.write(b"x").await, Err(SimNetError::Shutdown));
    assert!(matches!(
        client.dial("srv").await,
        Err(SimNetError::Shutdown)
    ));
}

/// Timers anchored to a node die with it.
#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_node_timers() {
    let net = SimNetwork::new();
    let listener = net.new_server("srv").listen().await.unwrap();
    let timer = listener.new_timer(Duration::from_secs(10)).unwrap();

    Listener::close(&listener).await.unwrap();
    Listener::close(&listener).await.unwrap();

    assert_eq!(timer.wait().await, Err(SimNetError::Shutdown));
    assert!(!timer.has_fired());
}

/// Closing a listener frees the address for a new one.
#[tokio::test(start_paused = true)]
async fn test_relisten_after_close() {
    let net = SimNetwork::new();
    let server = net.new_server("srv");
    let first = server.listen().await.unwrap();
    server.close().await.unwrap();

    let second = server.listen().await.unwrap();
    assert_ne!(first.node(), second.node());
    assert!(net.new_client("cli").dial("srv").await.is_ok());
}

/// Dropping a listener without closing it frees the address, and the
/// connections it already accepted keep working.
#[tokio::test(start_paused = true)]
async fn test_relisten_after_listener_drop() {
    let net = SimNetwork::new();
    let (listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;
    let node = listener.node();
    drop(listener);

    let refused = net.new_client("early").dial("srv").await;
    assert!(matches!(refused, Err(SimNetError::Refused(addr)) if addr == "srv"));

    let relistened = net.new_server("srv").listen().await.unwrap();
    assert_eq!(relistened.node(), node);
    assert!(matches!(
        net.new_server("srv").listen().await,
        Err(SimNetError::AddressInUse(_))
    ));

    let late = net.new_client("late");
    let fresh = late.dial("srv").await.unwrap();
    let fresh_accepted = relistened.accept().await.unwrap();
    let mut buf = [0u8; 16];
    let (written, read) = tokio::join!(fresh.write_all(b"new"), fresh_accepted.read(&mut buf));
    written.unwrap();
    assert_eq!(&buf[..read.unwrap()], b"new");

    let (written, read) = tokio::join!(conn.write_all(b"old"), accepted.read(&mut buf));
    written.unwrap();
    assert_eq!(&buf[..read.unwrap()], b"old");
}

#[tokio::test(start_paused = true)]
async fn test_alter_unknown_host() {
    let net = SimNetwork::new();
    let result = net.alter_host("ghost", Alteration::Partition).await;
    assert!(matches!(result, Err(SimNetError::UnknownHost(addr)) if addr == "ghost"));
}
