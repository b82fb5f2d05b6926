use std::time::Duration;

use simnet::{Listener, Role, SimNetConfig, SimNetError, SimNetwork};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use super::{connect, init_tracing, wait_for_queued_reads};

/// A client writes a request, reads the server's answer, then sees the
/// server's close as end of stream.
#[tokio::test(start_paused = true)]
async fn test_ping_pong() {
    init_tracing();
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "S", "C").await;

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        accepted.write_all(b"pong\n").await.unwrap();
        accepted.close().unwrap();
    });

    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong\n");
    assert_eq!(conn.read(&mut buf).await, Ok(0));

    server.await.unwrap();
    net.shutdown().await;
}

/// Echo server: reply, close, and let the client observe end of stream,
/// then run a one-second timer on the client's node.
#[tokio::test(start_paused = true)]
async fn test_echo_server_replies_then_closes() {
    init_tracing();
    let net = SimNetwork::new();
    let listener = net.new_server("srv_1").listen().await.unwrap();
    assert_eq!(listener.addr().url(), "simnet://srv_1");

    let server = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        let reply = format!(
            "hi back from echo server, I saw '{}'\n",
            String::from_utf8_lossy(&buf[..n])
        );
        conn.write_all(reply.as_bytes()).await.unwrap();
        conn.close().unwrap();
    });

    let client = net.new_client("cli_1");
    let conn = client.dial("srv_1").await.unwrap();
    assert_eq!(conn.local_addr().addr(), "cli_1");
    assert!(conn.local_addr().is_client());
    assert_eq!(
        client.remote_addr().map(|addr| addr.url()),
        Some("simnet://srv_1".to_string())
    );

    conn.write_all(b"hello simnet").await.unwrap();
    let mut buf = vec![0u8; 1024];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(
        &buf[..n],
        b"hi back from echo server, I saw 'hello simnet'\n"
    );
    assert_eq!(conn.read(&mut buf).await, Ok(0));
    assert_eq!(conn.read(&mut buf).await, Ok(0));
    server.await.unwrap();

    let start = Instant::now();
    let timer = client.new_timer(Duration::from_secs(1)).unwrap();
    let fired_at = timer.wait().await.unwrap();
    assert!(fired_at >= start + Duration::from_secs(1));
    assert!(timer.has_fired());

    net.shutdown().await;
}

/// A message larger than the read buffer is served across several reads,
/// in order, without issuing new network reads.
#[tokio::test(start_paused = true)]
async fn test_partial_reads_keep_leftover_bytes() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        conn.write_all(b"0123456789").await.unwrap();
        conn
    });

    let mut buf = [0u8; 4];
    let mut chunks = Vec::new();
    for _ in 0..3 {
        let n = accepted.read(&mut buf).await.unwrap();
        chunks.push(buf[..n].to_vec());
    }
    assert_eq!(chunks, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);

    let metrics = net.metrics().await.unwrap();
    assert_eq!(metrics.matched, 1);
    let _conn = writer.await.unwrap();
}

/// Writes larger than the per-write cap are split by the caller's loop.
#[tokio::test(start_paused = true)]
async fn test_writes_are_capped() {
    let net = SimNetwork::new_with_config(SimNetConfig::small_frames(4)).unwrap();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        let taken = conn.write(b"abcdefghij").await.unwrap();
        assert_eq!(taken, 4);
        conn.write_all(b"efghij").await.unwrap();
        conn
    });

    let mut messages = Vec::new();
    for _ in 0..3 {
        messages.push(accepted.read_message().await.unwrap().into_payload());
    }
    assert_eq!(
        messages,
        vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
    );
    let _conn = writer.await.unwrap();
}

/// Messages carry increasing serial numbers assigned by the dispatcher.
#[tokio::test(start_paused = true)]
async fn test_messages_are_stamped_in_order() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        conn.send_message(b"first".to_vec()).await.unwrap();
        conn.send_message(b"second".to_vec()).await.unwrap();
        conn
    });

    let first = accepted.read_message().await.unwrap();
    let second = accepted.read_message().await.unwrap();
    assert_eq!(first.payload(), b"first");
    assert_eq!(second.payload(), b"second");
    assert!(first.serial() > 0);
    assert!(second.serial() > first.serial());
    let _conn = writer.await.unwrap();
}

/// The connection works through tokio's io traits: writes are split by the
/// per-write cap, shutdown half-closes, and `read_to_end` stops at end of
/// stream.
#[tokio::test(start_paused = true)]
async fn test_tokio_io_traits() {
    let net = SimNetwork::new_with_config(SimNetConfig::small_frames(4)).unwrap();
    let (_listener, _client, mut conn, mut accepted) = connect(&net, "srv", "cli").await;
    let request = b"hello over tokio io";

    let server = tokio::spawn(async move {
        let mut received = vec![0u8; request.len()];
        accepted.read_exact(&mut received).await.unwrap();
        AsyncWriteExt::write_all(&mut accepted, &received).await.unwrap();
        accepted.shutdown().await.unwrap();
        received
    });

    AsyncWriteExt::write_all(&mut conn, request).await.unwrap();
    conn.flush().await.unwrap();
    let mut echoed = Vec::new();
    conn.read_to_end(&mut echoed).await.unwrap();

    assert_eq!(echoed, request);
    assert_eq!(server.await.unwrap(), request);
}

/// `tokio::io::copy` drains a connection until the writer closes it.
#[tokio::test(start_paused = true)]
async fn test_io_copy_until_close() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, mut accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        conn.write_all(b"copied ").await.unwrap();
        conn.write_all(b"through").await.unwrap();
    });

    let mut sink = Vec::new();
    let copied = tokio::io::copy(&mut accepted, &mut sink).await.unwrap();
    assert_eq!(copied, 14);
    assert_eq!(sink, b"copied through");
    writer.await.unwrap();
}

/// Io trait errors keep their kind: a passed read deadline is `TimedOut`.
#[tokio::test(start_paused = true)]
async fn test_io_errors_map_to_kinds() {
    let net = SimNetwork::new();
    let (_listener, _client, mut conn, _accepted) = connect(&net, "srv", "cli").await;

    conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)))
        .unwrap();
    let mut buf = [0u8; 8];
    let err = AsyncReadExt::read(&mut conn, &mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}

/// Data written before a close is read before the end of stream.
#[tokio::test(start_paused = true)]
async fn test_queued_data_precedes_eof() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let writer = tokio::spawn(async move {
        conn.write_all(b"last words").await.unwrap();
        conn.close().unwrap();
    });

    let msg = accepted.read_message().await.unwrap();
    assert_eq!(msg.payload(), b"last words");
    writer.await.unwrap();

    assert_eq!(accepted.read_message().await, Err(SimNetError::Eof));
    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf).await, Ok(0));
}

/// Closing twice is fine; using a closed side is not.
#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    conn.close().unwrap();
    conn.close().unwrap();
    assert!(conn.is_closed());

    let mut buf = [0u8; 8];
    assert_eq!(conn.write(b"x").await, Err(SimNetError::ClosedConnection));
    assert_eq!(conn.read(&mut buf).await, Ok(0));

    // The peer sees end of stream and cannot write to a closed side.
    assert_eq!(accepted.read(&mut buf).await, Ok(0));
    assert_eq!(accepted.write(b"x").await, Err(SimNetError::Eof));
}

/// A read parked on the server resolves with end of stream when the client
/// closes.
#[tokio::test(start_paused = true)]
async fn test_close_wakes_parked_reader() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        accepted.read(&mut buf).await
    });
    wait_for_queued_reads(&net, 1).await;

    drop(conn);
    assert_eq!(reader.await.unwrap(), Ok(0));
}

/// Messages above the dispatcher limit are rejected outright.
#[tokio::test(start_paused = true)]
async fn test_oversized_message_is_rejected() {
    let config = SimNetConfig::small_frames(8).with_max_message_size(16);
    let net = SimNetwork::new_with_config(config).unwrap();
    let (_listener, _client, conn, _accepted) = connect(&net, "srv", "cli").await;

    assert_eq!(
        conn.send_message(vec![0u8; 32]).await,
        Err(SimNetError::MessageTooLong { len: 32, max: 16 })
    );
}

/// Dialing an address nobody listens at is refused.
#[tokio::test(start_paused = true)]
async fn test_dial_unknown_address_is_refused() {
    let net = SimNetwork::new();
    let result = net.new_client("cli").dial("nobody").await;
    assert!(matches!(result, Err(SimNetError::Refused(addr)) if addr == "nobody"));
}

/// Only one live listener may own an address.
#[tokio::test(start_paused = true)]
async fn test_listen_twice_is_address_in_use() {
    let net = SimNetwork::new();
    let _listener = net.new_server("srv").listen().await.unwrap();
    let result = net.new_server("srv").listen().await;
    assert!(matches!(result, Err(SimNetError::AddressInUse(_))));
}

#[tokio::test]
#[should_panic(expected = "dial requires a server address")]
async fn test_dial_without_address_panics() {
    let net = SimNetwork::new();
    let _ = net.new_client("cli").dial("").await;
}

/// Shutting the simulation down resolves pending operations instead of
/// leaving them hanging.
#[tokio::test(start_paused = true)]
async fn test_shutdown_resolves_pending_reads() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, _accepted) = connect(&net, "srv", "cli").await;

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        conn.read(&mut buf).await
    });
    wait_for_queued_reads(&net, 1).await;

    net.shutdown().await;
    assert_eq!(reader.await.unwrap(), Err(SimNetError::Shutdown));
    assert!(net.is_shutdown());

    let late = net.new_client("late").dial("srv").await;
    assert!(matches!(late, Err(SimNetError::Shutdown)));
}

/// Metrics reflect registered nodes, connections and matches.
#[tokio::test(start_paused = true)]
async fn test_metrics_snapshot() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let mut buf = [0u8; 8];
    let (written, read) = tokio::join!(conn.write_all(b"hi"), accepted.read(&mut buf));
    written.unwrap();
    assert_eq!(read, Ok(2));

    let metrics = net.metrics().await.unwrap();
    assert_eq!(metrics.nodes.len(), 2);
    assert_eq!(metrics.node("srv").map(|n| n.role), Some(Role::Server));
    assert_eq!(metrics.node("cli").map(|n| n.role), Some(Role::Client));
    assert_eq!(metrics.connections, 2);
    assert_eq!(metrics.matched, 1);
    assert_eq!(metrics.queued_sends, 0);
    assert_eq!(metrics.queued_reads, 0);
}
