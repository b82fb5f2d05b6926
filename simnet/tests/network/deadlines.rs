use std::time::Duration;

use simnet::{SimNetError, SimNetwork};
use tokio::time::Instant;

use super::connect;

/// A read with nothing to match times out at its deadline on the virtual clock.
#[tokio::test(start_paused = true)]
async fn test_read_deadline_times_out() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, _accepted) = connect(&net, "srv", "cli").await;

    let start = Instant::now();
    conn.set_read_deadline(Some(start + Duration::from_secs(1)))
        .unwrap();

    let mut buf = [0u8; 8];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(err, SimNetError::Timeout);
    assert!(err.is_timeout());
    assert!(err.is_temporary());
    assert!(Instant::now() >= start + Duration::from_secs(1));
}

/// An expired deadline keeps failing operations until it is replaced.
#[tokio::test(start_paused = true)]
async fn test_deadline_latches_until_cleared() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(500)))
        .unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await, Err(SimNetError::Timeout));

    let expired_at = Instant::now();
    assert_eq!(conn.read(&mut buf).await, Err(SimNetError::Timeout));
    assert_eq!(Instant::now(), expired_at);

    conn.set_read_deadline(None).unwrap();
    let writer = tokio::spawn(async move {
        accepted.write_all(b"late").await.unwrap();
        accepted
    });
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"late");
    let _accepted = writer.await.unwrap();
}

/// Moving a deadline further out before it fires replaces the old one.
#[tokio::test(start_paused = true)]
async fn test_rearmed_deadline_replaces_previous() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    let start = Instant::now();
    conn.set_read_deadline(Some(start + Duration::from_secs(1)))
        .unwrap();
    conn.set_read_deadline(Some(start + Duration::from_secs(3)))
        .unwrap();

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        accepted.write_all(b"in time").await.unwrap();
        accepted
    });

    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"in time");
    assert!(Instant::now() >= start + Duration::from_secs(2));
    let _accepted = writer.await.unwrap();
}

/// A write that timed out is never delivered to a later reader.
#[tokio::test(start_paused = true)]
async fn test_timed_out_write_is_not_delivered() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    conn.set_write_deadline(Some(Instant::now() + Duration::from_secs(1)))
        .unwrap();
    assert_eq!(conn.write(b"stale").await, Err(SimNetError::Timeout));
    conn.set_write_deadline(None).unwrap();

    let writer = tokio::spawn(async move {
        conn.write_all(b"fresh").await.unwrap();
        conn
    });
    let msg = accepted.read_message().await.unwrap();
    assert_eq!(msg.payload(), b"fresh");
    let _conn = writer.await.unwrap();

    let metrics = net.metrics().await.unwrap();
    assert_eq!(metrics.matched, 1);
    assert_eq!(metrics.abandoned, 1);
}

/// A deadline already in the past fails immediately, in both directions.
#[tokio::test(start_paused = true)]
async fn test_past_deadline_fails_immediately() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, _accepted) = connect(&net, "srv", "cli").await;

    let now = Instant::now();
    conn.set_deadline(Some(now)).unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(conn.write(b"x").await, Err(SimNetError::Timeout));
    assert_eq!(conn.read(&mut buf).await, Err(SimNetError::Timeout));
    assert_eq!(Instant::now(), now);
}

/// Read and write deadlines are independent.
#[tokio::test(start_paused = true)]
async fn test_write_deadline_does_not_affect_reads() {
    let net = SimNetwork::new();
    let (_listener, _client, conn, accepted) = connect(&net, "srv", "cli").await;

    conn.set_write_deadline(Some(Instant::now() + Duration::from_secs(1)))
        .unwrap();

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        accepted.write_all(b"slow").await.unwrap();
        accepted
    });

    let mut buf = [0u8; 8];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"slow");
    assert_eq!(conn.write(b"late").await, Err(SimNetError::Timeout));
    let _accepted = writer.await.unwrap();
}
