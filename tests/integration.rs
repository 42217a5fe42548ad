// ABOUTME: End-to-end session scenarios over `tokio::io::duplex`, no real sockets needed
// ABOUTME: Mirrors the teacher's loopback-style integration tests one scenario per test

use muxsession::codec::{Command, FrameHeader};
use muxsession::session::{Session, SessionConfig};
use muxsession::Error;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const DUPLEX_BUF: usize = 4096;

fn paired_sessions(
    client_buffer: u32,
    server_buffer: u32,
) -> (Session<DuplexStream>, Session<DuplexStream>) {
    let (a, b) = tokio::io::duplex(DUPLEX_BUF);
    let client = Session::new(
        a,
        SessionConfig::new(true)
            .max_receive_buffer(client_buffer)
            .keepalive_disabled(true),
    );
    let server = Session::new(
        b,
        SessionConfig::new(false)
            .max_receive_buffer(server_buffer)
            .keepalive_disabled(true),
    );
    (client, server)
}

#[tokio::test]
async fn open_assigns_odd_id_accept_sees_same_stream() {
    let (client, server) = paired_sessions(256 * 1024, 256 * 1024);

    let (client_stream, server_stream) =
        tokio::join!(client.open_stream(), server.accept_stream());
    let client_stream = client_stream.unwrap();
    let server_stream = server_stream.unwrap();

    assert_eq!(client_stream.id(), 1);
    assert_eq!(server_stream.id(), 1);
    assert_eq!(client.num_streams(), 1);
    assert_eq!(server.num_streams(), 1);

    let (client_stream2, server_stream2) =
        tokio::join!(client.open_stream(), server.accept_stream());
    assert_eq!(client_stream2.unwrap().id(), 3);
    assert_eq!(server_stream2.unwrap().id(), 3);
}

#[tokio::test]
async fn data_flows_and_peer_window_recovers_after_consumer_read() {
    // A tiny receive buffer (5 bytes, matching the 5-byte payload) forces the client's
    // peer-window accounting to hit zero after the first write, so a second write only
    // completes once the server's read path has reported the window update back.
    let (client, server) = paired_sessions(5, 5);

    let (client_stream, server_stream) =
        tokio::join!(client.open_stream(), server.accept_stream());
    let mut client_stream = client_stream.unwrap();
    let mut server_stream = server_stream.unwrap();

    client_stream.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    server_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    // The server's poll_read reports the new consumed count via a detached update send;
    // without it this second write would block forever on an exhausted window.
    timeout(Duration::from_millis(500), client_stream.write_all(b"world"))
        .await
        .expect("second write timed out waiting for window recovery")
        .unwrap();

    let mut buf2 = [0u8; 5];
    server_stream.read_exact(&mut buf2).await.unwrap();
    assert_eq!(&buf2, b"world");
}

#[tokio::test]
async fn session_wide_bucket_gates_new_frames_until_consumer_drains() {
    // The server's receive bucket is sized to exactly the first write; once it lands the
    // bucket reads zero and the receiver parks before reading anything else off the wire,
    // including a second stream's opening frame. Opening a second client stream before the
    // first payload is drained proves the parked state; draining it unblocks the pending
    // accept.
    let (client, server) = paired_sessions(256 * 1024, 6);

    let (client_stream_a, server_stream_a) =
        tokio::join!(client.open_stream(), server.accept_stream());
    let mut client_stream_a = client_stream_a.unwrap();
    let mut server_stream_a = server_stream_a.unwrap();

    client_stream_a.write_all(b"123456").await.unwrap();
    // Give the receiver a moment to ingest the payload and drive the bucket to zero.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let open_b = client.open_stream();
    tokio::pin!(open_b);
    let accept_b = server.accept_stream();
    tokio::pin!(accept_b);

    let blocked = timeout(Duration::from_millis(100), &mut accept_b).await;
    assert!(
        blocked.is_err(),
        "accept should be blocked on the exhausted session-wide bucket"
    );

    let mut drained = [0u8; 6];
    server_stream_a.read_exact(&mut drained).await.unwrap();
    assert_eq!(&drained, b"123456");

    let (client_stream_b, server_stream_b) = tokio::join!(open_b, accept_b);
    assert_eq!(client_stream_b.unwrap().id(), 3);
    assert_eq!(server_stream_b.unwrap().id(), 3);
}

#[tokio::test]
async fn fin_closes_the_read_side_without_tearing_down_the_session() {
    let (client, server) = paired_sessions(256 * 1024, 256 * 1024);

    let (client_stream, server_stream) =
        tokio::join!(client.open_stream(), server.accept_stream());
    let mut client_stream = client_stream.unwrap();
    let mut server_stream = server_stream.unwrap();

    client_stream.shutdown().await.unwrap();

    let mut buf = Vec::new();
    let n = server_stream.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[tokio::test]
async fn mismatched_header_version_closes_with_protocol_error() {
    let (mut peer, local) = tokio::io::duplex(DUPLEX_BUF);
    let server = Session::new(local, SessionConfig::new(false).keepalive_disabled(true));

    let bad_header = FrameHeader {
        version: 2,
        command: Command::Syn,
        length: 0,
        stream_id: 1,
    };
    let mut wire = bytes::BytesMut::new();
    bad_header.encode(&mut wire);
    peer.write_all(&wire).await.unwrap();

    timeout(Duration::from_millis(500), server.close_notified())
        .await
        .expect("session should close after a malformed header");

    assert!(server.is_closed());
    assert!(matches!(server.terminal_error(), Some(Error::InvalidProtocol(_))));
}

#[tokio::test(start_paused = true)]
async fn keepalive_silence_does_not_close_with_a_non_positive_bucket() {
    let (_peer, local) = tokio::io::duplex(DUPLEX_BUF);
    let session = Session::new(
        local,
        SessionConfig::new(false)
            .max_receive_buffer(0)
            .keepalive_interval(Duration::from_millis(30))
            .keepalive_timeout(Duration::from_millis(60)),
    );

    tokio::time::advance(Duration::from_millis(500)).await;

    assert!(
        !session.is_closed(),
        "an exhausted bucket makes silence ambiguous; the session must not self-close"
    );
}

#[tokio::test(start_paused = true)]
async fn keepalive_silence_closes_with_a_positive_bucket() {
    let (_peer, local) = tokio::io::duplex(DUPLEX_BUF);
    let session = Session::new(
        local,
        SessionConfig::new(false)
            .max_receive_buffer(4096)
            .keepalive_interval(Duration::from_millis(30))
            .keepalive_timeout(Duration::from_millis(60)),
    );

    tokio::time::advance(Duration::from_millis(500)).await;

    assert!(
        session.is_closed(),
        "peer silence past the timeout with buffer room available should close the session"
    );
}
