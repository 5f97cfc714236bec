#![cfg(unix)]

use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vchan::{Channel, ChannelConfig, ChannelError, ConnectionState, Vchan};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/vchan-buf-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn test_config(tag: &str) -> ChannelConfig {
    ChannelConfig {
        socket_dir: unique_temp_dir(tag),
        ..ChannelConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

fn cleanup(config: &ChannelConfig) {
    let _ = std::fs::remove_dir_all(&config.socket_dir);
}

fn fd_readable(fd: RawFd) -> bool {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
    rc > 0 && fds[0].revents & libc::POLLIN != 0
}

#[test]
fn server_starts_waiting_then_connects() {
    let config = test_config("statewalk");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");
    assert_eq!(server.state(), ConnectionState::Waiting);

    let peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    server
        .wait_for_state(ConnectionState::Connected)
        .expect("server should observe the peer");

    drop(peer);
    server
        .wait_for_state(ConnectionState::Disconnected)
        .expect("server should observe the departure");

    // A new peer attaches without the channel being reconstructed.
    let _peer = UnixStream::connect(server.socket_path()).expect("second peer should connect");
    server
        .wait_for_state(ConnectionState::Connected)
        .expect("server should observe the second peer");

    cleanup(&config);
}

#[test]
fn recv_returns_bytes_written_by_peer() {
    let config = test_config("recv");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    peer.write_all(b"Hello World")
        .expect("peer write should succeed");

    let mut buf = [0u8; 11];
    let n = server.recv(&mut buf).expect("recv should succeed");
    assert_eq!(n, 11);
    assert_eq!(&buf, b"Hello World");

    cleanup(&config);
}

#[test]
fn recv_blocks_until_peer_eventually_writes() {
    let config = test_config("lateread");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    let path = server.socket_path().to_path_buf();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let mut peer = UnixStream::connect(&path).expect("peer should connect");
        peer.write_all(b"Hello World")
            .expect("peer write should succeed");
    });

    let mut buf = [0u8; 11];
    server.recv(&mut buf).expect("recv should succeed");
    assert_eq!(&buf, b"Hello World");

    handle.join().expect("peer thread should finish");
    cleanup(&config);
}

#[test]
fn write_before_peer_is_staged_and_delivered() {
    let config = test_config("prestage");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    let n = server
        .write(b"Hello World")
        .expect("write without a peer should stage");
    assert_eq!(n, 11);

    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    let mut buf = [0u8; 11];
    peer.read_exact(&mut buf)
        .expect("staged bytes should be delivered on connect");
    assert_eq!(&buf, b"Hello World");

    cleanup(&config);
}

#[test]
fn data_ready_tracks_arrivals_and_drains() {
    let config = test_config("dataready");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");
    assert_eq!(server.data_ready().expect("data_ready should succeed"), 0);

    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    peer.write_all(b"abcde").expect("peer write should succeed");

    server
        .wait_for(&mut || server.data_ready().expect("data_ready should succeed") == 5)
        .expect("arrival should be observable");

    let mut buf = [0u8; 32];
    let n = server.read(&mut buf).expect("read should succeed");
    assert_eq!(n, 5, "a short read returns what is available");
    assert_eq!(&buf[..5], b"abcde");
    assert_eq!(server.data_ready().expect("data_ready should succeed"), 0);

    cleanup(&config);
}

#[test]
fn buffer_space_shrinks_on_write_and_recovers_on_drain() {
    let mut config = test_config("bufspace");
    config.write_min = 64;
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");
    assert_eq!(server.buffer_space().expect("space should succeed"), 64);

    // Best-effort write accepts only what fits.
    let n = server
        .write(&pattern(100))
        .expect("write should accept a prefix");
    assert_eq!(n, 64);
    assert_eq!(server.buffer_space().expect("space should succeed"), 0);

    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    let mut buf = [0u8; 64];
    peer.read_exact(&mut buf)
        .expect("peer should drain the staged bytes");
    assert_eq!(&buf[..], &pattern(100)[..64]);

    server
        .wait_for(&mut || server.buffer_space().expect("space should succeed") == 64)
        .expect("space should recover as the peer drains");

    cleanup(&config);
}

#[test]
fn oversized_payload_arrives_across_ring_refills() {
    let config = test_config("overflow");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    let payload = pattern(1034);
    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    peer.write_all(&payload).expect("peer write should succeed");

    // Staging caps at 1024; the remaining 10 bytes wait on the socket.
    server
        .wait_for(&mut || server.data_ready().expect("data_ready should succeed") == 1024)
        .expect("ring should fill");

    let mut buf = vec![0u8; 1034];
    let n = server.read(&mut buf).expect("read should succeed");
    assert_eq!(n, 1024);

    let mut rest = [0u8; 10];
    server.recv(&mut rest).expect("tail recv should succeed");
    assert_eq!(&buf[..1024], &payload[..1024]);
    assert_eq!(&rest[..], &payload[1024..]);

    cleanup(&config);
}

#[test]
fn traffic_far_beyond_ring_capacity_is_ordered() {
    let mut config = test_config("wrap");
    config.read_min = 32;
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    let payload = pattern(160);
    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    peer.write_all(&payload).expect("peer write should succeed");

    let mut buf = vec![0u8; 160];
    server.recv(&mut buf).expect("recv should succeed");
    assert_eq!(buf, payload);

    cleanup(&config);
}

#[test]
fn client_and_server_exchange_in_both_directions() {
    let config = test_config("e2e");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");
    let client =
        Channel::client_with_config(2, 1, 42, &config).expect("client should construct");
    assert_eq!(client.state(), ConnectionState::Connected);

    client
        .send(b"Hello World")
        .expect("client send should succeed");
    let mut buf = [0u8; 11];
    server.recv(&mut buf).expect("server recv should succeed");
    assert_eq!(&buf, b"Hello World");

    server.send(b"dlroW olleH").expect("server send should succeed");
    client.recv(&mut buf).expect("client recv should succeed");
    assert_eq!(&buf, b"dlroW olleH");

    cleanup(&config);
}

#[test]
fn concurrent_reader_and_writer_share_one_channel() {
    let config = test_config("concurrent");
    let server = Arc::new(
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct"),
    );
    let client =
        Channel::client_with_config(2, 1, 42, &config).expect("client should construct");

    // Far more traffic than the rings hold, so both directions exercise
    // backpressure while one thread writes and another reads.
    let payload = pattern(8192);

    let echo_payload = payload.clone();
    let echo = thread::spawn(move || {
        let mut buf = vec![0u8; echo_payload.len()];
        client.recv(&mut buf).expect("client recv should succeed");
        assert_eq!(buf, echo_payload);
        client.send(&buf).expect("client send should succeed");
    });

    let writer_server = Arc::clone(&server);
    let writer_payload = payload.clone();
    let writer = thread::spawn(move || {
        writer_server
            .send(&writer_payload)
            .expect("server send should succeed");
    });

    let mut buf = vec![0u8; payload.len()];
    server.recv(&mut buf).expect("server recv should succeed");
    assert_eq!(buf, payload);

    writer.join().expect("writer thread should finish");
    echo.join().expect("echo thread should finish");
    cleanup(&config);
}

#[test]
fn close_delivers_bytes_accepted_by_send() {
    let config = test_config("closeflush");
    let server = Arc::new(
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct"),
    );
    let client =
        Channel::client_with_config(2, 1, 42, &config).expect("client should construct");

    let payload = pattern(65536);
    let reader_server = Arc::clone(&server);
    let expected = payload.clone();
    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; expected.len()];
        reader_server
            .recv(&mut buf)
            .expect("every byte accepted by send should arrive");
        assert_eq!(buf, expected);
    });

    client.send(&payload).expect("send should accept the payload");
    // Closing right after send returns must not discard bytes still staged
    // in the write ring.
    drop(client);

    reader.join().expect("reader thread should finish");
    cleanup(&config);
}

#[test]
fn fd_for_select_quiesces_after_read_consumes_data() {
    let config = test_config("fdselect");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    let mut peer = UnixStream::connect(server.socket_path()).expect("peer should connect");
    peer.write_all(b"abcde").expect("peer write should succeed");

    // Poll readiness directly instead of wait(), which would consume the
    // notification this test is about.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !fd_readable(server.fd_for_select()) {
        assert!(
            std::time::Instant::now() < deadline,
            "pending data should show as readiness"
        );
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.data_ready().expect("data_ready should succeed"), 5);

    let mut buf = [0u8; 5];
    let n = server.read(&mut buf).expect("read should succeed");
    assert_eq!(n, 5);
    assert!(
        !fd_readable(server.fd_for_select()),
        "readiness should clear once read consumed the data"
    );

    cleanup(&config);
}

#[test]
fn client_fails_disconnected_once_server_departs() {
    let config = test_config("serverdeparts");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");
    let client =
        Channel::client_with_config(2, 1, 42, &config).expect("client should construct");
    drop(server);

    client
        .wait_for_state(ConnectionState::Disconnected)
        .expect("client should observe the departure");

    assert!(matches!(
        client.read(&mut [0u8; 1]),
        Err(ChannelError::Disconnected)
    ));

    // Writes still stage into the local ring; once it is full and nothing
    // can ever drain it, the failure surfaces.
    let chunk = pattern(512);
    let err = loop {
        match client.write(&chunk) {
            Ok(n) => assert!(n > 0),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, ChannelError::Disconnected));

    cleanup(&config);
}

#[test]
fn close_is_idempotent_and_rejects_further_operations() {
    let config = test_config("close");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");

    server.close().expect("close should succeed");
    server.close().expect("close should stay idempotent");

    assert!(matches!(
        server.write(b"x"),
        Err(ChannelError::Closed)
    ));
    assert!(matches!(
        server.read(&mut [0u8; 1]),
        Err(ChannelError::Closed)
    ));
    assert!(matches!(server.data_ready(), Err(ChannelError::Closed)));
    assert!(matches!(server.wait(), Err(ChannelError::Closed)));

    cleanup(&config);
}

#[test]
fn close_unblocks_a_blocked_recv() {
    let config = test_config("closeunblock");
    let server = Arc::new(
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct"),
    );

    let blocked = Arc::clone(&server);
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 1];
        blocked.recv(&mut buf)
    });

    thread::sleep(Duration::from_millis(50));
    server.close().expect("close should succeed");

    let result = handle.join().expect("blocked thread should finish");
    assert!(matches!(result, Err(ChannelError::Closed)));

    cleanup(&config);
}

#[test]
fn client_construction_fails_without_server() {
    let config = test_config("noserver");
    let result = Channel::client_with_config(2, 1, 42, &config);
    assert!(matches!(result, Err(ChannelError::Transport(_))));
    cleanup(&config);
}

#[test]
fn close_removes_rendezvous_socket() {
    let config = test_config("sockcleanup");
    let server =
        Channel::server_with_config(1, 2, 42, &config).expect("server should construct");
    let path = server.socket_path().to_path_buf();
    assert!(path.exists());

    drop(server);
    assert!(!path.exists(), "socket file should be cleaned up on close");

    cleanup(&config);
}
