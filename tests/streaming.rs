//! End-to-end tests over loopback sockets

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use icy_relay::auth::{PasswordAuthenticator, SharedHooks};
use icy_relay::codec::{parse_header, Interleaver};
use icy_relay::config::{AppConfig, PasswordConfig, RelayConfig};
use icy_relay::protocol::SOURCE_ACK;
use icy_relay::server::Server;
use icy_relay::stream::StreamHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

/// MPEG 1 Layer 3, 128 kbps, 48 kHz
const HEADER_384: [u8; 4] = [0xff, 0xfb, 0x94, 0x44];
/// MPEG 1 Layer 3, 96 kbps, 32 kHz
const HEADER_432: [u8; 4] = [0xff, 0xfb, 0x78, 0x44];

fn frame(header: [u8; 4]) -> Vec<u8> {
    let len = parse_header(&header, 0).unwrap().frame_len();
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&header);
    frame
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.network.bind_address = "127.0.0.1".into();
    config.network.port = 0;
    config.network.source_port = Some(0);
    config.stream.buffer_size = 64 * 1024;
    config.stream.meta_interval = 500;
    config.admin.enabled = false;
    config.passwords = PasswordConfig {
        dj: "dj-pass".into(),
        admin: "admin-pass".into(),
        strict_admin: false,
    };
    config
}

fn hooks(config: &AppConfig) -> SharedHooks {
    Arc::new(PasswordAuthenticator::new(&config.passwords))
}

async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_listeners(stream: &StreamHandle, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while stream.list_sessions().await.unwrap().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener was not admitted in time");
}

/// Read a response head up to and including the blank line
async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        tokio::time::timeout(TIMEOUT, socket.read_exact(&mut byte))
            .await
            .unwrap()
            .unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_body(socket: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    tokio::time::timeout(TIMEOUT, socket.read_exact(&mut body))
        .await
        .unwrap()
        .unwrap();
    body
}

async fn connect_listener(addr: std::net::SocketAddr, wants_metadata: bool) -> (TcpStream, String) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request = if wants_metadata {
        "GET / HTTP/1.0\r\nIcy-MetaData: 1\r\nUser-Agent: test-player\r\n\r\n"
    } else {
        "GET /; HTTP/1.0\r\nUser-Agent: test-player\r\n\r\n"
    };
    socket.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut socket).await;
    (socket, head)
}

#[tokio::test]
async fn test_inbound_source_to_listeners() {
    let config = test_config();
    let server = Server::bind(&config, hooks(&config)).await.unwrap();
    let playback = server.playback_addr();
    let source_addr = server.source_addr().unwrap();
    let running = server.start();
    let stream = running.stream();

    let (mut first, head) = connect_listener(playback, true).await;
    assert!(head.starts_with("ICY 200 OK\r\n"));
    assert!(head.contains("icy-metaint: 500\r\n"));
    assert!(head.contains("content-type: audio/mpeg\r\n"));
    wait_for_listeners(&stream, 1).await;

    let mut source = TcpStream::connect(source_addr).await.unwrap();
    source.write_all(b"dj-pass\r\n").await.unwrap();
    let ack = read_body(&mut source, SOURCE_ACK.len()).await;
    assert_eq!(ack, SOURCE_ACK);

    let frames = [frame(HEADER_384), frame(HEADER_384), frame(HEADER_432)];
    source.write_all(b"icy-name: Loopback FM\r\n\r\n").await.unwrap();
    for frame in &frames {
        source.write_all(frame).await.unwrap();
    }

    let audio = frames.concat();
    let received = read_body(&mut first, 1200 + 17 + 1).await;
    assert_eq!(&received[..500], &audio[..500]);
    assert_eq!(received[500], 1);
    assert_eq!(&received[501..517], b"StreamTitle='';\0");
    assert_eq!(&received[517..1017], &audio[500..1000]);
    assert_eq!(received[1017], 0);
    assert_eq!(&received[1018..], &audio[1000..]);

    eventually(|| stream.metadata().station_name == "Loopback FM").await;
    let current = stream.current_source().await.unwrap().unwrap();
    assert!(current.address.starts_with("127.0.0.1:"));

    // a late listener is primed from the backlog
    let (mut late, head) = connect_listener(playback, false).await;
    assert!(!head.contains("icy-metaint"));
    assert_eq!(read_body(&mut late, 1200).await, audio);
}

#[tokio::test]
async fn test_wrong_password_is_disconnected() {
    let config = test_config();
    let server = Server::bind(&config, hooks(&config)).await.unwrap();
    let source_addr = server.source_addr().unwrap();
    let _running = server.start();

    let mut source = TcpStream::connect(source_addr).await.unwrap();
    source.write_all(b"guess\r\nicy-name: Pirate\r\n\r\n").await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(TIMEOUT, source.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let config = test_config();
    let server = Server::bind(&config, hooks(&config)).await.unwrap();
    let playback = server.playback_addr();
    let _running = server.start();

    let mut socket = TcpStream::connect(playback).await.unwrap();
    socket.write_all(b"GET /favicon.ico HTTP/1.0\r\n\r\n").await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(TIMEOUT, socket.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));
}

#[tokio::test]
async fn test_relay_from_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();

    let frames = vec![frame(HEADER_432), frame(HEADER_384), frame(HEADER_432)];
    let audio = frames.concat();
    let served = frames.clone();
    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        assert!(head.starts_with("GET / HTTP/1.0\r\n"));
        assert!(head.contains("Icy-MetaData: 1\r\n"));

        let mut body = BytesMut::new();
        body.extend_from_slice(b"ICY 200 OK\r\nicy-name: Upstream\r\nicy-metaint: 100\r\n\r\n");
        let mut interleaver = Interleaver::new(Some(100));
        for frame in &served {
            interleaver.write(frame, "Upstream Song", &mut body);
        }
        // deliver in small pieces so metadata blocks straddle reads
        for chunk in body.chunks(37) {
            socket.write_all(chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // hold the connection open
        let mut sink = [0u8; 16];
        let _ = socket.read(&mut sink).await;
    });

    let mut config = test_config();
    config.relay = Some(RelayConfig {
        enabled: true,
        host: "127.0.0.1".into(),
        port: upstream_port,
        ..RelayConfig::default()
    });
    let server = Server::bind(&config, hooks(&config)).await.unwrap();
    assert!(server.source_addr().is_none());
    let playback = server.playback_addr();
    let running = server.start();
    let stream = running.stream();

    eventually(|| stream.metadata().song_title == "Upstream Song").await;
    assert_eq!(stream.metadata().station_name, "Upstream");

    let (mut listener, _) = connect_listener(playback, false).await;
    assert_eq!(read_body(&mut listener, audio.len()).await, audio);
}
