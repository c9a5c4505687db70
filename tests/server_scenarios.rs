//! End-to-end server scenarios over real sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::time::timeout;

use modbus_slave::framer::crc16;
use modbus_slave::{
    DataBlock, SerialConfig, SerialServer, ServerConfig, ServerContext, SlaveContext, TcpServer,
    TlsIdentity, TlsServer, UdpServer, UnixServer,
};

const NO_RESPONSE_WINDOW: Duration = Duration::from_millis(200);

fn coil_context(size: u16) -> Arc<ServerContext> {
    Arc::new(ServerContext::single(SlaveContext::with_blocks(
        DataBlock::new(0, size),
        DataBlock::filled(0, size, true),
        DataBlock::new(0, size),
        DataBlock::new(0, size),
    )))
}

async fn spawn_tcp(context: Arc<ServerContext>, config: ServerConfig) -> (Arc<TcpServer>, TcpStream) {
    let server = Arc::new(TcpServer::new(
        context,
        "127.0.0.1:0".parse().expect("addr"),
        config,
    ));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_forever().await });
    server.serving_started().await;

    let addr = server.local_addr().expect("bound address");
    let stream = TcpStream::connect(addr).await.expect("connect");
    (server, stream)
}

async fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut reply = vec![0u8; expected.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    assert_eq!(reply, expected);
}

async fn expect_silence(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let silent = timeout(NO_RESPONSE_WINDOW, stream.read(&mut buf)).await;
    assert!(silent.is_err(), "server must not answer");
}

#[tokio::test]
async fn test_read_coils_over_tcp() {
    let (server, mut stream) = spawn_tcp(coil_context(100), ServerConfig::default()).await;

    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x01, 0x00, 0x01])
        .await
        .expect("send request");
    expect_reply(&mut stream, &[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_illegal_data_address() {
    let (server, mut stream) = spawn_tcp(coil_context(10), ServerConfig::default()).await;

    // read one coil at address 100, outside the configured block
    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x64, 0x00, 0x01])
        .await
        .expect("send request");
    expect_reply(&mut stream, &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x81, 0x02]).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_write_is_silent_and_reaches_all_slaves() {
    let context = Arc::new(ServerContext::with_slaves([
        (1, SlaveContext::new(10)),
        (2, SlaveContext::new(10)),
    ]));
    let config = ServerConfig {
        broadcast_enable: true,
        ..Default::default()
    };
    let (server, mut stream) = spawn_tcp(context, config).await;

    // write register 5 = 0x1234 to the broadcast id
    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x00, 0x06, 0x00, 0x05, 0x12, 0x34])
        .await
        .expect("send broadcast");
    expect_silence(&mut stream).await;

    // both contexts took the write
    for slave_id in [1u8, 2] {
        stream
            .write_all(&[0x00, slave_id, 0x00, 0x00, 0x00, 0x06, slave_id, 0x03, 0x00, 0x05, 0x00, 0x01])
            .await
            .expect("send read");
        expect_reply(
            &mut stream,
            &[0x00, slave_id, 0x00, 0x00, 0x00, 0x05, slave_id, 0x03, 0x02, 0x12, 0x34],
        )
        .await;
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_slave_ignored() {
    let context = Arc::new(ServerContext::with_slaves([(1, SlaveContext::new(10))]));
    let config = ServerConfig {
        ignore_missing_slaves: true,
        ..Default::default()
    };
    let (server, mut stream) = spawn_tcp(context, config).await;

    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .expect("send request");
    expect_silence(&mut stream).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_slave_answered_with_gateway_exception() {
    let context = Arc::new(ServerContext::with_slaves([(1, SlaveContext::new(10))]));
    let (server, mut stream) = spawn_tcp(context, ServerConfig::default()).await;

    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x09, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .expect("send request");
    expect_reply(&mut stream, &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x09, 0x83, 0x0B]).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_responses_keep_request_order() {
    let (server, mut stream) = spawn_tcp(coil_context(100), ServerConfig::default()).await;

    // two requests in one segment
    let mut pipelined = Vec::new();
    pipelined.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01]);
    pipelined.extend_from_slice(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
    stream.write_all(&pipelined).await.expect("send requests");

    expect_reply(&mut stream, &[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]).await;
    expect_reply(&mut stream, &[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00]).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_serve_forever_rejects_reentry() {
    let (server, _stream) = spawn_tcp(coil_context(10), ServerConfig::default()).await;
    assert!(server.serve_forever().await.is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let (server, mut stream) = spawn_tcp(coil_context(10), ServerConfig::default()).await;

    server.shutdown().await;

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection torn down");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_udp_round_trip() {
    let server = Arc::new(UdpServer::new(
        coil_context(100),
        "127.0.0.1:0".parse().expect("addr"),
        ServerConfig::default(),
    ));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_forever().await });
    server.serving_started().await;
    let addr = server.local_addr().expect("bound address");

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    socket
        .send_to(
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x01, 0x00, 0x01],
            addr,
        )
        .await
        .expect("send datagram");

    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("reply in time")
        .expect("receive");
    assert_eq!(
        &buf[..len],
        &[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_unix_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("modbus.sock");

    let server = Arc::new(UnixServer::new(
        coil_context(100),
        &path,
        ServerConfig::default(),
    ));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_forever().await });
    server.serving_started().await;

    let mut stream = UnixStream::connect(&path).await.expect("connect");
    stream
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x01, 0x00, 0x01])
        .await
        .expect("send request");

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    assert_eq!(
        reply,
        [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]
    );

    server.shutdown().await;
}

fn tls_identity() -> TlsIdentity {
    let data = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data");
    TlsIdentity::CertKey {
        cert_path: data.join("server.pem"),
        key_path: data.join("server.key"),
        require_client_cert: false,
    }
}

async fn spawn_tls(context: Arc<ServerContext>) -> Arc<TlsServer> {
    let server = Arc::new(TlsServer::new(
        context,
        "127.0.0.1:0".parse().expect("addr"),
        tls_identity(),
        ServerConfig::default(),
    ));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_forever().await });
    server.serving_started().await;
    server
}

#[tokio::test]
async fn test_tls_round_trip() {
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    let server = spawn_tls(coil_context(100)).await;
    let addr = server.local_addr().expect("bound address");

    let cert_path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data/server.pem");
    let mut roots = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(std::fs::File::open(cert_path).expect("cert file"));
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.expect("parse cert")).expect("add root");
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(addr).await.expect("connect");
    let server_name = ServerName::try_from("localhost").expect("server name");
    let mut tls = connector
        .connect(server_name, stream)
        .await
        .expect("handshake");

    // bare PDU, no MBAP header: read one coil at address 1
    tls.write_all(&[0x01, 0x00, 0x01, 0x00, 0x01])
        .await
        .expect("send request");
    let mut reply = [0u8; 3];
    timeout(Duration::from_secs(2), tls.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    assert_eq!(reply, [0x01, 0x01, 0x01]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_tls_shutdown_with_stalled_handshake() {
    let server = spawn_tls(coil_context(10)).await;
    let addr = server.local_addr().expect("bound address");

    // a plain TCP connection that never speaks TLS; the pending
    // handshake must not keep shutdown waiting
    let _stalled = TcpStream::connect(addr).await.expect("connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(2), server.shutdown())
        .await
        .expect("shutdown completes despite the stalled handshake");
}

fn rtu_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = vec![slave_id];
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[tokio::test]
async fn test_serial_socket_mode_rtu_with_resync() {
    let context = Arc::new(ServerContext::with_slaves([(1, SlaveContext::new(10))]));
    let serial = SerialConfig {
        port: "socket:127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let server = Arc::new(SerialServer::new(context, serial, ServerConfig::default()));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve_forever().await });
    server.serving_started().await;
    let addr = server.local_addr().expect("bound address");

    let mut stream = TcpStream::connect(addr).await.expect("connect");

    // a good frame, one with a corrupted CRC, then another good frame
    let good = rtu_frame(1, &[0x03, 0x00, 0x01, 0x00, 0x02]);
    let mut bad = good.clone();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    let mut wire = good.clone();
    wire.extend_from_slice(&bad);
    wire.extend_from_slice(&good);
    stream.write_all(&wire).await.expect("send frames");

    let expected = rtu_frame(1, &[0x03, 0x04, 0x00, 0x00, 0x00, 0x00]);
    for _ in 0..2 {
        let mut reply = vec![0u8; expected.len()];
        timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
            .await
            .expect("reply in time")
            .expect("read reply");
        assert_eq!(reply, expected);
    }

    // the corrupted frame itself got no answer
    let mut buf = [0u8; 16];
    assert!(timeout(NO_RESPONSE_WINDOW, stream.read(&mut buf)).await.is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_start_and_async_stop() {
    use modbus_slave::{server_async_stop, start_tcp_server};

    let server = tokio::spawn(start_tcp_server(
        coil_context(10),
        "127.0.0.1:0".parse().expect("addr"),
        ServerConfig::default(),
    ));
    // give the listener a moment to come up and register
    tokio::time::sleep(Duration::from_millis(100)).await;

    server_async_stop().await.expect("stop active server");
    let result = timeout(Duration::from_secs(2), server)
        .await
        .expect("server task ends")
        .expect("join");
    assert!(result.is_ok());
}
