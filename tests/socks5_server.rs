use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tunsocks::{ProxyConnector, Socks5Server, SystemNetwork};

async fn start_server() -> (Arc<Socks5Server>, CancellationToken) {
    start_server_with_timeout(Duration::from_secs(5)).await
}

async fn start_server_with_timeout(connect_timeout: Duration) -> (Arc<Socks5Server>, CancellationToken) {
    let server = Socks5Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(SystemNetwork), connect_timeout)
        .await
        .unwrap();
    let token = CancellationToken::new();
    server.start(token.clone()).unwrap();
    (server, token)
}

async fn echo_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[test_log::test(tokio::test)]
async fn greeting_selects_no_auth() {
    let (server, _token) = start_server().await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

#[test_log::test(tokio::test)]
async fn bad_version_closes_connection() {
    let (server, _token) = start_server().await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[test_log::test(tokio::test)]
async fn unsupported_command_is_rejected() {
    let (server, _token) = start_server().await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    // BIND; the reply comes right after the fixed header.
    stream.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
}

#[test_log::test(tokio::test)]
async fn extra_methods_are_drained() {
    let (server, _token) = start_server().await;
    let target = echo_target().await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    // The request that follows must parse from its first byte.
    let [hi, lo] = target.port().to_be_bytes();
    stream.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo]).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);
}

#[test_log::test(tokio::test)]
async fn ipv6_address_type_is_rejected() {
    let (server, _token) = start_server().await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    // CONNECT with an IPv6 address type.
    stream.write_all(&[0x05, 0x01, 0x00, 0x04]).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
}

#[test_log::test(tokio::test)]
async fn silent_client_is_dropped() {
    let (server, _token) = start_server_with_timeout(Duration::from_millis(300)).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(server.stats().error_count, 1);
}

#[test_log::test(tokio::test)]
async fn connect_relays_both_ways() {
    let (server, _token) = start_server().await;
    let target = echo_target().await;

    let mut stream = server.connect("127.0.0.1", target.port()).await.unwrap();
    stream.write_all(b"hello through socks").await.unwrap();
    let mut echoed = [0u8; 19];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through socks");

    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = server.stats();
    assert_eq!(stats.connection_count, 1);
    assert!(stats.bytes_transferred >= 38);
    assert_eq!(stats.error_count, 0);
}

#[test_log::test(tokio::test)]
async fn refused_target_gets_reply_five() {
    let (server, _token) = start_server().await;
    let port = closed_port().await;

    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    let [hi, lo] = port.to_be_bytes();
    stream.write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo]).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    let err = server.connect("127.0.0.1", port).await.unwrap_err();
    assert!(err.to_string().contains("0x05"), "{err}");
}

#[test_log::test(tokio::test)]
async fn domain_targets_are_resolved() {
    let (server, _token) = start_server().await;
    let target = echo_target().await;

    let mut stream = server.connect("localhost", target.port()).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[test_log::test(tokio::test)]
async fn stop_marks_server_unhealthy() {
    let (server, token) = start_server().await;
    assert!(server.is_running());
    assert!(server.is_healthy());
    server.stop();
    assert!(!server.is_healthy());
    token.cancel();
    assert_eq!(server.proxy_type(), "SOCKS5");
}
