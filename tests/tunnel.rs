use std::{net::SocketAddr, sync::mpsc, thread, time::Duration};

use rsocks5::{
    method_handlers::{Connect, ConnectDenier, TunnelConnect},
    tunnel::{agent, proxy},
    EventLoop,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(10);

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Starts a proxy and an agent on their own threads and returns the public
/// SOCKS5 address.
fn start<C: Connect + Send + 'static>(connector: C) -> SocketAddr {
    let proxy_addr = free_addr();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let listener =
            proxy::serve(&event_loop, "127.0.0.1:0".parse().unwrap(), proxy_addr).unwrap();
        tx.send(listener.local_addr()).unwrap();
        let _ = event_loop.run();
    });
    let tunnel_addr = rx.recv().unwrap();

    thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        agent::connect(&event_loop, tunnel_addr, proxy_addr.port(), connector).unwrap();
        let _ = event_loop.run();
    });

    proxy_addr
}

/// The public listener only appears once the agent is attached.
async fn connect_client(proxy_addr: SocketAddr) -> TcpStream {
    for _ in 0..500 {
        if let Ok(stream) = TcpStream::connect(proxy_addr).await {
            return stream;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("proxy never started listening on {proxy_addr}");
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0; n];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

fn connect_request(destination: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(destination) = destination else {
        panic!("IPv4 destination expected");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&destination.ip().octets());
    request.extend_from_slice(&destination.port().to_be_bytes());
    request
}

fn reply(code: u8, proxy_addr: SocketAddr) -> Vec<u8> {
    let mut reply = vec![0x05, code, 0x00, 0x01, 0, 0, 0, 0];
    reply.extend_from_slice(&proxy_addr.port().to_be_bytes());
    reply
}

#[tokio::test]
async fn connect_is_relayed_end_to_end() {
    let echo = echo_server().await;
    let proxy_addr = start(TunnelConnect);
    let mut client = connect_client(proxy_addr).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, [0x05, 0x00]);

    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(read_n(&mut client, 10).await, reply(0x00, proxy_addr));

    let message = b"through the tunnel and back";
    client.write_all(message).await.unwrap();
    assert_eq!(read_n(&mut client, message.len()).await, message);

    // A second client gets its own stream on the same tunnel.
    let mut second = connect_client(proxy_addr).await;
    let mut pipelined = vec![0x05, 0x01, 0x00];
    pipelined.extend_from_slice(&connect_request(echo));
    pipelined.extend_from_slice(b"early");
    second.write_all(&pipelined).await.unwrap();
    assert_eq!(read_n(&mut second, 2).await, [0x05, 0x00]);
    assert_eq!(read_n(&mut second, 10).await, reply(0x00, proxy_addr));
    assert_eq!(read_n(&mut second, 5).await, b"early");

    client.write_all(b"still here").await.unwrap();
    assert_eq!(read_n(&mut client, 10).await, b"still here");
}

#[tokio::test]
async fn bad_greeting_is_refused_and_closed() {
    let proxy_addr = start(TunnelConnect);
    let mut client = connect_client(proxy_addr).await;

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert_eq!(read_to_eof(&mut client).await, [0x05, 0xFF]);
}

#[tokio::test]
async fn failed_connect_gets_host_unreachable() {
    let proxy_addr = start(ConnectDenier);
    let mut client = connect_client(proxy_addr).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, [0x05, 0x00]);

    client
        .write_all(&connect_request("127.0.0.1:80".parse().unwrap()))
        .await
        .unwrap();
    assert_eq!(read_to_eof(&mut client).await, reply(0x04, proxy_addr));
}
