//! Socket fixtures shared by the async tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

/// An address nothing listens on; connecting is refused.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A listener whose accept backlog is full and never drained, so further
/// connects hang until the caller's timeout fires. The returned streams keep
/// the backlog occupied and must stay alive for the duration of the test.
pub async fn saturated_listener() -> (TcpListener, SocketAddr, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut fillers = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) =
            tokio::time::timeout(Duration::from_millis(50), TcpStream::connect(addr)).await
        {
            fillers.push(stream);
        }
    }
    (listener, addr, fillers)
}

/// Connected pair: (client side, accepted side).
pub async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Fake CONNECT proxy: consumes the request head, then echoes everything.
/// Resolves to the request head once the peer closes.
pub async fn echo_upstream() -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut tmp = [0u8; 4096];
        let end = loop {
            let n = sock.read(&mut tmp).await.unwrap_or(0);
            if n == 0 {
                return head;
            }
            head.extend_from_slice(&tmp[..n]);
            if let Some(p) = head.windows(4).position(|w| w == b"\r\n\r\n") {
                break p + 4;
            }
        };
        let rest = head.split_off(end);
        let _ = sock.write_all(&rest).await;
        loop {
            let n = sock.read(&mut tmp).await.unwrap_or(0);
            if n == 0 || sock.write_all(&tmp[..n]).await.is_err() {
                break;
            }
        }
        head
    });
    (addr, task)
}

/// Fake CONNECT proxy that answers the request head with `reply`, then
/// holds the connection open until the peer closes.
pub async fn scripted_upstream(reply: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = sock.read(&mut tmp).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            head.extend_from_slice(&tmp[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let _ = sock.write_all(&reply).await;
        while sock.read(&mut tmp).await.unwrap_or(0) > 0 {}
    });
    addr
}

/// Fake CONNECT proxy that accepts and then never reads, so writes towards
/// it stall once the socket buffers fill.
pub async fn silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_sock, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    addr
}
