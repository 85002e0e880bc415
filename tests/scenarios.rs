//! End-to-end scenarios against a live server, driven over real TCP
//! sockets exactly the way a RESP client would — covering §8's S1-S6.

use std::sync::Arc;
use std::time::Duration;

use redpoint::config::Config;
use redpoint::dispatch::{run_connection, Server};
use redpoint::persistence::FileSnapshotStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = Config::default();
    config.port = addr.port();
    let persistence = Arc::new(FileSnapshotStore);
    let server = Server::new(config, persistence);

    tokio::spawn(async move {
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            let server = server.clone();
            tokio::spawn(run_connection(server, socket));
        }
    });
    addr
}

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn send(stream: &mut TcpStream, raw: &[u8]) {
    stream.write_all(raw).await.unwrap();
}

/// Reads until the next full CRLF-terminated simple reply, or a bulk/array
/// reply's full payload, whichever this test needs. For these scenarios a
/// fixed-size read with a short grace wait is enough — replies arrive in
/// a single TCP segment in this in-process test.
async fn recv(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    tokio::time::sleep(Duration::from_millis(30)).await;
    let n = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn s1_ping() {
    let addr = spawn_server().await;
    let mut c = connect(addr).await;
    send(&mut c, b"*1\r\n$4\r\nPING\r\n").await;
    assert_eq!(recv(&mut c).await, b"+PONG\r\n");
}

#[tokio::test]
async fn s2_set_get_with_px() {
    let addr = spawn_server().await;
    let mut c = connect(addr).await;
    send(&mut c, b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nPX\r\n$3\r\n100\r\n").await;
    assert_eq!(recv(&mut c).await, b"+OK\r\n");

    send(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
    assert_eq!(recv(&mut c).await, b"$1\r\nv\r\n");

    tokio::time::sleep(Duration::from_millis(150)).await;
    send(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").await;
    assert_eq!(recv(&mut c).await, b"$-1\r\n");
}

#[tokio::test]
async fn config_get_replies_name_len_value() {
    let addr = spawn_server().await;
    let mut c = connect(addr).await;
    send(&mut c, b"*3\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n$3\r\ndir\r\n").await;
    let reply = recv(&mut c).await;
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("*3\r\n$3\r\ndir\r\n$"));
}

#[tokio::test]
async fn s3_incr_typing() {
    let addr = spawn_server().await;
    let mut c = connect(addr).await;
    send(&mut c, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$3\r\nfoo\r\n").await;
    assert_eq!(recv(&mut c).await, b"+OK\r\n");

    send(&mut c, b"*2\r\n$4\r\nINCR\r\n$1\r\na\r\n").await;
    let reply = recv(&mut c).await;
    assert!(reply.starts_with(b"-ERR value is not an integer"));

    for expect in [b"1".as_slice(), b"2", b"3"] {
        send(&mut c, b"*2\r\n$4\r\nINCR\r\n$1\r\nb\r\n").await;
        let reply = recv(&mut c).await;
        let expected = format!("${}\r\n{}\r\n", expect.len(), std::str::from_utf8(expect).unwrap());
        assert_eq!(reply, expected.into_bytes());
    }
}

#[tokio::test]
async fn s4_stream_id_refinement() {
    let addr = spawn_server().await;
    let mut c = connect(addr).await;

    send(&mut c, b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-1\r\n$1\r\nf\r\n$1\r\nv\r\n").await;
    assert_eq!(recv(&mut c).await, b"$3\r\n1-1\r\n");

    send(&mut c, b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-*\r\n$1\r\nf\r\n$1\r\nw\r\n").await;
    assert_eq!(recv(&mut c).await, b"$3\r\n1-2\r\n");

    send(&mut c, b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-0\r\n$1\r\nf\r\n$1\r\nx\r\n").await;
    let reply = recv(&mut c).await;
    assert!(reply.starts_with(b"-ERR The ID specified in XADD is equal or smaller"));

    send(&mut c, b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n0-0\r\n$1\r\nf\r\n$1\r\ny\r\n").await;
    assert_eq!(
        recv(&mut c).await,
        b"-ERR The ID specified in XADD must be greater than 0-0\r\n".to_vec()
    );
}

#[tokio::test]
async fn s5_xread_blocking_unblocks_on_xadd() {
    let addr = spawn_server().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;

    send(
        &mut a,
        b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$3\r\n500\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$1\r\n$\r\n",
    )
    .await;
    // Give the blocking reader time to register before the XADD fires.
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(
        &mut b,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n5-0\r\n$1\r\nf\r\n$1\r\nv\r\n",
    )
    .await;
    assert_eq!(recv(&mut b).await, b"$3\r\n5-0\r\n");

    let reply = recv(&mut a).await;
    let text = String::from_utf8_lossy(&reply);
    assert!(text.contains("s"));
    assert!(text.contains("5-0"));
}

#[tokio::test]
async fn xread_only_wakes_waiters_whose_min_id_the_new_entry_satisfies() {
    let addr = spawn_server().await;
    let mut low = connect(addr).await;
    let mut high = connect(addr).await;
    let mut writer = connect(addr).await;

    // `low` asks for anything after 5-0; `high` asks for anything after 10-0.
    send(
        &mut low,
        b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$4\r\n1000\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$3\r\n5-0\r\n",
    )
    .await;
    send(
        &mut high,
        b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$3\r\n200\r\n$7\r\nSTREAMS\r\n$1\r\ns\r\n$4\r\n10-0\r\n",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 7-0 satisfies `low`'s min-id but not `high`'s.
    send(
        &mut writer,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n7-0\r\n$1\r\nf\r\n$1\r\nv\r\n",
    )
    .await;
    assert_eq!(recv(&mut writer).await, b"$3\r\n7-0\r\n");

    let low_reply = recv(&mut low).await;
    assert!(String::from_utf8_lossy(&low_reply).contains("7-0"));

    // `high` must time out with a null reply rather than receiving 7-0.
    let high_reply = recv(&mut high).await;
    assert_eq!(high_reply, b"$-1\r\n");
}

#[tokio::test]
async fn s6_multi_exec() {
    let addr = spawn_server().await;
    let mut c = connect(addr).await;

    send(&mut c, b"*1\r\n$5\r\nMULTI\r\n").await;
    assert_eq!(recv(&mut c).await, b"+OK\r\n");

    send(&mut c, b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$1\r\n1\r\n").await;
    assert_eq!(recv(&mut c).await, b"+QUEUED\r\n");

    send(&mut c, b"*2\r\n$4\r\nINCR\r\n$1\r\nx\r\n").await;
    assert_eq!(recv(&mut c).await, b"+QUEUED\r\n");

    send(&mut c, b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n").await;
    assert_eq!(recv(&mut c).await, b"+QUEUED\r\n");

    send(&mut c, b"*1\r\n$4\r\nEXEC\r\n").await;
    assert_eq!(
        recv(&mut c).await,
        b"*3\r\n+OK\r\n$1\r\n2\r\n$1\r\n2\r\n".to_vec()
    );

    send(&mut c, b"*1\r\n$4\r\nEXEC\r\n").await;
    assert_eq!(recv(&mut c).await, b"-ERR EXEC without MULTI\r\n".to_vec());
}
