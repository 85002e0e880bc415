//! Replica side (C7): the handshake to a master and the loop that applies
//! inbound writes to the local keyspace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::keyspace::Keyspace;
use crate::resp::{self, Frame};
use crate::value::Value;

const HANDSHAKE_PACING: Duration = Duration::from_millis(20);

async fn expect_simple(stream: &mut TcpStream, buf: &mut BytesMut, expected: &str) -> anyhow::Result<()> {
    let frame = read_one_frame(stream, buf).await?;
    match frame {
        Frame::Simple(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
        other => anyhow::bail!("expected +{expected}, got {other:?}"),
    }
}

async fn read_one_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<Frame> {
    loop {
        match resp::decode(buf) {
            Ok(frame) => return Ok(frame),
            Err(resp::DecodeError::Incomplete) => {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    anyhow::bail!("master closed connection during handshake");
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => anyhow::bail!("protocol error from master: {e}"),
        }
    }
}

/// Performs the four-step PSYNC handshake against `master_addr`, then loops
/// forever applying inbound writes to `keyspace`. `my_port` is the
/// listening port this replica advertises via REPLCONF.
pub async fn run(
    master_addr: (String, u16),
    my_port: u16,
    keyspace: Arc<Keyspace>,
) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect((master_addr.0.as_str(), master_addr.1)).await?;
    let mut buf = BytesMut::new();

    stream
        .write_all(&Frame::array(vec![Frame::bulk("ping")]).to_bytes())
        .await?;
    expect_simple(&mut stream, &mut buf, "pong").await?;
    tokio::time::sleep(HANDSHAKE_PACING).await;

    stream
        .write_all(
            &Frame::array(vec![
                Frame::bulk("REPLCONF"),
                Frame::bulk("listening-port"),
                Frame::bulk(my_port.to_string()),
            ])
            .to_bytes(),
        )
        .await?;
    expect_simple(&mut stream, &mut buf, "ok").await?;
    tokio::time::sleep(HANDSHAKE_PACING).await;

    stream
        .write_all(
            &Frame::array(vec![
                Frame::bulk("REPLCONF"),
                Frame::bulk("capa"),
                Frame::bulk("psync2"),
            ])
            .to_bytes(),
        )
        .await?;
    expect_simple(&mut stream, &mut buf, "ok").await?;
    tokio::time::sleep(HANDSHAKE_PACING).await;

    stream
        .write_all(
            &Frame::array(vec![Frame::bulk("PSYNC"), Frame::bulk("?"), Frame::bulk("-1")])
                .to_bytes(),
        )
        .await?;
    match read_one_frame(&mut stream, &mut buf).await? {
        Frame::Simple(s) if s.starts_with("FULLRESYNC") => {}
        other => anyhow::bail!("expected +FULLRESYNC, got {other:?}"),
    }
    // Discard the bulk-string snapshot payload that follows.
    match read_one_frame(&mut stream, &mut buf).await? {
        Frame::Bulk(_) => {}
        other => anyhow::bail!("expected bulk snapshot payload, got {other:?}"),
    }

    tracing::info!(master = %format!("{}:{}", master_addr.0, master_addr.1), "replication handshake complete");

    let offset = Arc::new(AtomicU64::new(0));
    loop {
        let (frame, raw_len) = match read_frame_with_len(&mut stream, &mut buf).await {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };
        let request = match resp::frame_into_request(frame) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let name = request.name();
        if name == "replconf" && request.args.get(1).map(|a| a.eq_ignore_ascii_case(b"getack")) == Some(true) {
            let ack_offset = offset.load(Ordering::SeqCst);
            let reply = Frame::array(vec![
                Frame::bulk("replconf"),
                Frame::bulk("ack"),
                Frame::bulk(ack_offset.to_string()),
            ]);
            stream.write_all(&reply.to_bytes()).await?;
            offset.fetch_add(raw_len as u64, Ordering::SeqCst);
            continue;
        }
        apply_write(&keyspace, &name, &request.args).await;
        offset.fetch_add(raw_len as u64, Ordering::SeqCst);
    }
}

async fn read_frame_with_len(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> anyhow::Result<Option<(Frame, usize)>> {
    loop {
        let before = buf.len();
        match resp::decode(buf) {
            Ok(frame) => return Ok(Some((frame, before - buf.len()))),
            Err(resp::DecodeError::Incomplete) => {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => anyhow::bail!("protocol error from master: {e}"),
        }
    }
}

/// Applies a recognized write command to the local keyspace with the same
/// semantics as C2/C3. Unrecognized commands are silently ignored, per §4.7
/// ("applies recognized writes").
async fn apply_write(keyspace: &Arc<Keyspace>, name: &str, args: &[Vec<u8>]) {
    match name {
        "set" => {
            if args.len() < 3 {
                return;
            }
            let key = String::from_utf8_lossy(&args[1]).into_owned();
            let value = Value::String(args[2].clone());
            let px = if args.len() >= 5 && args[3].eq_ignore_ascii_case(b"px") {
                std::str::from_utf8(&args[4]).ok().and_then(|s| s.parse().ok())
            } else {
                None
            };
            keyspace.set(key, value, px).await;
        }
        "incr" => {
            if let Some(key) = args.get(1) {
                let key = String::from_utf8_lossy(key).into_owned();
                let _ = keyspace.incr(&key).await;
            }
        }
        _ => {}
    }
}
