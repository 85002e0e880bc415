//! Command dispatcher (C5): the per-connection request loop, argument
//! validation, and routing to handlers.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::RedpointError;
use crate::keyspace::Keyspace;
use crate::persistence::{Snapshot, SnapshotStore};
use crate::replication::master::ReplicaRegistry;
use crate::replication::{self};
use crate::resp::{self, Frame};
use crate::session::{is_queueable, Session};
use crate::stream::{self, RangeBound, StreamEntry, StreamId, WaiterRegistry};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

/// The process-wide shared state handed to every connection task.
pub struct Server {
    pub keyspace: Arc<Keyspace>,
    pub waiters: Mutex<WaiterRegistry>,
    pub replicas: Arc<ReplicaRegistry>,
    pub persistence: Arc<dyn SnapshotStore>,
    pub config: Config,
    pub replid: String,
    pub role: Role,
}

impl Server {
    pub fn new(config: Config, persistence: Arc<dyn SnapshotStore>) -> Arc<Server> {
        let role = if config.replicaof.is_some() {
            Role::Replica
        } else {
            Role::Master
        };
        Arc::new(Server {
            keyspace: Keyspace::new(),
            waiters: Mutex::new(WaiterRegistry::default()),
            replicas: ReplicaRegistry::new(),
            persistence,
            config,
            replid: crate::util::generate_replid(),
            role,
        })
    }
}

/// What a dispatched command did, beyond producing a reply: whether the
/// connection should close afterward, and whether the command was a write
/// that must be mirrored to replicas.
struct Outcome {
    reply: Frame,
    close: bool,
    is_write: bool,
}

impl Outcome {
    fn reply(reply: Frame) -> Outcome {
        Outcome {
            reply,
            close: false,
            is_write: false,
        }
    }

    fn write(reply: Frame) -> Outcome {
        Outcome {
            reply,
            close: false,
            is_write: true,
        }
    }
}

fn arity_ok(name: &str, argc: usize) -> bool {
    match name {
        "ping" | "keys" | "info" | "save" | "multi" | "exec" | "discard" | "command" => argc == 1,
        "echo" | "type" | "get" | "incr" => argc == 2,
        "set" => argc == 3 || argc == 5,
        "config" => argc == 3,
        "xrange" => argc == 4,
        "replconf" => argc >= 1,
        "psync" => argc == 3,
        "xadd" => argc >= 5 && (argc - 3) % 2 == 0,
        "xread" => argc >= 4,
        _ => true,
    }
}

/// Runs the request/response loop for one accepted connection until EOF, a
/// transport error, or a handler signals the connection should close.
pub async fn run_connection(server: Arc<Server>, socket: TcpStream) {
    let peer = socket.peer_addr().ok();
    let (mut read_half, mut write_half) = socket.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    let mut session = Session::new();

    loop {
        let (frame, raw) = match read_frame(&mut read_half, &mut buf).await {
            Ok(ReadOutcome::Frame(frame, raw)) => (frame, raw),
            Ok(ReadOutcome::Eof) => break,
            Ok(ReadOutcome::ProtocolError(msg)) => {
                if write_half
                    .write_all(&Frame::error(msg).to_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::debug!(?peer, error = %e, "connection read error");
                break;
            }
        };

        let request = match resp::frame_into_request(frame) {
            Ok(r) => r,
            Err(resp::DecodeError::Protocol(msg)) => {
                if write_half
                    .write_all(&Frame::error(msg).to_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
            Err(resp::DecodeError::Incomplete) => unreachable!("frame_into_request never returns Incomplete"),
        };

        let name = request.name();
        let args = request.args;

        if !arity_ok(&name, args.len()) {
            let _ = write_half
                .write_all(&RedpointError::WrongArity.to_frame().to_bytes())
                .await;
            continue;
        }

        // PSYNC hands the write half off to the replica registry and ends
        // this connection's normal request loop.
        if name == "psync" {
            match handle_psync(&server, &mut write_half).await {
                Ok(()) => server.replicas.register(write_half).await,
                Err(e) => tracing::debug!(?peer, error = %e, "psync handshake failed"),
            }
            return;
        }

        let outcome = if session.in_tx() && is_queueable(&name) && !is_tx_control(&name) {
            session.queue(name, args);
            Outcome::reply(Frame::simple("QUEUED"))
        } else if name == "multi" {
            match session.multi() {
                Ok(()) => Outcome::reply(Frame::simple("OK")),
                Err(e) => Outcome::reply(e.to_frame()),
            }
        } else if name == "discard" {
            match session.discard() {
                Ok(()) => Outcome::reply(Frame::simple("OK")),
                Err(e) => Outcome::reply(e.to_frame()),
            }
        } else if name == "exec" {
            match session.exec() {
                Ok(queued) => {
                    let mut replies = Vec::with_capacity(queued.len());
                    for cmd in queued {
                        let o = execute(&server, &cmd.name, &cmd.args).await;
                        if o.is_write {
                            server.replicas.mirror(&reencode(&cmd.name, &cmd.args)).await;
                        }
                        replies.push(o.reply);
                    }
                    Outcome::reply(Frame::array(replies))
                }
                Err(e) => Outcome::reply(e.to_frame()),
            }
        } else {
            execute(&server, &name, &args).await
        };

        if outcome.is_write && server.role == Role::Master {
            server.replicas.mirror(&raw).await;
        }

        if write_half.write_all(&outcome.reply.to_bytes()).await.is_err() {
            break;
        }
        if outcome.close {
            break;
        }
    }
}

fn is_tx_control(name: &str) -> bool {
    matches!(name, "multi" | "exec" | "discard")
}

/// Re-encodes a queued command's name+args as a canonical RESP array, for
/// mirroring commands that ran as part of an EXEC batch (the original
/// per-request raw bytes were the literal `EXEC` call, not this command).
fn reencode(name: &str, args: &[Vec<u8>]) -> Vec<u8> {
    let mut items = vec![Frame::bulk(name.to_string())];
    items.extend(args[1..].iter().map(|a| Frame::bulk(a.clone())));
    Frame::array(items).to_bytes()
}

enum ReadOutcome {
    Frame(resp::Frame, Vec<u8>),
    Eof,
    ProtocolError(String),
}

async fn read_frame(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    buf: &mut BytesMut,
) -> std::io::Result<ReadOutcome> {
    loop {
        match resp::decode_with_raw(buf) {
            Ok((frame, raw)) => return Ok(ReadOutcome::Frame(frame, raw)),
            Err(resp::DecodeError::Incomplete) => {
                let mut chunk = [0u8; 4096];
                let n = read_half.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(resp::DecodeError::Protocol(msg)) => return Ok(ReadOutcome::ProtocolError(msg)),
        }
    }
}

/// Executes one already-validated command against the live server state.
/// Shared between the direct dispatch path and EXEC's queued replay.
async fn execute(server: &Arc<Server>, name: &str, args: &[Vec<u8>]) -> Outcome {
    match name {
        "ping" => Outcome::reply(Frame::simple("PONG")),
        "echo" => Outcome::reply(Frame::bulk(args[1].clone())),
        "command" => Outcome::reply(Frame::array(vec![])),
        "type" => {
            let key = key_arg(&args[1]);
            Outcome::reply(Frame::simple(server.keyspace.type_of(&key).await))
        }
        "set" => cmd_set(server, args).await,
        "get" => cmd_get(server, args).await,
        "incr" => cmd_incr(server, args).await,
        "keys" => cmd_keys(server).await,
        "config" => cmd_config(server, args),
        "info" => Outcome::reply(Frame::bulk(info_body(server))),
        "save" => cmd_save(server).await,
        "replconf" => Outcome::reply(Frame::simple("OK")),
        "xadd" => cmd_xadd(server, args).await,
        "xrange" => cmd_xrange(server, args).await,
        "xread" => cmd_xread(server, args).await,
        _ => Outcome {
            reply: RedpointError::UnknownCommand.to_frame(),
            close: true,
            is_write: false,
        },
    }
}

fn key_arg(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

async fn cmd_set(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    let key = key_arg(&args[1]);
    let px = if args.len() == 5 {
        if !args[3].eq_ignore_ascii_case(b"px") {
            return Outcome::reply(RedpointError::Syntax.to_frame());
        }
        match std::str::from_utf8(&args[4]).ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(ms) => Some(ms),
            None => return Outcome::reply(RedpointError::Syntax.to_frame()),
        }
    } else {
        None
    };
    server.keyspace.set(key, Value::String(args[2].clone()), px).await;
    Outcome::write(Frame::simple("OK"))
}

async fn cmd_get(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    let key = key_arg(&args[1]);
    match server.keyspace.get(&key).await {
        Some(Value::String(bytes)) => Outcome::reply(Frame::bulk(bytes)),
        Some(Value::Stream(_)) | None => Outcome::reply(Frame::null_bulk()),
    }
}

async fn cmd_incr(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    let key = key_arg(&args[1]);
    match server.keyspace.incr(&key).await {
        Ok(n) => Outcome::write(Frame::bulk(n.to_string())),
        Err(e) => Outcome::reply(e.to_frame()),
    }
}

async fn cmd_keys(server: &Arc<Server>) -> Outcome {
    match server
        .persistence
        .load_keys(&server.config.dir, &server.config.dbfilename)
        .await
    {
        Ok(keys) => Outcome::reply(Frame::array(keys.into_iter().map(Frame::bulk).collect())),
        Err(e) => Outcome::reply(e.to_frame()),
    }
}

fn cmd_config(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    if !args[1].eq_ignore_ascii_case(b"get") {
        return Outcome::reply(RedpointError::Syntax.to_frame());
    }
    let name = key_arg(&args[2]).to_ascii_lowercase();
    let value = match name.as_str() {
        "dir" => server.config.dir.to_string_lossy().into_owned(),
        "dbfilename" => server.config.dbfilename.clone(),
        _ => {
            return Outcome::reply(RedpointError::UnsupportedConfigParam(name).to_frame());
        }
    };
    Outcome::reply(Frame::array(vec![
        Frame::bulk(name),
        Frame::bulk(value.len().to_string()),
        Frame::bulk(value),
    ]))
}

fn info_body(server: &Arc<Server>) -> String {
    let role_line = match server.role {
        Role::Master => "role:master",
        Role::Replica => "role:slave",
    };
    format!(
        "{role_line}\r\nmaster_replid:{}\r\nmaster_repl_offset:0",
        server.replid
    )
}

async fn cmd_save(server: &Arc<Server>) -> Outcome {
    let entries = server.keyspace.snapshot_strings().await;
    let snapshot = Snapshot { entries };
    match server
        .persistence
        .save(&server.config.dir, &server.config.dbfilename, &snapshot)
        .await
    {
        Ok(()) => Outcome::reply(Frame::simple("OK")),
        Err(e) => Outcome::reply(e.to_frame()),
    }
}

async fn cmd_xadd(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    let key = key_arg(&args[1]);
    let raw_id = match stream::parse_raw_id(&key_arg(&args[2])) {
        Ok(r) => r,
        Err(e) => return Outcome::reply(e.to_frame()),
    };
    let mut fields = Vec::new();
    let mut i = 3;
    while i + 1 < args.len() {
        fields.push((key_arg(&args[i]), key_arg(&args[i + 1])));
        i += 2;
    }

    let result = server
        .keyspace
        .with_stream_mut(&key, |log| log.append(raw_id, fields.clone()))
        .await;

    match result {
        Ok(id) => {
            let entry = StreamEntry {
                id,
                fields,
            };
            let mut waiters = server.waiters.lock().await;
            waiters.wake(&key, &entry);
            drop(waiters);
            Outcome::write(Frame::bulk(id.to_string()))
        }
        Err(e) => Outcome::reply(e.to_frame()),
    }
}

async fn cmd_xrange(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    let key = key_arg(&args[1]);
    let lo = match RangeBound::parse(&key_arg(&args[2])) {
        Ok(v) => v,
        Err(e) => return Outcome::reply(e.to_frame()),
    };
    let hi = match RangeBound::parse(&key_arg(&args[3])) {
        Ok(v) => v,
        Err(e) => return Outcome::reply(e.to_frame()),
    };
    let entries = match server.keyspace.with_stream(&key, |log| {
        log.map(|l| l.range(lo, hi)).unwrap_or_default()
    }).await {
        Ok(v) => v,
        Err(e) => return Outcome::reply(e.to_frame()),
    };
    Outcome::reply(Frame::array(entries.iter().map(encode_entry).collect()))
}

fn encode_entry(entry: &StreamEntry) -> Frame {
    let mut fv = Vec::with_capacity(entry.fields.len() * 2);
    for (f, v) in &entry.fields {
        fv.push(Frame::bulk(f.clone()));
        fv.push(Frame::bulk(v.clone()));
    }
    Frame::array(vec![Frame::bulk(entry.id.to_string()), Frame::array(fv)])
}

async fn cmd_xread(server: &Arc<Server>, args: &[Vec<u8>]) -> Outcome {
    let mut i = 1;
    let mut block_ms: Option<u64> = None;
    if args[i].eq_ignore_ascii_case(b"block") {
        block_ms = match std::str::from_utf8(&args[i + 1]).ok().and_then(|s| s.parse().ok()) {
            Some(ms) => Some(ms),
            None => return Outcome::reply(RedpointError::Syntax.to_frame()),
        };
        i += 2;
    }
    if !args.get(i).map(|a| a.eq_ignore_ascii_case(b"streams")).unwrap_or(false) {
        return Outcome::reply(RedpointError::Syntax.to_frame());
    }
    i += 1;
    let remaining = &args[i..];
    if remaining.is_empty() || remaining.len() % 2 != 0 {
        return Outcome::reply(RedpointError::MismatchedKeysAndIds.to_frame());
    }
    let n = remaining.len() / 2;
    let keys: Vec<String> = remaining[..n].iter().map(|k| key_arg(k)).collect();
    let id_tokens: Vec<Vec<u8>> = remaining[n..].to_vec();

    let mut min_ids = Vec::with_capacity(n);
    for (key, token) in keys.iter().zip(id_tokens.iter()) {
        let token_str = key_arg(token);
        let min_id = if token_str == "$" {
            match server.keyspace.with_stream(key, |log| log.and_then(|l| l.last_id())).await {
                Ok(v) => v.unwrap_or(StreamId::ZERO),
                Err(e) => return Outcome::reply(e.to_frame()),
            }
        } else {
            match stream::parse_explicit_id(&token_str) {
                Ok(id) => id,
                Err(e) => return Outcome::reply(e.to_frame()),
            }
        };
        min_ids.push(min_id);
    }

    if let Some(results) = read_streams_once(server, &keys, &min_ids).await {
        return Outcome::reply(results);
    }

    let Some(block_ms) = block_ms else {
        return Outcome::reply(Frame::null_bulk());
    };

    let (rx, _delivered) = {
        let mut waiters = server.waiters.lock().await;
        waiters.register(&keys, &min_ids)
    };

    let wake = if block_ms == 0 {
        rx.await.ok()
    } else {
        tokio::time::timeout(Duration::from_millis(block_ms), rx)
            .await
            .ok()
            .and_then(|r| r.ok())
    };

    match wake {
        Some((key, entry)) => Outcome::reply(Frame::array(vec![Frame::array(vec![
            Frame::bulk(key),
            Frame::array(vec![encode_entry(&entry)]),
        ])])),
        None => {
            server.waiters.lock().await.reap_keys(&keys);
            Outcome::reply(Frame::null_bulk())
        }
    }
}

async fn read_streams_once(
    server: &Arc<Server>,
    keys: &[String],
    min_ids: &[StreamId],
) -> Option<Frame> {
    let mut per_key = Vec::new();
    for (key, min_id) in keys.iter().zip(min_ids.iter()) {
        let entries = server
            .keyspace
            .with_stream(key, |log| log.map(|l| l.after(*min_id)).unwrap_or_default())
            .await
            .ok()?;
        if !entries.is_empty() {
            per_key.push((key.clone(), entries));
        }
    }
    if per_key.is_empty() {
        return None;
    }
    Some(Frame::array(
        per_key
            .into_iter()
            .map(|(key, entries)| {
                Frame::array(vec![
                    Frame::bulk(key),
                    Frame::array(entries.iter().map(encode_entry).collect()),
                ])
            })
            .collect(),
    ))
}

async fn handle_psync(
    server: &Arc<Server>,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
) -> std::io::Result<()> {
    let full_resync = Frame::simple(format!("FULLRESYNC {} 0", server.replid));
    write_half.write_all(&full_resync.to_bytes()).await?;
    write_half
        .write_all(&Frame::Bulk(Some(replication::EMPTY_RDB_PAYLOAD.to_vec())).to_bytes())
        .await?;
    let getack = Frame::array(vec![
        Frame::bulk("REPLCONF"),
        Frame::bulk("getack"),
        Frame::bulk("*"),
    ]);
    write_half.write_all(&getack.to_bytes()).await?;
    Ok(())
}

