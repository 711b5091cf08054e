use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use relay_client::{CacheConnection, Connector, EndpointRole, ResilientCache, TcpConnector};
use relay_common::{CacheError, CacheSettings, CacheStore, GlobPattern, PoolOptions};

/// Keys the fake server returns per `SCAN` step, regardless of `COUNT`.
const SERVER_PAGE: usize = 2;
/// `GET` of this key is answered only after `SLOW_REPLY`.
const SLOW_KEY: &[u8] = b"slow";
const SLOW_REPLY: Duration = Duration::from_millis(200);

#[derive(Default)]
struct ServerState {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// Number of upcoming `SET`s to refuse with `-READONLY`.
    read_only_sets: AtomicUsize,
    /// Answer `ROLE` as a replica.
    replica: AtomicBool,
    accepted: AtomicUsize,
}

async fn spawn_server(state: Arc<ServerState>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            state.accepted.fetch_add(1, Ordering::SeqCst);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let _ = serve(stream, state).await;
            });
        }
    });

    addr
}

async fn serve(stream: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut out = Vec::new();
    loop {
        let args = match read_command(&mut reader).await? {
            Some(args) => args,
            None => return Ok(()),
        };
        out.clear();
        let quit = handle(&state, &args, &mut out);
        if args[0].eq_ignore_ascii_case(b"GET") && args.get(1).map(Vec::as_slice) == Some(SLOW_KEY) {
            tokio::time::sleep(SLOW_REPLY).await;
        }
        reader.get_mut().write_all(&out).await?;
        reader.get_mut().flush().await?;
        if quit {
            return Ok(());
        }
    }
}

fn handle(state: &ServerState, args: &[Vec<u8>], out: &mut Vec<u8>) -> bool {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let mut data = state.data.lock();
    match name.as_str() {
        "ROLE" => {
            out.extend_from_slice(b"*3\r\n");
            if state.replica.load(Ordering::SeqCst) {
                write_bulk(out, b"slave");
            } else {
                write_bulk(out, b"master");
            }
            write_integer(out, 0);
            out.extend_from_slice(b"*0\r\n");
        }
        "SET" => {
            let refused = state
                .read_only_sets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused {
                out.extend_from_slice(b"-READONLY You can't write against a read only replica.\r\n");
            } else {
                data.insert(args[1].clone(), args[2].clone());
                out.extend_from_slice(b"+OK\r\n");
            }
        }
        "GET" => match data.get(&args[1]) {
            Some(value) => write_bulk(out, value),
            None => out.extend_from_slice(b"$-1\r\n"),
        },
        "DEL" => {
            let removed = data.remove(&args[1]).is_some();
            write_integer(out, removed as i64);
        }
        "EXISTS" | "PEXPIRE" => write_integer(out, data.contains_key(&args[1]) as i64),
        "INCRBY" => {
            let by: i64 = parse_text(&args[2]);
            let current: i64 = data.get(&args[1]).map(|raw| parse_text(raw)).unwrap_or(0);
            let next = current + by;
            data.insert(args[1].clone(), next.to_string().into_bytes());
            write_integer(out, next);
        }
        "SCAN" => {
            let cursor: usize = parse_text(&args[1]);
            let pattern = GlobPattern::new(&String::from_utf8_lossy(&args[3]));
            let mut keys: Vec<String> = data
                .keys()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .collect();
            keys.sort();

            let end = (cursor + SERVER_PAGE).min(keys.len());
            let next = if end >= keys.len() { 0 } else { end };
            let page: Vec<&String> = keys[cursor.min(end)..end]
                .iter()
                .filter(|key| pattern.matches(key))
                .collect();

            out.extend_from_slice(b"*2\r\n");
            write_bulk(out, next.to_string().as_bytes());
            out.extend_from_slice(format!("*{}\r\n", page.len()).as_bytes());
            for key in page {
                write_bulk(out, key.as_bytes());
            }
        }
        "QUIT" => {
            out.extend_from_slice(b"+OK\r\n");
            return true;
        }
        _ => out.extend_from_slice(b"-ERR unknown command\r\n"),
    }
    false
}

fn parse_text<T: std::str::FromStr + Default>(raw: &[u8]) -> T {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or_default()
}

async fn read_command(reader: &mut BufReader<TcpStream>) -> io::Result<Option<Vec<Vec<u8>>>> {
    let mut line = Vec::new();
    if !read_line(reader, &mut line).await? {
        return Ok(None);
    }
    if line.first() != Some(&b'*') {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "expected array"));
    }
    let count: usize = parse_text(&line[1..]);
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if !read_line(reader, &mut line).await? || line.first() != Some(&b'$') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len: usize = parse_text(&line[1..]);
        let mut arg = vec![0u8; len + 2];
        reader.read_exact(&mut arg).await?;
        arg.truncate(len);
        args.push(arg);
    }
    Ok(Some(args))
}

async fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(true)
}

fn write_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn write_integer(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(format!(":{}\r\n", value).as_bytes());
}

fn settings_for(addr: String) -> CacheSettings {
    CacheSettings {
        connection_strings: HashMap::from([("presence".to_string(), addr)]),
        pool: PoolOptions {
            target_size: 2,
            connect_timeout: Some(Duration::from_secs(1)),
            read_timeout: Some(Duration::from_secs(1)),
            write_timeout: Some(Duration::from_secs(1)),
            ..PoolOptions::default()
        },
        ..CacheSettings::default()
    }
}

#[tokio::test]
async fn commands_roundtrip_over_tcp() {
    let state = Arc::new(ServerState::default());
    let addr = spawn_server(Arc::clone(&state)).await;
    let cache = ResilientCache::connect(&settings_for(addr), "presence")
        .await
        .expect("connect");

    cache
        .string_set("presence:1", "online", Some(Duration::from_secs(30)))
        .await
        .expect("set");
    assert_eq!(
        cache.string_get("presence:1").await.expect("get").as_deref(),
        Some("online")
    );
    assert_eq!(cache.string_get("presence:2").await.expect("get"), None);
    assert!(cache.key_exists("presence:1").await.expect("exists"));
    assert!(cache
        .update_expiration("presence:1", Duration::from_secs(5))
        .await
        .expect("expire"));
    assert_eq!(cache.string_increment("counter", 3).await.expect("incr"), 3);
    assert_eq!(cache.string_increment("counter", 4).await.expect("incr"), 7);
    assert!(cache.key_delete("presence:1").await.expect("del"));
    assert!(!cache.key_exists("presence:1").await.expect("exists"));

    // Every lease went back to the pool, so no extra sockets were opened.
    assert_eq!(state.accepted.load(Ordering::SeqCst), 1);
    let stats = cache.governor().stats();
    assert_eq!(stats.taken, 0);
    assert_eq!(stats.allocated, stats.idle);

    cache.shutdown().await;
}

#[tokio::test]
async fn read_only_reply_is_retried_on_a_new_socket() {
    let state = Arc::new(ServerState::default());
    state.read_only_sets.store(1, Ordering::SeqCst);
    let addr = spawn_server(Arc::clone(&state)).await;
    let cache = ResilientCache::connect(&settings_for(addr), "presence")
        .await
        .expect("connect");

    cache
        .string_set("session:9", "alive", None)
        .await
        .expect("set succeeds after failover");

    assert_eq!(state.accepted.load(Ordering::SeqCst), 2);
    assert_eq!(cache.metrics().snapshot().retries_total, 1);
    assert_eq!(
        cache.string_get("session:9").await.expect("get").as_deref(),
        Some("alive")
    );

    cache.shutdown().await;
}

#[tokio::test]
async fn scan_follows_the_cursor_to_the_end() {
    let state = Arc::new(ServerState::default());
    let addr = spawn_server(Arc::clone(&state)).await;
    let cache = ResilientCache::connect(&settings_for(addr), "presence")
        .await
        .expect("connect");

    for idx in 1..=5 {
        cache
            .string_set(&format!("user:{}", idx), "x", None)
            .await
            .expect("set");
    }
    cache.string_set("other", "x", None).await.expect("set");

    let mut keys: Vec<String> = cache
        .scan_keys("user:*")
        .try_collect()
        .await
        .expect("scan");
    keys.sort();
    assert_eq!(keys, vec!["user:1", "user:2", "user:3", "user:4", "user:5"]);

    cache.shutdown().await;
}

#[tokio::test]
async fn connection_to_a_replica_refuses_writes_locally() {
    let state = Arc::new(ServerState::default());
    state.replica.store(true, Ordering::SeqCst);
    let addr = spawn_server(Arc::clone(&state)).await;

    let connector = TcpConnector::new(addr, &PoolOptions::default()).expect("connector");
    let mut conn = connector.connect().await.expect("connect");
    assert_eq!(conn.endpoints()[0].role, EndpointRole::Replica);

    let err = conn
        .execute(&[b"SET", b"k", b"v"])
        .await
        .expect_err("write must be refused");
    assert!(matches!(err, CacheError::ReplicaWrite { .. }));
    assert!(conn.is_connected());
    assert!(state.data.lock().is_empty());

    assert!(conn.execute(&[b"GET", b"k"]).await.is_ok());
    conn.close().await;
}

#[tokio::test]
async fn cancelled_command_does_not_leak_its_reply_to_the_next_caller() {
    let state = Arc::new(ServerState::default());
    {
        let mut data = state.data.lock();
        data.insert(SLOW_KEY.to_vec(), b"value-of-slow".to_vec());
        data.insert(b"fast".to_vec(), b"value-of-fast".to_vec());
    }
    let addr = spawn_server(Arc::clone(&state)).await;
    let cache = ResilientCache::connect(&settings_for(addr), "presence")
        .await
        .expect("connect");

    let cancelled = tokio::time::timeout(Duration::from_millis(50), cache.string_get("slow")).await;
    assert!(cancelled.is_err());

    // The abandoned connection still owes a reply, so it must not be idle.
    let stats = cache.governor().stats();
    assert_eq!(stats.taken, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.allocated, 0);
    let metrics = cache.metrics().snapshot();
    assert_eq!(metrics.inflight, 0);
    assert_eq!(metrics.cancelled_total, 1);

    assert_eq!(
        cache.string_get("fast").await.expect("get").as_deref(),
        Some("value-of-fast")
    );
    assert_eq!(state.accepted.load(Ordering::SeqCst), 2);

    cache.shutdown().await;
}
