//! # Cache Connections
//!
//! Purpose: The pooled resource. A connection executes RESP commands against
//! one backing-store endpoint and tracks two facts the pool validates on
//! every rent and return: whether the transport is still connected, and
//! whether the endpoint is currently serving as a replica.
//!
//! ## Design Principles
//! 1. **Trait Seam**: The governor is generic over `Connector`, so tests drive
//!    it with in-process fakes and production uses `TcpConnector`.
//! 2. **Cached Health**: Validation reads flags; it never does network IO.
//! 3. **Buffer Reuse**: Each TCP connection keeps its own encode/parse buffers.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use relay_common::{is_read_only_reply, CacheError, CacheResult, PoolOptions};

use crate::resp::{encode_command, read_response, RespValue};

/// Serving role of a backing-store endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Primary,
    Replica,
    /// The endpoint did not answer `ROLE`; treated as writable.
    Unknown,
}

/// An endpoint a connection knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub role: EndpointRole,
}

impl Endpoint {
    pub fn is_writable(&self) -> bool {
        self.role != EndpointRole::Replica
    }
}

/// A live handle to the backing store.
#[async_trait]
pub trait CacheConnection: Send + Sized + 'static {
    /// Executes one command and returns the raw reply.
    ///
    /// Error replies come back as `Ok(RespValue::Error(..))`; only transport,
    /// framing, and routing failures are `Err`.
    async fn execute(&mut self, args: &[&[u8]]) -> CacheResult<RespValue>;

    /// Whether the transport is still usable.
    ///
    /// A connection whose last command was cancelled before its reply was
    /// read must report false: the unread reply would be handed to the next
    /// command.
    fn is_connected(&self) -> bool;

    /// Every endpoint this connection routes to.
    fn endpoints(&self) -> &[Endpoint];

    /// Closes the connection. Never fails; teardown errors are only logged.
    async fn close(self);
}

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: CacheConnection;

    async fn connect(&self) -> CacheResult<Self::Connection>;
}

/// Commands that a replica refuses.
pub fn is_write_command(name: &[u8]) -> bool {
    const WRITES: [&[u8]; 9] = [
        b"SET", b"DEL", b"EXPIRE", b"PEXPIRE", b"INCR", b"INCRBY", b"DECR", b"DECRBY", b"UNLINK",
    ];
    WRITES.iter().any(|cmd| cmd.eq_ignore_ascii_case(name))
}

/// Reads the role out of a `ROLE` reply.
pub fn parse_role(reply: &RespValue) -> EndpointRole {
    let kind = match reply {
        RespValue::Array(items) => match items.first() {
            Some(RespValue::Bulk(Some(kind))) | Some(RespValue::Simple(kind)) => kind.as_slice(),
            _ => return EndpointRole::Unknown,
        },
        _ => return EndpointRole::Unknown,
    };

    if kind.eq_ignore_ascii_case(b"master") {
        EndpointRole::Primary
    } else if kind.eq_ignore_ascii_case(b"slave") || kind.eq_ignore_ascii_case(b"replica") {
        EndpointRole::Replica
    } else {
        EndpointRole::Unknown
    }
}

/// Connects to a single endpoint over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Creates a connector for `address` (`ip:port` or `host:port`).
    pub fn new(address: impl Into<String>, options: &PoolOptions) -> CacheResult<Self> {
        let address = address.into();
        if address.parse::<SocketAddr>().is_err() {
            let valid = address
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(CacheError::InvalidAddress);
            }
        }

        Ok(TcpConnector {
            address,
            connect_timeout: options.connect_timeout,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpConnection;

    async fn connect(&self) -> CacheResult<TcpConnection> {
        let stream = with_timeout(self.connect_timeout, TcpStream::connect(&self.address)).await?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut conn = TcpConnection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            endpoints: vec![Endpoint {
                address: self.address.clone(),
                role: EndpointRole::Unknown,
            }],
            connected: true,
            in_flight: false,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        };

        let role = match conn.execute(&[b"ROLE"]).await? {
            RespValue::Error(_) => EndpointRole::Unknown,
            reply => parse_role(&reply),
        };
        conn.endpoints[0].role = role;
        tracing::debug!(address = %self.address, ?role, "opened cache connection");
        Ok(conn)
    }
}

/// Single TCP connection with reusable buffers.
pub struct TcpConnection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    endpoints: Vec<Endpoint>,
    connected: bool,
    // Set while a request is written but its reply is not yet parsed.
    in_flight: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TcpConnection {
    async fn round_trip(&mut self) -> CacheResult<RespValue> {
        let request = &self.write_buf;
        let stream = self.reader.get_mut();
        with_timeout(self.write_timeout, async {
            stream.write_all(request).await?;
            stream.flush().await
        })
        .await?;

        with_timeout(
            self.read_timeout,
            read_response(&mut self.reader, &mut self.line_buf),
        )
        .await
    }
}

#[async_trait]
impl CacheConnection for TcpConnection {
    async fn execute(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed").into());
        }
        let is_write = args.first().map(|name| is_write_command(name)).unwrap_or(false);
        if is_write && !self.endpoints[0].is_writable() {
            return Err(CacheError::ReplicaWrite {
                endpoint: self.endpoints[0].address.clone(),
            });
        }

        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        // Cleared only once a full reply is parsed. If this future is dropped
        // mid-command, the flag stays set and the pool discards the connection.
        self.in_flight = true;
        let result = self.round_trip().await;
        self.in_flight = false;
        match &result {
            Err(_) => {
                // The stream may hold half a reply; it cannot be reused.
                self.connected = false;
            }
            Ok(RespValue::Error(message)) if is_read_only_reply(&String::from_utf8_lossy(message)) => {
                tracing::warn!(
                    address = %self.endpoints[0].address,
                    "endpoint rejected a write as read-only; marking it a replica"
                );
                self.endpoints[0].role = EndpointRole::Replica;
            }
            Ok(_) => {}
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.in_flight
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    async fn close(mut self) {
        if self.is_connected() {
            let _ = self.execute(&[b"QUIT"]).await;
        }
        if let Err(err) = self.reader.get_mut().shutdown().await {
            tracing::debug!(error = %err, "error while shutting down cache connection");
        }
    }
}

async fn with_timeout<T, E, F>(limit: Option<Duration>, fut: F) -> CacheResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    CacheError: From<E>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "cache command timed out").into()),
        },
        None => fut.await.map_err(CacheError::from),
    }
}
