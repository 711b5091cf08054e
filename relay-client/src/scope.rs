//! # Connection Scope
//!
//! A one-shot lease on a pooled connection. `release` hands the connection
//! back exactly once, healthy or faulted; dropping an unreleased scope does
//! the synchronous part of the release and leaves any close to the pool's
//! maintenance pass.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relay_common::{CacheError, CacheResult};

use crate::connection::{CacheConnection, Connector};
use crate::governor::Governor;
use crate::resp::RespValue;

/// Lease on one connection from a [`Governor`].
pub struct ConnectionScope<C: Connector> {
    governor: Governor<C>,
    connection: Option<C::Connection>,
    faulted: bool,
    disposed: AtomicBool,
}

impl<C: Connector> ConnectionScope<C> {
    pub(crate) fn new(governor: Governor<C>, connection: C::Connection) -> Self {
        ConnectionScope {
            governor,
            connection: Some(connection),
            faulted: false,
            disposed: AtomicBool::new(false),
        }
    }

    /// The leased connection, or `None` once released.
    pub fn connection(&self) -> Option<&C::Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut C::Connection> {
        self.connection.as_mut()
    }

    /// Keyed string commands over the leased connection.
    pub fn database(&mut self) -> Database<'_, C::Connection> {
        Database {
            conn: self.connection.as_mut(),
        }
    }

    /// Server-level commands (key scanning) over the leased connection.
    pub fn server(&mut self) -> Server<'_, C::Connection> {
        Server {
            conn: self.connection.as_mut(),
        }
    }

    /// Routes the release to disposal instead of recycling.
    pub fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn is_released(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns the connection to the pool. Later calls are no-ops.
    pub async fn release(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = self.connection.take() {
            if self.faulted {
                self.governor.return_faulted(conn).await;
            } else {
                self.governor.return_connection(conn).await;
            }
        }
    }

    /// Releases without awaiting. A connection that cannot be recycled is
    /// queued for the pool to close later. Later calls are no-ops.
    pub fn release_detached(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = self.connection.take() {
            self.governor.return_detached(conn, self.faulted);
        }
    }
}

impl<C: Connector> Drop for ConnectionScope<C> {
    fn drop(&mut self) {
        self.release_detached();
    }
}

fn released() -> CacheError {
    io::Error::new(io::ErrorKind::NotConnected, "connection scope already released").into()
}

/// Turns an error reply into `CacheError::Server`.
fn reject_error(reply: RespValue) -> CacheResult<RespValue> {
    match reply {
        RespValue::Error(message) => Err(CacheError::server(&message)),
        other => Ok(other),
    }
}

/// TTLs go out in milliseconds; zero would be rejected by the server.
fn ttl_millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

/// Keyed string commands over a leased connection.
pub struct Database<'a, T: CacheConnection> {
    conn: Option<&'a mut T>,
}

impl<'a, T: CacheConnection> Database<'a, T> {
    async fn run(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        reject_error(conn.execute(args).await?)
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub async fn get(&mut self, key: &str) -> CacheResult<Option<String>> {
        match self.run(&[b"GET", key.as_bytes()]).await? {
            RespValue::Bulk(Some(data)) => String::from_utf8(data)
                .map(Some)
                .map_err(|_| CacheError::UnexpectedResponse),
            RespValue::Bulk(None) => Ok(None),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    /// Sets a value, with an optional millisecond-precision expiry.
    pub async fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let reply = match ttl {
            Some(ttl) => {
                let millis = ttl_millis(ttl);
                self.run(&[b"SET", key.as_bytes(), value.as_bytes(), b"PX", millis.as_bytes()])
                    .await?
            }
            None => self.run(&[b"SET", key.as_bytes(), value.as_bytes()]).await?,
        };
        match reply {
            RespValue::Simple(_) => Ok(()),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    /// Sets a TTL on an existing key. Returns true when the TTL was set.
    pub async fn expire(&mut self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let millis = ttl_millis(ttl);
        match self.run(&[b"PEXPIRE", key.as_bytes(), millis.as_bytes()]).await? {
            RespValue::Integer(value) => Ok(value == 1),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn delete(&mut self, key: &str) -> CacheResult<bool> {
        match self.run(&[b"DEL", key.as_bytes()]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    pub async fn exists(&mut self, key: &str) -> CacheResult<bool> {
        match self.run(&[b"EXISTS", key.as_bytes()]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }

    pub async fn increment(&mut self, key: &str, by: i64) -> CacheResult<i64> {
        let by = by.to_string();
        match self.run(&[b"INCRBY", key.as_bytes(), by.as_bytes()]).await? {
            RespValue::Integer(value) => Ok(value),
            _ => Err(CacheError::UnexpectedResponse),
        }
    }
}

/// One page of an incremental key scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next page; zero when the scan is complete.
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Server-level commands over a leased connection.
pub struct Server<'a, T: CacheConnection> {
    conn: Option<&'a mut T>,
}

impl<'a, T: CacheConnection> Server<'a, T> {
    /// Runs one `SCAN cursor MATCH pattern COUNT count` step.
    pub async fn scan_page(&mut self, cursor: u64, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        let cursor = cursor.to_string();
        let count = count.to_string();
        let reply = conn
            .execute(&[
                b"SCAN",
                cursor.as_bytes(),
                b"MATCH",
                pattern.as_bytes(),
                b"COUNT",
                count.as_bytes(),
            ])
            .await?;

        let mut items = match reject_error(reply)? {
            RespValue::Array(items) if items.len() == 2 => items.into_iter(),
            _ => return Err(CacheError::UnexpectedResponse),
        };
        let next = match items.next() {
            Some(RespValue::Bulk(Some(raw))) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|text| text.parse::<u64>().ok())
                .ok_or(CacheError::UnexpectedResponse)?,
            _ => return Err(CacheError::UnexpectedResponse),
        };
        let keys = match items.next() {
            Some(RespValue::Array(keys)) => keys
                .into_iter()
                .map(|key| match key {
                    RespValue::Bulk(Some(raw)) => {
                        String::from_utf8(raw).map_err(|_| CacheError::UnexpectedResponse)
                    }
                    _ => Err(CacheError::UnexpectedResponse),
                })
                .collect::<CacheResult<Vec<_>>>()?,
            _ => return Err(CacheError::UnexpectedResponse),
        };

        Ok(ScanPage { cursor: next, keys })
    }
}
