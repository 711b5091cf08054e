//! In-process connector used by the unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_common::{is_read_only_reply, CacheError, CacheResult, PoolOptions};

use crate::connection::{CacheConnection, Connector, Endpoint, EndpointRole};
use crate::resp::RespValue;

#[derive(Default)]
pub(crate) struct FakeBackend {
    next_id: AtomicUsize,
    /// New connections see their endpoint as a replica while set.
    pub replica: AtomicBool,
    pub fail_connect: AtomicBool,
    pub closed: Mutex<Vec<usize>>,
    /// Scripted replies, consumed in order; `+OK` once exhausted.
    pub replies: Mutex<VecDeque<CacheResult<RespValue>>>,
    pub commands: Mutex<Vec<Vec<String>>>,
}

impl FakeBackend {
    pub fn opened(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn closed_ids(&self) -> Vec<usize> {
        self.closed.lock().clone()
    }

    pub fn push_reply(&self, reply: CacheResult<RespValue>) {
        self.replies.lock().push_back(reply);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    pub backend: Arc<FakeBackend>,
}

pub(crate) struct FakeConnection {
    pub id: usize,
    backend: Arc<FakeBackend>,
    connected: bool,
    endpoints: Vec<Endpoint>,
}

impl FakeConnection {
    pub fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> CacheResult<FakeConnection> {
        tokio::task::yield_now().await;
        if self.backend.fail_connect.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into());
        }
        let role = if self.backend.replica.load(Ordering::SeqCst) {
            EndpointRole::Replica
        } else {
            EndpointRole::Primary
        };
        Ok(FakeConnection {
            id: self.backend.next_id.fetch_add(1, Ordering::SeqCst),
            backend: Arc::clone(&self.backend),
            connected: true,
            endpoints: vec![Endpoint {
                address: "fake:6379".to_string(),
                role,
            }],
        })
    }
}

#[async_trait]
impl CacheConnection for FakeConnection {
    async fn execute(&mut self, args: &[&[u8]]) -> CacheResult<RespValue> {
        self.backend.commands.lock().push(
            args.iter()
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect(),
        );
        let reply = self
            .backend
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(RespValue::Simple(b"OK".to_vec())));

        match &reply {
            Err(CacheError::Io(_)) | Err(CacheError::Protocol) => self.connected = false,
            Ok(RespValue::Error(message)) if is_read_only_reply(&String::from_utf8_lossy(message)) => {
                self.endpoints[0].role = EndpointRole::Replica;
            }
            _ => {}
        }
        reply
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    async fn close(self) {
        self.backend.closed.lock().push(self.id);
    }
}

pub(crate) fn options(target_size: usize) -> PoolOptions {
    PoolOptions {
        target_size,
        ..PoolOptions::default()
    }
}
