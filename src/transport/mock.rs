//! In-memory transport for driver tests.
//!
//! Behaves like an instrument on the other end of a socket: commands are
//! recorded in a transcript, queries are answered from a reply table. A
//! [`MockHandle`] keeps shared access to the tables after the transport has
//! been boxed into a session, so tests can queue replies mid-scenario and
//! inspect what the driver actually sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, DEFAULT_TIMEOUT};
use crate::error::{ScpiError, ScpiResult};

type Responder = Box<dyn FnMut(&str) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct Shared {
    /// Fixed query -> reply table.
    replies: HashMap<String, Vec<u8>>,
    /// One-shot replies, consumed in FIFO order before the fixed table.
    queued: HashMap<String, VecDeque<Vec<u8>>>,
    /// Every write the driver performed, terminators stripped.
    transcript: Vec<String>,
    responder: Option<Responder>,
}

/// Shared view of a [`MockTransport`]'s state, usable after the transport
/// has been handed to a session.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
}

impl MockHandle {
    /// Install a fixed reply for a query command.
    pub fn set_reply(&self, cmd: &str, reply: &str) {
        if let Ok(mut s) = self.shared.lock() {
            s.replies.insert(cmd.to_string(), reply.as_bytes().to_vec());
        }
    }

    /// Install a fixed binary reply (block data) for a query command.
    pub fn set_reply_bytes(&self, cmd: &str, reply: Vec<u8>) {
        if let Ok(mut s) = self.shared.lock() {
            s.replies.insert(cmd.to_string(), reply);
        }
    }

    /// Queue a one-shot reply; earlier queued replies for the same command
    /// are served first.
    pub fn queue_reply(&self, cmd: &str, reply: &str) {
        if let Ok(mut s) = self.shared.lock() {
            s.queued
                .entry(cmd.to_string())
                .or_default()
                .push_back(reply.as_bytes().to_vec());
        }
    }

    /// Install a dynamic responder consulted before the reply tables.
    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
    {
        if let Ok(mut s) = self.shared.lock() {
            s.responder = Some(Box::new(f));
        }
    }

    /// All commands written so far, in order.
    pub fn transcript(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.transcript.clone())
            .unwrap_or_default()
    }

    /// Whether any write matched `cmd` exactly.
    pub fn saw(&self, cmd: &str) -> bool {
        self.transcript().iter().any(|c| c == cmd)
    }
}

/// Scripted instrument stand-in.
pub struct MockTransport {
    resource: String,
    timeout: Duration,
    connected: bool,
    shared: Arc<Mutex<Shared>>,
    /// Bytes waiting to be read back by the session.
    inbox: VecDeque<u8>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock with an empty reply table.
    pub fn new() -> Self {
        Self {
            resource: "MOCK::INSTR".to_string(),
            timeout: DEFAULT_TIMEOUT,
            connected: true,
            shared: Arc::new(Mutex::new(Shared::default())),
            inbox: VecDeque::new(),
        }
    }

    /// Handle for scripting replies and reading the transcript.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn lookup(&mut self, cmd: &str) -> Option<Vec<u8>> {
        let mut s = self.shared.lock().ok()?;
        if let Some(f) = s.responder.as_mut() {
            if let Some(reply) = f(cmd) {
                return Some(reply);
            }
        }
        if let Some(queue) = s.queued.get_mut(cmd) {
            if let Some(reply) = queue.pop_front() {
                return Some(reply);
            }
        }
        s.replies.get(cmd).cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn write_raw(&mut self, data: &[u8]) -> ScpiResult<()> {
        if !self.connected {
            return Err(ScpiError::NotConnected(self.resource.clone()));
        }
        let cmd = String::from_utf8_lossy(data)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if let Ok(mut s) = self.shared.lock() {
            s.transcript.push(cmd.clone());
        }
        if cmd.contains('?') {
            if let Some(mut reply) = self.lookup(&cmd) {
                if reply.last() != Some(&b'\n') {
                    reply.push(b'\n');
                }
                self.inbox.extend(reply);
            }
        }
        Ok(())
    }

    async fn read_until(&mut self, delim: u8) -> ScpiResult<Vec<u8>> {
        if !self.connected {
            return Err(ScpiError::NotConnected(self.resource.clone()));
        }
        if self.inbox.is_empty() {
            // No scripted reply: behave like a silent instrument.
            return Err(ScpiError::ReadTimeout(self.timeout));
        }
        let mut out = Vec::new();
        while let Some(b) = self.inbox.pop_front() {
            out.push(b);
            if b == delim {
                break;
            }
        }
        Ok(out)
    }

    async fn read_exact(&mut self, n: usize) -> ScpiResult<Vec<u8>> {
        if !self.connected {
            return Err(ScpiError::NotConnected(self.resource.clone()));
        }
        if self.inbox.len() < n {
            return Err(ScpiError::ReadTimeout(self.timeout));
        }
        Ok(self.inbox.drain(..n).collect())
    }

    async fn close(&mut self) -> ScpiResult<()> {
        self.connected = false;
        Ok(())
    }
}
