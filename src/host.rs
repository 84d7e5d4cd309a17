//! Host — a single backend endpoint with a bounded idle connection pool and
//! dial-throttling after a failed connect.
//!
//! Grounded on the teacher's `pool.rs` checkout/checkin/idle-reaper shape,
//! generalized from "one bucket per (database, role)" to "one bucket per
//! backend address", and on the original `memcache/host.go` for the exact
//! dial-cooldown and no-reply shortcut semantics.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::protocol::{self, Cmd, Item, ProtocolError, Request, Response, Status};

const MAX_FREE_CONNS: usize = 20;
const DIAL_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct HostTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for HostTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(300),
            read: Duration::from_secs(2),
            write: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub enum HostError {
    WaitForRetry,
    DialFailed(std::io::Error),
    IoFailed(std::io::Error),
    Timeout,
    ProtocolMismatch(String),
    ServerError(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::WaitForRetry => write!(f, "wait for retry"),
            HostError::DialFailed(e) => write!(f, "dial failed: {e}"),
            HostError::IoFailed(e) => write!(f, "io failed: {e}"),
            HostError::Timeout => write!(f, "timeout"),
            HostError::ProtocolMismatch(s) => write!(f, "protocol mismatch: {s}"),
            HostError::ServerError(s) => write!(f, "server error: {s}"),
        }
    }
}

impl std::error::Error for HostError {}

/// True for every kind except `WaitForRetry` — used by `Client` to pick the
/// right feedback magnitude.
impl HostError {
    pub fn is_wait_for_retry(&self) -> bool {
        matches!(self, HostError::WaitForRetry)
    }
}

type Conn = BufReader<TcpStream>;

/// A single backend endpoint.
pub struct Host {
    pub addr: String,
    /// Stable index into the Scheduler's host array; used as score-vector
    /// and replica-list identity.
    pub offset: u32,
    idle: Mutex<VecDeque<Conn>>,
    next_dial_allowed_at: Mutex<Instant>,
    timeouts: HostTimeouts,
    metrics: Arc<Metrics>,
}

impl Host {
    pub fn new(addr: impl Into<String>, offset: u32, timeouts: HostTimeouts, metrics: Arc<Metrics>) -> Self {
        let addr = normalize_addr(addr.into());
        Self {
            addr,
            offset,
            idle: Mutex::new(VecDeque::new()),
            next_dial_allowed_at: Mutex::new(Instant::now()),
            timeouts,
            metrics,
        }
    }

    fn acquire(&self) -> AcquireOutcome {
        self.metrics.host_checkouts.fetch_add(1, Ordering::Relaxed);
        if let Some(conn) = self.idle.lock().unwrap().pop_front() {
            self.metrics.host_reuses.fetch_add(1, Ordering::Relaxed);
            return AcquireOutcome::Reused(conn);
        }
        let now = Instant::now();
        let next = *self.next_dial_allowed_at.lock().unwrap();
        if now < next {
            self.metrics.host_throttled.fetch_add(1, Ordering::Relaxed);
            return AcquireOutcome::Throttled;
        }
        AcquireOutcome::Dial
    }

    async fn dial(&self) -> Result<Conn, HostError> {
        self.metrics.host_dials.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.timeouts.connect, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(addr = %self.addr, "host: dialed new connection");
                Ok(BufReader::new(stream))
            }
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "host: dial failed, entering cooldown");
                self.metrics.host_dial_failures.fetch_add(1, Ordering::Relaxed);
                *self.next_dial_allowed_at.lock().unwrap() = Instant::now() + DIAL_COOLDOWN;
                Err(HostError::DialFailed(e))
            }
            Err(_) => {
                warn!(addr = %self.addr, "host: dial timed out, entering cooldown");
                self.metrics.host_dial_failures.fetch_add(1, Ordering::Relaxed);
                *self.next_dial_allowed_at.lock().unwrap() = Instant::now() + DIAL_COOLDOWN;
                Err(HostError::DialFailed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        }
    }

    fn release(&self, conn: Conn) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < MAX_FREE_CONNS {
            idle.push_back(conn);
        }
        // else: drop closes the socket.
    }

    /// Runs one request/response round trip against this host, handling
    /// pool checkout, dial-throttling, the no-reply shortcut, and per-call
    /// deadlines. Connections are discarded (not returned to the pool) on
    /// any error.
    async fn execute(&self, req: Request) -> Result<Response, HostError> {
        let mut conn = match self.acquire() {
            AcquireOutcome::Reused(conn) => conn,
            AcquireOutcome::Throttled => return Err(HostError::WaitForRetry),
            AcquireOutcome::Dial => self.dial().await?,
        };

        let encoded = protocol::encode_request(&req);
        let write_result =
            tokio::time::timeout(self.timeouts.write, conn.get_mut().write_all(&encoded)).await;
        match write_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(HostError::IoFailed(e)),
            Err(_) => {
                self.metrics.host_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(HostError::Timeout);
            }
        }

        if req.no_reply {
            self.release(conn);
            return Ok(Response::stored());
        }

        let cmd = req.cmd;
        let read_result = tokio::time::timeout(self.timeouts.read, protocol::read_response(&mut conn, cmd)).await;
        let resp = match read_result {
            Ok(Ok(resp)) => resp,
            Ok(Err(ProtocolError::Eof)) => {
                return Err(HostError::IoFailed(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "backend closed connection",
                )));
            }
            Ok(Err(e)) => return Err(HostError::ProtocolMismatch(e.to_string())),
            Err(_) => {
                self.metrics.host_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(HostError::Timeout);
            }
        };

        if let Some(Status::ServerError) = resp.status {
            // Backend is still speaking the protocol correctly; the
            // connection can be reused.
            self.release(conn);
            return Err(HostError::ServerError(resp.msg.clone()));
        }

        self.release(conn);
        Ok(resp)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Item>, HostError> {
        let req = Request { cmd: Cmd::Get, keys: vec![key.to_string()], item: None, delta: 0, no_reply: false };
        let mut resp = self.execute(req).await?;
        Ok(resp.items.remove(key))
    }

    pub async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Item>, HostError> {
        let req = Request { cmd: Cmd::Get, keys: keys.to_vec(), item: None, delta: 0, no_reply: false };
        let resp = self.execute(req).await?;
        Ok(resp.items)
    }

    pub async fn set(&self, key: &str, item: Item, no_reply: bool) -> Result<bool, HostError> {
        let req = Request {
            cmd: Cmd::Set,
            keys: vec![key.to_string()],
            item: Some(item),
            delta: 0,
            no_reply,
        };
        let resp = self.execute(req).await?;
        Ok(no_reply || resp.status == Some(Status::Stored))
    }

    pub async fn append(&self, key: &str, value: Bytes) -> Result<bool, HostError> {
        let req = Request {
            cmd: Cmd::Append,
            keys: vec![key.to_string()],
            item: Some(Item { body: value, flags: 0, exptime: 0, cas: 0 }),
            delta: 0,
            no_reply: false,
        };
        let resp = self.execute(req).await?;
        Ok(resp.status == Some(Status::Stored))
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, HostError> {
        let req = Request { cmd: Cmd::Incr, keys: vec![key.to_string()], item: None, delta, no_reply: false };
        let resp = self.execute(req).await?;
        resp.counter.ok_or_else(|| HostError::ProtocolMismatch("expected counter value".into()))
    }

    pub async fn delete(&self, key: &str) -> Result<bool, HostError> {
        let req = Request { cmd: Cmd::Delete, keys: vec![key.to_string()], item: None, delta: 0, no_reply: false };
        let resp = self.execute(req).await?;
        Ok(resp.status == Some(Status::Deleted))
    }

    pub async fn stat(&self, keys: &[String]) -> Result<String, HostError> {
        let req = Request { cmd: Cmd::Stats, keys: keys.to_vec(), item: None, delta: 0, no_reply: false };
        let resp = self.execute(req).await?;
        Ok(resp.msg)
    }

    /// Drains and closes every pooled idle connection. Unlike the original
    /// Go implementation (whose `Close` body was entirely commented out and
    /// therefore leaked pooled sockets), this actually closes them: dropping
    /// each `Conn` closes its underlying `TcpStream`.
    pub async fn close(&self) {
        let mut idle = self.idle.lock().unwrap();
        let drained: Vec<Conn> = idle.drain(..).collect();
        drop(idle);
        for mut conn in drained {
            let _ = conn.get_mut().shutdown().await;
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    pub fn is_throttled(&self) -> bool {
        Instant::now() < *self.next_dial_allowed_at.lock().unwrap()
    }
}

enum AcquireOutcome {
    Reused(Conn),
    Throttled,
    Dial,
}

fn normalize_addr(addr: String) -> String {
    if has_port(&addr) {
        addr
    } else {
        format!("{addr}:11211")
    }
}

/// True if `addr` already carries a port, IPv6-safe (checks for a `:` after
/// the last `]`, matching the original `hasPort` helper).
fn has_port(addr: &str) -> bool {
    match addr.rfind(']') {
        Some(bracket) => addr[bracket..].contains(':'),
        None => addr.contains(':'),
    }
}

/// A snapshot of one Host's pool state, used by the admin `/metrics` and
/// `/status` endpoints.
pub struct HostSnapshot {
    pub addr: String,
    pub idle: usize,
    pub throttled: bool,
}

/// Registry of all configured backend hosts, keyed by their stable offset.
pub struct HostRegistry {
    hosts: Vec<std::sync::Arc<Host>>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<std::sync::Arc<Host>>) -> Self {
        Self { hosts }
    }

    pub fn get(&self, offset: u32) -> Option<&std::sync::Arc<Host>> {
        self.hosts.get(offset as usize)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<Host>> {
        self.hosts.iter()
    }

    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        self.hosts
            .iter()
            .map(|h| HostSnapshot { addr: h.addr.clone(), idle: h.idle_len(), throttled: h.is_throttled() })
            .collect()
    }

    pub async fn close_all(&self) {
        for h in &self.hosts {
            h.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_missing_port() {
        assert_eq!(normalize_addr("cache01".into()), "cache01:11211");
        assert_eq!(normalize_addr("cache01:11212".into()), "cache01:11212");
    }

    #[test]
    fn has_port_is_ipv6_safe() {
        assert!(!has_port("::1"));
        assert!(has_port("[::1]:11211"));
        assert!(!has_port("[::1]"));
    }

    #[tokio::test]
    async fn dial_cooldown_blocks_without_attempting_connect() {
        let metrics = Arc::new(Metrics::new());
        let host = Host::new("127.0.0.1:1", 0, HostTimeouts::default(), Arc::clone(&metrics));
        // Force the host into a cooldown window.
        *host.next_dial_allowed_at.lock().unwrap() = Instant::now() + Duration::from_secs(30);
        let err = host.get("k").await.unwrap_err();
        assert!(err.is_wait_for_retry());
        assert_eq!(metrics.host_throttled.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.host_dials.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn idle_len_starts_at_zero() {
        let host = Host::new("127.0.0.1:1", 0, HostTimeouts::default(), Arc::new(Metrics::new()));
        assert_eq!(host.idle_len(), 0);
        host.close().await;
        assert_eq!(host.idle_len(), 0);
    }

}
