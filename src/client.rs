//! Client — the N/W/R quorum executor sitting on top of a `Scheduler`.
//!
//! Grounded on `original_source/src/memcache/client.go` (stop conditions,
//! feedback magnitudes, `Incr`'s max-of-replicas semantics) and `rclient.go`
//! (the read-only `AccessDenied` variant).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::host::{Host, HostError};
use crate::metrics::Metrics;
use crate::protocol::Item;
use crate::scheduler::Scheduler;

/// Channel depth for the async-tail-replication worker. Same order of
/// magnitude as the scheduler's feedback channel — this is also a
/// best-effort side channel that's fine to drop under sustained load.
const TAIL_CHANNEL_CAPACITY: usize = 256;

/// A deferred write to a replica beyond the `W` that already satisfied the
/// quorum, queued when `Config::async_tail_replication` is enabled.
enum TailJob {
    Set { host: Arc<Host>, key: String, item: Item, no_reply: bool },
    Append { host: Arc<Host>, key: String, value: Bytes },
    Incr { host: Arc<Host>, key: String, delta: i64 },
}

fn spawn_tail_worker(mut rx: mpsc::Receiver<TailJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                TailJob::Set { host, key, item, no_reply } => {
                    let _ = host.set(&key, item, no_reply).await;
                }
                TailJob::Append { host, key, value } => {
                    let _ = host.append(&key, value).await;
                }
                TailJob::Incr { host, key, delta } => {
                    let _ = host.incr(&key, delta).await;
                }
            }
        }
    });
}

#[derive(Debug)]
pub enum ClientError {
    /// A write could not reach `W` successful replicas.
    WriteFailed,
    /// A `Get` tried at least `N` hosts without ever returning a hit or a
    /// miss (every attempt errored).
    ReadQuorumNotMet,
    /// The read-only client variant refuses all mutations.
    AccessDenied,
    /// Every host attempted returned a hard error; carries the last one.
    Host(HostError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::WriteFailed => write!(f, "write quorum not met"),
            ClientError::ReadQuorumNotMet => write!(f, "read quorum not met"),
            ClientError::AccessDenied => write!(f, "access denied: read-only client"),
            ClientError::Host(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Outcome of a single-key `Get`: the value (if any) plus the addresses of
/// every host actually contacted, for the front-end's access log line.
pub struct GetOutcome {
    pub value: Option<Item>,
    pub hosts: Vec<String>,
}

pub struct GetMultiOutcome {
    pub items: HashMap<String, Item>,
    pub hosts: Vec<String>,
}

/// N/W/R quorum parameters. Construction upholds `0 < r <= w <= n`; the
/// scheduler's own replica count is checked against `n` by the caller at
/// config-validation time (see `config::Config::validate`).
#[derive(Debug, Clone, Copy)]
pub struct Quorum {
    pub n: usize,
    pub w: usize,
    pub r: usize,
}

/// The quorum executor. Read-only mode is a flag rather than a distinct
/// type so front-ends can hold a single `Client` regardless of mode — the
/// mutating methods simply short-circuit to `AccessDenied` before touching
/// the scheduler.
pub struct Client {
    scheduler: Arc<dyn Scheduler>,
    quorum: Quorum,
    read_only: bool,
    tail_tx: Option<mpsc::Sender<TailJob>>,
    metrics: Arc<Metrics>,
}

impl Client {
    /// `async_tail_replication`: once `W` replicas have confirmed a write,
    /// the remaining up-to-`N` replicas are written by a background worker
    /// instead of blocking the caller. The worker's channel is bounded;
    /// when it's full the extra write is dropped silently (counted in
    /// `Metrics::async_tail_dropped`) rather than backing up the foreground
    /// path.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        quorum: Quorum,
        read_only: bool,
        async_tail_replication: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        let tail_tx = if async_tail_replication {
            let (tx, rx) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
            spawn_tail_worker(rx);
            Some(tx)
        } else {
            None
        };
        Self { scheduler, quorum, read_only, tail_tx, metrics }
    }

    pub fn read_only(scheduler: Arc<dyn Scheduler>, quorum: Quorum, metrics: Arc<Metrics>) -> Self {
        Self::new(scheduler, quorum, true, false, metrics)
    }

    fn queue_tail(&self, jobs: impl Iterator<Item = TailJob>) {
        let Some(tx) = &self.tail_tx else { return };
        for job in jobs {
            if tx.try_send(job).is_err() {
                self.metrics.async_tail_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<GetOutcome, ClientError> {
        let hosts = self.scheduler.get_hosts_by_key(key);
        let n = self.quorum.n.min(hosts.len());
        let r = self.quorum.r;

        let mut tried = Vec::with_capacity(n);
        let mut hits_or_misses = 0usize;
        let mut last_err: Option<HostError> = None;

        for (i, host) in hosts.iter().take(n.max(1)).enumerate() {
            tried.push(host.addr.clone());
            let start = Instant::now();
            match host.get(key).await {
                Ok(Some(item)) => {
                    let t = start.elapsed().as_secs_f64();
                    self.scheduler.feedback(host, key, 1.0 - t.sqrt() * t);
                    return Ok(GetOutcome { value: Some(item), hosts: tried });
                }
                Ok(None) => {
                    hits_or_misses += 1;
                    self.scheduler.feedback(host, key, 0.1);
                }
                Err(e) if e.is_wait_for_retry() => {
                    self.scheduler.feedback(host, key, -2.0);
                    last_err = Some(e);
                }
                Err(e) => {
                    self.scheduler.feedback(host, key, -5.0);
                    last_err = Some(e);
                }
            }

            if hits_or_misses >= r && i + 1 >= n {
                break;
            }
        }

        if hits_or_misses > 0 {
            self.metrics.reads_quorum_met.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(GetOutcome { value: None, hosts: tried });
        }

        self.metrics.reads_quorum_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        match last_err {
            Some(e) => Err(ClientError::Host(e)),
            None => Err(ClientError::ReadQuorumNotMet),
        }
    }

    pub async fn get_multi(&self, keys: &[&str]) -> Result<GetMultiOutcome, ClientError> {
        let groups = self.scheduler.divide_keys_by_bucket(keys);

        let mut tasks = Vec::with_capacity(groups.len());
        for (_, group_keys) in groups {
            let group_keys: Vec<String> = group_keys.into_iter().map(String::from).collect();
            let hosts = self.scheduler.get_hosts_by_key(&group_keys[0]);
            let n = self.quorum.n.min(hosts.len());
            let r = self.quorum.r;
            let scheduler = Arc::clone(&self.scheduler);

            tasks.push(tokio::spawn(async move {
                run_get_multi_group(scheduler, hosts, group_keys, n, r).await
            }));
        }

        let mut items = HashMap::new();
        let mut hosts_involved = Vec::new();
        let mut last_err: Option<HostError> = None;
        let mut any_hit = false;

        for task in tasks {
            match task.await {
                Ok((found, tried, err)) => {
                    if !found.is_empty() {
                        any_hit = true;
                    }
                    items.extend(found);
                    hosts_involved.extend(tried);
                    if err.is_some() {
                        last_err = err;
                    }
                }
                Err(e) => debug!(error = %e, "get_multi group task panicked"),
            }
        }

        if any_hit {
            last_err = None;
        }

        if let Some(e) = last_err {
            if items.is_empty() {
                return Err(ClientError::Host(e));
            }
        }

        Ok(GetMultiOutcome { items, hosts: hosts_involved })
    }

    pub async fn set(&self, key: &str, item: Item, no_reply: bool) -> Result<bool, ClientError> {
        if self.read_only {
            self.metrics.access_denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(ClientError::AccessDenied);
        }
        let hosts = self.scheduler.get_hosts_by_key(key);
        let n = self.quorum.n.min(hosts.len());
        let w = self.quorum.w;
        let mut suc = 0usize;

        for (i, host) in hosts.iter().take(n.max(1)).enumerate() {
            match host.set(key, item.clone(), no_reply).await {
                Ok(true) => suc += 1,
                Ok(false) => self.scheduler.feedback(host, key, -10.0),
                Err(e) if e.is_wait_for_retry() => {}
                Err(_) => self.scheduler.feedback(host, key, -10.0),
            }
            if suc >= w {
                if i + 1 < n {
                    self.queue_tail(hosts[i + 1..n].iter().map(|h| TailJob::Set {
                        host: Arc::clone(h),
                        key: key.to_string(),
                        item: item.clone(),
                        no_reply,
                    }));
                }
                break;
            }
        }

        self.finish_write(suc >= w)
    }

    pub async fn append(&self, key: &str, value: Bytes) -> Result<bool, ClientError> {
        if self.read_only {
            self.metrics.access_denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(ClientError::AccessDenied);
        }
        let hosts = self.scheduler.get_hosts_by_key(key);
        let n = self.quorum.n.min(hosts.len());
        let w = self.quorum.w;
        let mut suc = 0usize;

        for (i, host) in hosts.iter().take(n.max(1)).enumerate() {
            match host.append(key, value.clone()).await {
                Ok(true) => suc += 1,
                Ok(false) => self.scheduler.feedback(host, key, -5.0),
                Err(e) if e.is_wait_for_retry() => {}
                Err(_) => self.scheduler.feedback(host, key, -5.0),
            }
            if suc >= w {
                if i + 1 < n {
                    self.queue_tail(hosts[i + 1..n].iter().map(|h| TailJob::Append {
                        host: Arc::clone(h),
                        key: key.to_string(),
                        value: value.clone(),
                    }));
                }
                break;
            }
        }

        self.finish_write(suc >= w)
    }

    fn finish_write(&self, ok: bool) -> Result<bool, ClientError> {
        if ok {
            self.metrics.writes_quorum_met.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(true)
        } else {
            self.metrics.writes_quorum_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(ClientError::WriteFailed)
        }
    }

    /// Returns the maximum counter value across all replicas that
    /// successfully applied the increment. Non-idempotent under retry by
    /// design — see SPEC_FULL.md §9.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, ClientError> {
        if self.read_only {
            self.metrics.access_denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(ClientError::AccessDenied);
        }
        let hosts = self.scheduler.get_hosts_by_key(key);
        let n = self.quorum.n.min(hosts.len());
        let w = self.quorum.w;
        let mut suc = 0usize;
        let mut max_value: Option<i64> = None;

        for (i, host) in hosts.iter().take(n.max(1)).enumerate() {
            match host.incr(key, delta).await {
                Ok(v) => {
                    suc += 1;
                    max_value = Some(max_value.map_or(v, |m| m.max(v)));
                }
                Err(e) if e.is_wait_for_retry() => {}
                Err(_) => {
                    self.scheduler.feedback(host, key, -5.0);
                }
            }
            if suc >= w {
                if i + 1 < n {
                    self.queue_tail(hosts[i + 1..n].iter().map(|h| TailJob::Incr {
                        host: Arc::clone(h),
                        key: key.to_string(),
                        delta,
                    }));
                }
                break;
            }
        }

        if suc >= w {
            max_value.ok_or(ClientError::WriteFailed)
        } else {
            Err(ClientError::WriteFailed)
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool, ClientError> {
        if self.read_only {
            self.metrics.access_denied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(ClientError::AccessDenied);
        }
        let hosts = self.scheduler.get_hosts_by_key(key);
        let n = self.quorum.n.min(hosts.len());
        let mut suc = 0usize;
        let mut err_count = 0usize;

        for host in hosts.iter().take(n.max(1)) {
            match host.delete(key).await {
                Ok(true) => suc += 1,
                Ok(false) => {}
                Err(e) if e.is_wait_for_retry() => {
                    err_count += 1;
                }
                Err(_) => {
                    self.scheduler.feedback(host, key, -10.0);
                    err_count += 1;
                }
            }
            if suc >= n {
                break;
            }
        }

        let ok = suc > 0 && err_count < 2;
        if ok {
            Ok(true)
        } else {
            Err(ClientError::WriteFailed)
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Runs one `GetMulti` group (all keys that hashed to the same bucket)
/// against its ordered host list, issuing `get_multi` per host and
/// narrowing the remaining-keys set after each call.
async fn run_get_multi_group(
    scheduler: Arc<dyn Scheduler>,
    hosts: Vec<Arc<crate::host::Host>>,
    keys: Vec<String>,
    n: usize,
    r: usize,
) -> (HashMap<String, Item>, Vec<String>, Option<HostError>) {
    let mut remaining: Vec<String> = keys;
    let mut found = HashMap::new();
    let mut tried = Vec::with_capacity(n);
    let mut suc = 0usize;
    let mut last_err = None;

    for (i, host) in hosts.iter().take(n.max(1)).enumerate() {
        if remaining.is_empty() {
            break;
        }
        tried.push(host.addr.clone());
        let start = Instant::now();
        match host.get_multi(&remaining).await {
            Ok(items) => {
                suc += 1;
                if let Some(k) = remaining.first() {
                    let t = start.elapsed().as_secs_f64();
                    scheduler.feedback(host, k, 1.0 - t.sqrt() * t);
                }
                remaining.retain(|k| !items.contains_key(k));
                found.extend(items);
            }
            Err(e) => {
                let adjust = if e.is_wait_for_retry() { -2.0 } else { -5.0 };
                if let Some(k) = remaining.first() {
                    scheduler.feedback(host, k, adjust);
                }
                last_err = Some(e);
            }
        }

        if remaining.is_empty() || (suc >= r && i + 1 >= n) {
            break;
        }
    }

    (found, tried, last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a;
    use crate::host::HostTimeouts;
    use crate::scheduler::ManualScheduler;

    fn quorum(n: usize, w: usize, r: usize) -> Quorum {
        Quorum { n, w, r }
    }

    fn test_scheduler(n_hosts: usize, n: usize) -> Arc<dyn Scheduler> {
        let entries: Vec<(String, Vec<String>)> =
            (0..n_hosts).map(|i| (format!("127.0.0.1:{}", 20000 + i), vec!["0".to_string()])).collect();
        ManualScheduler::new(entries, 1, n, fnv1a, HostTimeouts::default(), Arc::new(Metrics::new())).unwrap()
    }

    #[tokio::test]
    async fn read_only_client_denies_mutations_without_contacting_hosts() {
        let scheduler = test_scheduler(2, 1);
        let metrics = Arc::new(Metrics::new());
        let client = Client::read_only(scheduler, quorum(1, 1, 1), metrics);

        let item = Item { body: Bytes::from_static(b"v"), flags: 0, exptime: 0, cas: 0 };
        assert!(matches!(client.set("k", item, false).await, Err(ClientError::AccessDenied)));
        assert!(matches!(client.delete("k").await, Err(ClientError::AccessDenied)));
        assert!(matches!(client.incr("k", 1).await, Err(ClientError::AccessDenied)));
        assert!(matches!(client.append("k", Bytes::from_static(b"x")).await, Err(ClientError::AccessDenied)));
    }

    #[tokio::test]
    async fn get_against_unreachable_hosts_reports_quorum_not_met_without_panicking() {
        // Hosts at these addresses have nothing listening — every attempt
        // should error, and since none produce hit-or-miss the call must
        // fail cleanly rather than hang or panic.
        let scheduler = test_scheduler(2, 2);
        let metrics = Arc::new(Metrics::new());
        let client = Client::new(scheduler, quorum(2, 2, 1), false, false, metrics);
        let res = client.get("somekey").await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn delete_forgives_a_single_isolated_failure() {
        // With only unreachable hosts, delete should still surface
        // WriteFailed rather than panicking on the quorum math.
        let scheduler = test_scheduler(1, 1);
        let metrics = Arc::new(Metrics::new());
        let client = Client::new(scheduler, quorum(1, 1, 1), false, false, metrics);
        let res = client.delete("k").await;
        assert!(res.is_err());
    }

    #[test]
    fn async_tail_replication_spawns_a_worker_only_when_enabled() {
        let scheduler = test_scheduler(1, 1);
        let metrics = Arc::new(Metrics::new());
        let on = Client::new(Arc::clone(&scheduler), quorum(1, 1, 1), false, true, Arc::clone(&metrics));
        assert!(on.tail_tx.is_some());
        let off = Client::new(scheduler, quorum(1, 1, 1), false, false, metrics);
        assert!(off.tail_tx.is_none());
    }

    #[tokio::test]
    async fn queue_tail_counts_drops_when_channel_has_no_receiver_capacity() {
        let scheduler = test_scheduler(1, 1);
        let metrics = Arc::new(Metrics::new());
        let client = Client::new(scheduler, quorum(1, 1, 1), false, true, Arc::clone(&metrics));
        // Fill the channel past capacity with jobs targeting a host nobody
        // is listening on; the worker will fail each dial but that's fine —
        // we're only asserting the bookkeeping around channel pressure.
        let host = client.scheduler.get_hosts_by_key("k").remove(0);
        for _ in 0..(TAIL_CHANNEL_CAPACITY + 8) {
            client.queue_tail(std::iter::once(TailJob::Incr {
                host: Arc::clone(&host),
                key: "k".into(),
                delta: 1,
            }));
        }
        assert!(metrics.async_tail_dropped.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }
}
