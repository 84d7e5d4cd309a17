//! Scheduler — the routing table mapping buckets to ordered replica lists,
//! and the feedback-driven reordering that keeps healthy/fast hosts first.
//!
//! Grounded on `original_source/src/memcache/schedule.go` in full: the
//! hex-token bucket assignment in `NewManualScheduler`, the one-step bubble
//! reorder in `feedback()`, the periodic `try_reward()` nudge to the 2nd/3rd
//! replica, `AutoScheduler`'s directory-probe discovery and its distinct
//! averaging score-update rule, `ModScheduler`'s pure hash-modulo routing,
//! and `ConsistantHashScheduler`'s virtual-node ring search.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hash::{self, HashFn};
use crate::host::{Host, HostRegistry, HostTimeouts};
use crate::log::LogRegistry;
use crate::metrics::Metrics;

/// Feedback rescale threshold: when a score crosses this magnitude, every
/// score in that bucket is halved before the reorder is applied. Matches
/// the original's `if stats[i] > 100 { divide by 2 }`.
const RESCALE_THRESHOLD: f64 = 100.0;
const FEEDBACK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct Feedback {
    pub host_offset: u32,
    pub bucket_index: u32,
    pub adjust: f64,
    /// `false`: reorder is bounded by the main/backup boundary (normal
    /// request feedback). `true`: reorder may cross the whole list
    /// (recovery-probe feedback).
    pub in_check: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidToken(String),
    BucketOutOfRange(u32, u32),
    NoHosts,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidToken(t) => write!(f, "invalid bucket token: {t}"),
            ConfigError::BucketOutOfRange(b, max) => write!(f, "bucket {b} out of range (max {max})"),
            ConfigError::NoHosts => write!(f, "scheduler configured with no hosts"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Shared routing behavior every scheduler variant implements.
pub trait Scheduler: Send + Sync {
    /// Ordered list of Hosts to try for `key`: main replicas first, then
    /// (Manual only) backups.
    fn get_hosts_by_key(&self, key: &str) -> Vec<Arc<Host>>;

    /// Groups keys by the bucket they hash to, for `GetMulti` fan-out.
    fn divide_keys_by_bucket<'a>(&self, keys: &[&'a str]) -> HashMap<u32, Vec<&'a str>>;

    /// Non-blocking feedback. Dropped silently (and counted) if the
    /// scheduler has no feedback mechanism or its channel is full.
    fn feedback(&self, host: &Host, key: &str, adjust: f64);

    /// addr -> per-bucket score vector, for the admin status endpoint.
    fn stats(&self) -> HashMap<String, Vec<f64>>;

    fn hosts(&self) -> &HostRegistry;
}

fn bucket_token(token: &str) -> Result<(u32, bool), ConfigError> {
    let (is_backup, hex) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let idx = u32::from_str_radix(hex, 16).map_err(|_| ConfigError::InvalidToken(token.to_string()))?;
    Ok((idx, is_backup))
}

struct BucketState {
    /// Hot read path: cloned cheaply by every `get_hosts_by_key` call,
    /// swapped wholesale by the single feedback-serializer task.
    replicas: RwLock<Arc<Vec<u32>>>,
    /// Mutated only by the serializer task; guarded for the rare `stats()`
    /// read from the admin API.
    scores: Mutex<Vec<f64>>,
}

// ─── ManualScheduler ───────────────────────────────────────────────────────

/// Operator-assigned static bucket->replica mapping with adaptive reordering
/// of the main portion, plus a recovery loop that repromotes revived mains.
pub struct ManualScheduler {
    hosts: HostRegistry,
    n: usize,
    bucket_width: u32,
    hash_fn: HashFn,
    buckets: Vec<BucketState>,
    main_nodes: Vec<Vec<u32>>,
    feedback_tx: mpsc::Sender<Feedback>,
    metrics: Arc<Metrics>,
}

impl ManualScheduler {
    /// `entries` is `(addr, bucket_tokens)` in configuration order — order
    /// matters, since it determines each host's stable offset and, via the
    /// prepend-on-assignment rule below, the initial main-replica ordering.
    pub fn new(
        entries: Vec<(String, Vec<String>)>,
        num_buckets: u32,
        n: usize,
        hash_fn: HashFn,
        timeouts: HostTimeouts,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        let bucket_width = hash::bit_width(num_buckets);
        let mut hosts = Vec::with_capacity(entries.len());
        let mut main: Vec<Vec<u32>> = vec![Vec::new(); num_buckets as usize];
        let mut backup: Vec<Vec<u32>> = vec![Vec::new(); num_buckets as usize];

        for (offset, (addr, tokens)) in entries.into_iter().enumerate() {
            let offset = offset as u32;
            hosts.push(Arc::new(Host::new(addr, offset, timeouts, Arc::clone(&metrics))));
            for token in tokens {
                let (bucket_idx, is_backup) = bucket_token(&token)?;
                if bucket_idx >= num_buckets {
                    return Err(ConfigError::BucketOutOfRange(bucket_idx, num_buckets));
                }
                if is_backup {
                    backup[bucket_idx as usize].push(offset);
                } else {
                    // Later-configured hosts become earlier in the main
                    // portion — deliberate, matches the original's
                    // prepend-on-assignment ordering.
                    main[bucket_idx as usize].insert(0, offset);
                }
            }
        }

        let num_hosts = hosts.len();
        let mut buckets = Vec::with_capacity(num_buckets as usize);
        let mut main_nodes = Vec::with_capacity(num_buckets as usize);
        for b in 0..num_buckets as usize {
            let mut replicas = main[b].clone();
            replicas.extend(backup[b].iter().copied());
            let top_n: Vec<u32> = replicas.iter().take(n).copied().collect();

            let mut scores = vec![0.0f64; num_hosts];
            for &offset in &top_n {
                scores[offset as usize] = 10.0;
            }

            main_nodes.push(top_n);
            buckets.push(BucketState {
                replicas: RwLock::new(Arc::new(replicas)),
                scores: Mutex::new(scores),
            });
        }

        let (tx, rx) = mpsc::channel(FEEDBACK_CHANNEL_CAPACITY);
        let scheduler = Arc::new(Self {
            hosts: HostRegistry::new(hosts),
            n,
            bucket_width,
            hash_fn,
            buckets,
            main_nodes,
            feedback_tx: tx,
            metrics,
        });
        scheduler.clone().spawn_feedback_serializer(rx);
        Ok(scheduler)
    }

    fn spawn_feedback_serializer(self: Arc<Self>, mut rx: mpsc::Receiver<Feedback>) {
        tokio::spawn(async move {
            while let Some(fb) = rx.recv().await {
                self.apply_feedback(fb);
            }
        });
    }

    fn apply_feedback(&self, fb: Feedback) {
        let Some(bucket) = self.buckets.get(fb.bucket_index as usize) else { return };
        let host_idx = fb.host_offset as usize;

        let increased = {
            let mut scores = bucket.scores.lock().unwrap();
            if host_idx >= scores.len() {
                return;
            }
            scores[host_idx] += fb.adjust;
            if scores[host_idx] > RESCALE_THRESHOLD {
                for s in scores.iter_mut() {
                    *s /= 2.0;
                }
            }
            fb.adjust > 0.0
        };

        let mut replicas: Vec<u32> = (**bucket.replicas.read().unwrap()).clone();
        let Some(mut k) = replicas.iter().position(|&h| h == fb.host_offset) else { return };

        let n = self.n.min(replicas.len());
        let (lower, upper) = if fb.in_check {
            (0, replicas.len())
        } else if k < n {
            (0, n)
        } else {
            (n, replicas.len())
        };

        let scores = bucket.scores.lock().unwrap();
        if increased {
            while k > lower && scores[replicas[k] as usize] > scores[replicas[k - 1] as usize] {
                replicas.swap(k, k - 1);
                k -= 1;
            }
        } else {
            while k + 1 < upper && scores[replicas[k] as usize] < scores[replicas[k + 1] as usize] {
                replicas.swap(k, k + 1);
                k += 1;
            }
        }
        drop(scores);

        *bucket.replicas.write().unwrap() = Arc::new(replicas);
    }

    /// Background task: every 5s, reward the 2nd/3rd replica of each bucket
    /// a little (keeping them warm), or probe and repromote a downed main.
    /// Matches the original's `try_reward` loop, extended with the
    /// down-host detection / repromotion described for the recovery loop
    /// (see DESIGN.md — the original's retrieved `try_reward` has no such
    /// detection; this generalizes it per the routing spec).
    pub fn spawn_recovery_loop(self: &Arc<Self>, log: Arc<LogRegistry>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                scheduler.recovery_tick(&log).await;
            }
        });
    }

    async fn recovery_tick(&self, log: &LogRegistry) {
        for (b, bucket) in self.buckets.iter().enumerate() {
            let replicas = bucket.replicas.read().unwrap().clone();
            let n = self.n.min(replicas.len());
            let current_main: std::collections::HashSet<u32> = replicas[..n].iter().copied().collect();
            let down: Vec<u32> =
                self.main_nodes[b].iter().copied().filter(|h| !current_main.contains(h)).collect();

            if down.is_empty() {
                self.reward_second_and_third(b, &replicas);
                continue;
            }

            for host_offset in down {
                let Some(host) = self.hosts.get(host_offset) else { continue };
                match host.get("@").await {
                    Ok(_) => {
                        log.error(&format!("recovery: {} responded, repromoting bucket {b}", host.addr))
                            .await;
                        self.metrics.recovery_repromotions.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        let _ = self
                            .feedback_tx
                            .try_send(Feedback { host_offset, bucket_index: b as u32, adjust: 30.0, in_check: true });
                        for &promoted in &current_main {
                            if !self.main_nodes[b].contains(&promoted) {
                                let _ = self.feedback_tx.try_send(Feedback {
                                    host_offset: promoted,
                                    bucket_index: b as u32,
                                    adjust: -30.0,
                                    in_check: true,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        debug!(addr = %host.addr, bucket = b, error = %e, "recovery: probe still failing");
                    }
                }
            }
        }
    }

    fn reward_second_and_third(&self, bucket_index: usize, replicas: &[u32]) {
        let mut rng = rand::thread_rng();
        for (slot, max_reward) in [(1usize, 10i64), (2usize, 16i64)] {
            let Some(&host_offset) = replicas.get(slot) else { continue };
            let bucket = &self.buckets[bucket_index];
            let current = bucket.scores.lock().unwrap()[host_offset as usize];
            let reward = if current < 0.0 { -current } else { rng.gen_range(0..max_reward) as f64 };
            let _ = self.feedback_tx.try_send(Feedback {
                host_offset,
                bucket_index: bucket_index as u32,
                adjust: reward,
                in_check: false,
            });
        }
    }
}

impl Scheduler for ManualScheduler {
    fn get_hosts_by_key(&self, key: &str) -> Vec<Arc<Host>> {
        let b = hash::bucket_of(self.hash_fn, self.bucket_width, key.as_bytes());
        let Some(bucket) = self.buckets.get(b as usize) else { return Vec::new() };
        bucket
            .replicas
            .read()
            .unwrap()
            .iter()
            .filter_map(|&offset| self.hosts.get(offset).cloned())
            .collect()
    }

    fn divide_keys_by_bucket<'a>(&self, keys: &[&'a str]) -> HashMap<u32, Vec<&'a str>> {
        hash::divide_keys_by_bucket(self.hash_fn, self.bucket_width, keys)
    }

    fn feedback(&self, host: &Host, key: &str, adjust: f64) {
        let bucket_index = hash::bucket_of(self.hash_fn, self.bucket_width, key.as_bytes());
        if self
            .feedback_tx
            .try_send(Feedback { host_offset: host.offset, bucket_index, adjust, in_check: false })
            .is_err()
        {
            self.metrics.feedback_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn stats(&self) -> HashMap<String, Vec<f64>> {
        let mut out: HashMap<String, Vec<f64>> = HashMap::new();
        for host in self.hosts.iter() {
            let mut per_bucket = Vec::with_capacity(self.buckets.len());
            for bucket in &self.buckets {
                per_bucket.push(bucket.scores.lock().unwrap()[host.offset as usize]);
            }
            out.insert(host.addr.clone(), per_bucket);
        }
        out
    }

    fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }
}

// ─── AutoScheduler ─────────────────────────────────────────────────────────

/// Every host is eligible for every bucket; discovery comes from directory
/// listings against each host rather than static config. Deliberately uses
/// a different score-update rule from `ManualScheduler` (averaging on a
/// non-negative adjustment, additive on negative) — see
/// `original_source/src/memcache/schedule.go`'s two distinct `feedback()`
/// bodies.
pub struct AutoScheduler {
    hosts: HostRegistry,
    bucket_width: u32,
    hash_fn: HashFn,
    buckets: Vec<BucketState>,
    feedback_tx: mpsc::Sender<Feedback>,
    metrics: Arc<Metrics>,
}

impl AutoScheduler {
    pub fn new(
        addrs: Vec<String>,
        num_buckets: u32,
        hash_fn: HashFn,
        timeouts: HostTimeouts,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, ConfigError> {
        if addrs.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        let bucket_width = hash::bit_width(num_buckets);
        let hosts: Vec<Arc<Host>> = addrs
            .into_iter()
            .enumerate()
            .map(|(i, addr)| Arc::new(Host::new(addr, i as u32, timeouts, Arc::clone(&metrics))))
            .collect();
        let all_offsets: Vec<u32> = (0..hosts.len() as u32).collect();
        let num_hosts = hosts.len();

        let buckets = (0..num_buckets as usize)
            .map(|_| BucketState {
                replicas: RwLock::new(Arc::new(all_offsets.clone())),
                scores: Mutex::new(vec![0.0; num_hosts]),
            })
            .collect();

        let (tx, rx) = mpsc::channel(FEEDBACK_CHANNEL_CAPACITY);
        let scheduler =
            Arc::new(Self { hosts: HostRegistry::new(hosts), bucket_width, hash_fn, buckets, feedback_tx: tx, metrics });
        scheduler.clone().spawn_feedback_serializer(rx);
        Ok(scheduler)
    }

    fn spawn_feedback_serializer(self: Arc<Self>, mut rx: mpsc::Receiver<Feedback>) {
        tokio::spawn(async move {
            while let Some(fb) = rx.recv().await {
                self.apply_feedback(fb);
            }
        });
    }

    fn apply_feedback(&self, fb: Feedback) {
        let Some(bucket) = self.buckets.get(fb.bucket_index as usize) else { return };
        let host_idx = fb.host_offset as usize;
        let increased = {
            let mut scores = bucket.scores.lock().unwrap();
            if host_idx >= scores.len() {
                return;
            }
            if fb.adjust >= 0.0 {
                scores[host_idx] = (scores[host_idx] + fb.adjust) / 2.0;
            } else {
                scores[host_idx] += fb.adjust;
            }
            fb.adjust >= 0.0
        };

        let mut replicas: Vec<u32> = (**bucket.replicas.read().unwrap()).clone();
        let Some(mut k) = replicas.iter().position(|&h| h == fb.host_offset) else { return };
        let scores = bucket.scores.lock().unwrap();
        if increased {
            while k > 0 && scores[replicas[k] as usize] > scores[replicas[k - 1] as usize] {
                replicas.swap(k, k - 1);
                k -= 1;
            }
        } else {
            while k + 1 < replicas.len() && scores[replicas[k] as usize] < scores[replicas[k + 1] as usize] {
                replicas.swap(k, k + 1);
                k += 1;
            }
        }
        drop(scores);
        *bucket.replicas.write().unwrap() = Arc::new(replicas);
    }

    /// Every 10s, probe each host for the bucket directories it holds and
    /// feed back `sqrt(count)` so hosts with more data gain weight.
    pub fn spawn_directory_check_loop(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                scheduler.directory_check_tick().await;
            }
        });
    }

    async fn directory_check_tick(&self) {
        for host in self.hosts.iter() {
            for probe_key in directory_probe_keys(self.bucket_width) {
                match host.get(&probe_key).await {
                    Ok(Some(item)) => {
                        let body = String::from_utf8_lossy(&item.body);
                        for line in body.lines() {
                            let mut parts = line.split_whitespace();
                            let (Some(path), Some(count_str)) = (parts.next(), parts.next()) else { continue };
                            let Ok(count) = count_str.parse::<f64>() else { continue };
                            let Some(bucket_index) = parse_directory_bucket(path, self.bucket_width) else {
                                continue;
                            };
                            let _ = self.feedback_tx.try_send(Feedback {
                                host_offset: host.offset,
                                bucket_index,
                                adjust: count.sqrt(),
                                in_check: false,
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(addr = %host.addr, probe = %probe_key, error = %e, "auto scheduler: directory probe failed");
                    }
                }
            }
        }
    }
}

/// The set of `@HHHH` directory-listing keys to probe each host with: one
/// hex digit shallower than the full bucket path (covering every top-level
/// subdirectory), or a bare `@` root listing when the bucket space isn't
/// wide enough to have a level above the leaves.
fn directory_probe_keys(bucket_width: u32) -> Vec<String> {
    if bucket_width < 8 {
        return vec!["@".to_string()];
    }
    let w = ((bucket_width - 4) / 4) as usize;
    let count = 1u32 << (bucket_width - 4);
    (0..count).map(|i| format!("@{i:0w$x}")).collect()
}

fn parse_directory_bucket(path: &str, bucket_width: u32) -> Option<u32> {
    let hex_len = (bucket_width / 4) as usize;
    u32::from_str_radix(path.get(..hex_len)?, 16).ok()
}

impl Scheduler for AutoScheduler {
    fn get_hosts_by_key(&self, key: &str) -> Vec<Arc<Host>> {
        let b = hash::bucket_of(self.hash_fn, self.bucket_width, key.as_bytes());
        let Some(bucket) = self.buckets.get(b as usize) else { return Vec::new() };
        bucket.replicas.read().unwrap().iter().filter_map(|&offset| self.hosts.get(offset).cloned()).collect()
    }

    fn divide_keys_by_bucket<'a>(&self, keys: &[&'a str]) -> HashMap<u32, Vec<&'a str>> {
        hash::divide_keys_by_bucket(self.hash_fn, self.bucket_width, keys)
    }

    fn feedback(&self, host: &Host, key: &str, adjust: f64) {
        let bucket_index = hash::bucket_of(self.hash_fn, self.bucket_width, key.as_bytes());
        if self
            .feedback_tx
            .try_send(Feedback { host_offset: host.offset, bucket_index, adjust, in_check: false })
            .is_err()
        {
            self.metrics.feedback_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn stats(&self) -> HashMap<String, Vec<f64>> {
        let mut out = HashMap::new();
        for host in self.hosts.iter() {
            let per_bucket = self.buckets.iter().map(|b| b.scores.lock().unwrap()[host.offset as usize]).collect();
            out.insert(host.addr.clone(), per_bucket);
        }
        out
    }

    fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }
}

// ─── ModScheduler ──────────────────────────────────────────────────────────

/// Deterministic hash-modulo routing. No feedback, no recovery.
pub struct ModScheduler {
    hosts: HostRegistry,
    hash_fn: HashFn,
}

impl ModScheduler {
    pub fn new(addrs: Vec<String>, hash_fn: HashFn, timeouts: HostTimeouts, metrics: Arc<Metrics>) -> Arc<Self> {
        let hosts: Vec<Arc<Host>> = addrs
            .into_iter()
            .enumerate()
            .map(|(i, addr)| Arc::new(Host::new(addr, i as u32, timeouts, Arc::clone(&metrics))))
            .collect();
        Arc::new(Self { hosts: HostRegistry::new(hosts), hash_fn })
    }

    fn host_for(&self, key: &[u8]) -> u32 {
        let n = self.hosts.len() as u32;
        (self.hash_fn)(key) % n
    }
}

impl Scheduler for ModScheduler {
    fn get_hosts_by_key(&self, key: &str) -> Vec<Arc<Host>> {
        let offset = self.host_for(key.as_bytes());
        self.hosts.get(offset).cloned().into_iter().collect()
    }

    fn divide_keys_by_bucket<'a>(&self, keys: &[&'a str]) -> HashMap<u32, Vec<&'a str>> {
        let mut groups: HashMap<u32, Vec<&'a str>> = HashMap::new();
        for &k in keys {
            groups.entry(self.host_for(k.as_bytes())).or_default().push(k);
        }
        groups
    }

    fn feedback(&self, _host: &Host, _key: &str, _adjust: f64) {}

    fn stats(&self) -> HashMap<String, Vec<f64>> {
        HashMap::new()
    }

    fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }
}

// ─── ConsistentHashScheduler ───────────────────────────────────────────────

const VIRTUAL_NODES: u32 = 100;

/// Virtual-node consistent-hash ring. No feedback, no recovery.
pub struct ConsistentHashScheduler {
    hosts: HostRegistry,
    hash_fn: HashFn,
    /// Sorted `(hash << 32) | host_index` points, matching the original's
    /// packed-u64 ring representation.
    ring: Vec<u64>,
}

impl ConsistentHashScheduler {
    pub fn new(addrs: Vec<String>, hash_fn: HashFn, timeouts: HostTimeouts, metrics: Arc<Metrics>) -> Arc<Self> {
        let hosts: Vec<Arc<Host>> = addrs
            .into_iter()
            .enumerate()
            .map(|(i, addr)| Arc::new(Host::new(addr, i as u32, timeouts, Arc::clone(&metrics))))
            .collect();

        let mut ring = Vec::with_capacity(hosts.len() * VIRTUAL_NODES as usize);
        for (i, host) in hosts.iter().enumerate() {
            for v in 0..VIRTUAL_NODES {
                let vkey = format!("{}-{}", host.addr, v);
                let h = hash_fn(vkey.as_bytes()) as u64;
                ring.push((h << 32) | i as u64);
            }
        }
        ring.sort_unstable();

        Arc::new(Self { hosts: HostRegistry::new(hosts), hash_fn, ring })
    }

    fn host_index_for(&self, key: &[u8]) -> u32 {
        let h = (self.hash_fn)(key) as u64;
        let target = h << 32;
        let pos = self.ring.partition_point(|&point| point < target);
        let point = if pos < self.ring.len() { self.ring[pos] } else { self.ring[0] };
        (point & 0xFFFF_FFFF) as u32
    }
}

impl Scheduler for ConsistentHashScheduler {
    fn get_hosts_by_key(&self, key: &str) -> Vec<Arc<Host>> {
        let offset = self.host_index_for(key.as_bytes());
        self.hosts.get(offset).cloned().into_iter().collect()
    }

    fn divide_keys_by_bucket<'a>(&self, keys: &[&'a str]) -> HashMap<u32, Vec<&'a str>> {
        let mut groups: HashMap<u32, Vec<&'a str>> = HashMap::new();
        for &k in keys {
            groups.entry(self.host_index_for(k.as_bytes())).or_default().push(k);
        }
        groups
    }

    fn feedback(&self, _host: &Host, _key: &str, _adjust: f64) {}

    fn stats(&self) -> HashMap<String, Vec<f64>> {
        HashMap::new()
    }

    fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fnv1a;

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    fn entries(n: usize) -> Vec<(String, Vec<String>)> {
        (0..n).map(|i| (format!("host{i}:11211"), vec!["0".to_string()])).collect()
    }

    #[test]
    fn directory_probe_keys_covers_every_top_level_subdirectory() {
        // 65536 buckets -> 4 hex digits per full path, probe one digit
        // shallower so every one-digit-prefix subtree is listed.
        let keys = directory_probe_keys(16);
        assert_eq!(keys.len(), 4096);
        assert!(keys.contains(&"@000".to_string()));
        assert!(keys.contains(&"@fff".to_string()));
    }

    #[test]
    fn directory_probe_keys_falls_back_to_bare_at_for_shallow_bucket_spaces() {
        assert_eq!(directory_probe_keys(4), vec!["@".to_string()]);
        assert_eq!(directory_probe_keys(7), vec!["@".to_string()]);
        assert_ne!(directory_probe_keys(8), vec!["@".to_string()]);
    }

    #[tokio::test]
    async fn manual_scheduler_replicas_are_a_permutation_of_assigned_hosts() {
        let sched = ManualScheduler::new(entries(4), 1, 3, fnv1a, HostTimeouts::default(), test_metrics()).unwrap();
        let hosts = sched.get_hosts_by_key("anykey");
        let mut offsets: Vec<u32> = hosts.iter().map(|h| h.offset).collect();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn manual_scheduler_respects_backup_marker() {
        let entries = vec![
            ("main:11211".to_string(), vec!["0".to_string()]),
            ("backup:11211".to_string(), vec!["-0".to_string()]),
        ];
        let sched = ManualScheduler::new(entries, 1, 1, fnv1a, HostTimeouts::default(), test_metrics()).unwrap();
        let hosts = sched.get_hosts_by_key("k");
        assert_eq!(hosts[0].addr, "main:11211");
        assert_eq!(hosts[1].addr, "backup:11211");
    }

    #[tokio::test]
    async fn manual_scheduler_feedback_reorders_within_main_boundary() {
        let sched = ManualScheduler::new(entries(3), 1, 3, fnv1a, HostTimeouts::default(), test_metrics()).unwrap();
        let before = sched.get_hosts_by_key("k");
        let last = before.last().unwrap().clone();

        sched.feedback(&last, "k", 50.0);
        // Allow the feedback serializer task to process the message.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let after = sched.get_hosts_by_key("k");
        let offsets: std::collections::HashSet<u32> = after.iter().map(|h| h.offset).collect();
        assert_eq!(offsets.len(), 3, "reorder must not drop or duplicate hosts");
    }

    #[test]
    fn mod_scheduler_is_deterministic() {
        let sched = ModScheduler::new(
            vec!["a:11211".into(), "b:11211".into(), "c:11211".into()],
            fnv1a,
            HostTimeouts::default(),
            test_metrics(),
        );
        let first = sched.get_hosts_by_key("stable-key")[0].addr.clone();
        let second = sched.get_hosts_by_key("stable-key")[0].addr.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn consistent_hash_scheduler_is_deterministic_and_covers_all_hosts() {
        let sched = ConsistentHashScheduler::new(
            vec!["a:11211".into(), "b:11211".into(), "c:11211".into()],
            fnv1a,
            HostTimeouts::default(),
            test_metrics(),
        );
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let key = format!("key-{i}");
            seen.insert(sched.get_hosts_by_key(&key)[0].addr.clone());
        }
        assert_eq!(seen.len(), 3, "enough keys should spread across every host on the ring");
    }

    /// Binds a listener that answers every request with `END\r\n` (a Get
    /// miss), just enough for `Host::get("@")`'s probe to succeed.
    async fn spawn_stub_host() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 256];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {
                                if sock.write_all(b"END\r\n").await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn recovery_tick_repromotes_a_main_host_once_it_answers_again() {
        let main_addr = spawn_stub_host().await;
        let backup_addr = spawn_stub_host().await;
        let entries = vec![(main_addr, vec!["0".to_string()]), (backup_addr, vec!["-0".to_string()])];
        let metrics = test_metrics();
        let sched =
            ManualScheduler::new(entries, 1, 1, fnv1a, HostTimeouts::default(), Arc::clone(&metrics)).unwrap();

        // Demote the main host below the backup without touching main_nodes,
        // simulating "main is down, backup took over" purely at the
        // score-vector level.
        let backup = sched.hosts.get(1).unwrap().clone();
        sched.apply_feedback(Feedback { host_offset: backup.offset, bucket_index: 0, adjust: 50.0, in_check: true });
        let replicas = sched.buckets[0].replicas.read().unwrap().clone();
        assert_eq!(replicas[0], 1, "backup should now occupy the main slot");

        let log = Arc::new(LogRegistry::open(None, None).await.unwrap());
        sched.recovery_tick(&log).await;
        assert_eq!(metrics.recovery_repromotions.load(std::sync::atomic::Ordering::Relaxed), 1);

        // The repromotion feedback is only queued by recovery_tick; give the
        // serializer task a moment to apply it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let replicas = sched.buckets[0].replicas.read().unwrap().clone();
        assert_eq!(replicas[0], 0, "original main should be repromoted after a successful probe");
    }
}
