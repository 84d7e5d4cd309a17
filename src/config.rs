//! Configuration — CLI flags, environment variables, YAML config file.
//!
//! Layered the same way the teacher's `config.rs` is: defaults → config
//! file → environment variables → CLI flags (highest priority), ending in
//! a `validate()` step before the proxy binds its listener. The file format
//! itself is swapped from the teacher's hand-rolled `key = value` parser to
//! `serde_yaml`, since this domain's external-interface spec names YAML
//! explicitly (`Servers`, `Port`, `WebPort`, `N`, `W`, `R`, `Buckets`, …).

use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Which `Scheduler` variant to construct from `servers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Manual,
    Auto,
    Mod,
    ConsistentHash,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerKind::Manual => "manual",
            SchedulerKind::Auto => "auto",
            SchedulerKind::Mod => "mod",
            SchedulerKind::ConsistentHash => "consistent_hash",
        };
        write!(f, "{s}")
    }
}

fn parse_scheduler_kind(value: &str) -> SchedulerKind {
    match value.trim().to_lowercase().as_str() {
        "auto" => SchedulerKind::Auto,
        "mod" => SchedulerKind::Mod,
        "consistent_hash" | "consistenthash" | "ketama" => SchedulerKind::ConsistentHash,
        _ => SchedulerKind::Manual,
    }
}

/// Cachequorum — adaptive N/W/R quorum routing proxy for memcache-compatible caches.
#[derive(Parser, Debug)]
#[command(name = "cachequorum", version, about)]
pub struct Cli {
    /// YAML config file path
    #[arg(long, default_value = "cachequorum.yaml")]
    pub conf: String,

    /// Base directory for relative paths (logs, etc.)
    #[arg(long)]
    pub basepath: Option<String>,

    /// GOMAXPROCS-style worker thread hint; 0 lets the runtime decide
    #[arg(long)]
    pub alloc: Option<usize>,

    /// Listen port for client connections
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long)]
    pub listen: Option<String>,

    /// HTTP port for admin API (health, metrics, status)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Access log file path
    #[arg(long)]
    pub access_log: Option<String>,

    /// Error log file path
    #[arg(long)]
    pub error_log: Option<String>,

    /// Reject all mutating commands (Set/Append/Incr/Delete)
    #[arg(long)]
    pub readonly: bool,
}

/// Mirrors the YAML document shape described in SPEC_FULL.md §6. Every
/// field is optional so a config file only needs to name what it overrides.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct YamlConfig {
    servers: Option<Vec<String>>,
    port: Option<u16>,
    web_port: Option<u16>,
    threads: Option<usize>,
    n: Option<usize>,
    w: Option<usize>,
    r: Option<usize>,
    buckets: Option<u32>,
    slow_ms: Option<u64>,
    listen: Option<String>,
    hash: Option<String>,
    scheduler: Option<String>,
    access_log: Option<String>,
    error_log: Option<String>,
    basepath: Option<String>,
    readonly: Option<bool>,
    async_tail_replication: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub admin_port: Option<u16>,
    pub threads: usize,
    pub log_level: String,

    /// `(addr, bucket_tokens)` in file order — only meaningful for the
    /// Manual scheduler; other schedulers use just the addresses.
    pub servers: Vec<(String, Vec<String>)>,
    pub scheduler_kind: SchedulerKind,
    pub hash_name: String,
    pub num_buckets: u32,
    pub n: usize,
    pub w: usize,
    pub r: usize,
    pub slow_ms: u64,

    pub access_log: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub basepath: Option<String>,
    pub readonly: bool,
    pub async_tail_replication: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: 11311,
            admin_port: None,
            threads: 0,
            log_level: "info".into(),
            servers: Vec::new(),
            scheduler_kind: SchedulerKind::Manual,
            hash_name: "fnv1a".into(),
            num_buckets: 16,
            n: 1,
            w: 1,
            r: 1,
            slow_ms: 100,
            access_log: None,
            error_log: None,
            basepath: None,
            readonly: false,
            async_tail_replication: false,
        }
    }
}

impl Config {
    /// Load configuration: defaults → YAML file → environment → CLI flags.
    pub fn load() -> Self {
        let cli = Cli::parse();
        let mut config = Config::default();

        let conf_path = PathBuf::from(&cli.conf);
        if conf_path.exists() {
            match std::fs::read_to_string(&conf_path) {
                Ok(content) => {
                    if let Err(e) = apply_yaml(&mut config, &content) {
                        eprintln!("warning: failed to parse {}: {e}", cli.conf);
                    }
                }
                Err(e) => eprintln!("warning: could not read {}: {e}", cli.conf),
            }
        }

        apply_env(&mut config);

        if let Some(v) = cli.basepath {
            config.basepath = Some(v);
        }
        if let Some(v) = cli.alloc {
            config.threads = v;
        }
        if let Some(v) = cli.port {
            config.listen_port = v;
        }
        if let Some(v) = cli.listen {
            config.listen_host = v;
        }
        if let Some(v) = cli.admin_port {
            config.admin_port = Some(v);
        }
        if let Some(v) = cli.log_level {
            config.log_level = v;
        }
        if let Some(v) = cli.access_log {
            config.access_log = Some(resolve_path(&config.basepath, &v));
        }
        if let Some(v) = cli.error_log {
            config.error_log = Some(resolve_path(&config.basepath, &v));
        }
        if cli.readonly {
            config.readonly = true;
        }

        config
    }

    /// Validate configuration, returning an error message if invalid.
    /// Called before binding the listener; a failure here is a fatal
    /// startup error (process exits non-zero with the message on stderr).
    pub fn validate(&self) -> Result<(), String> {
        if self.servers.is_empty() {
            return Err("at least one server must be configured".into());
        }
        if !self.num_buckets.is_power_of_two() {
            return Err(format!("buckets ({}) must be a power of two", self.num_buckets));
        }
        if self.num_buckets > 65536 {
            return Err(format!("buckets ({}) must be <= 65536", self.num_buckets));
        }
        if self.r == 0 || self.r > self.w || self.w > self.n {
            return Err(format!(
                "quorum parameters must satisfy 0 < r <= w <= n (got r={}, w={}, n={})",
                self.r, self.w, self.n
            ));
        }
        if self.n > self.servers.len() {
            return Err(format!(
                "n ({}) cannot exceed the number of configured servers ({})",
                self.n,
                self.servers.len()
            ));
        }
        if crate::hash::by_name(&self.hash_name).is_none() {
            return Err(format!("unknown hash function: {}", self.hash_name));
        }
        Ok(())
    }
}

fn resolve_path(basepath: &Option<String>, path: &str) -> PathBuf {
    match basepath {
        Some(base) if !PathBuf::from(path).is_absolute() => PathBuf::from(base).join(path),
        _ => PathBuf::from(path),
    }
}

/// Parses a `Servers` entry of the form `"addr token token…"` into
/// `(addr, tokens)`. Unparseable or empty lines are skipped.
fn parse_server_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = line.split_whitespace();
    let addr = parts.next()?.to_string();
    let tokens: Vec<String> = parts.map(String::from).collect();
    Some((addr, tokens))
}

fn apply_yaml(config: &mut Config, content: &str) -> Result<(), serde_yaml::Error> {
    let yaml: YamlConfig = serde_yaml::from_str(content)?;

    if let Some(v) = yaml.basepath {
        config.basepath = Some(v);
    }
    if let Some(servers) = yaml.servers {
        config.servers = servers.iter().filter_map(|s| parse_server_line(s)).collect();
    }
    if let Some(v) = yaml.port {
        config.listen_port = v;
    }
    if let Some(v) = yaml.listen {
        config.listen_host = v;
    }
    if let Some(v) = yaml.web_port {
        config.admin_port = Some(v);
    }
    if let Some(v) = yaml.threads {
        config.threads = v;
    }
    if let Some(v) = yaml.n {
        config.n = v;
    }
    if let Some(v) = yaml.w {
        config.w = v;
    }
    if let Some(v) = yaml.r {
        config.r = v;
    }
    if let Some(v) = yaml.buckets {
        config.num_buckets = v;
    }
    if let Some(v) = yaml.slow_ms {
        config.slow_ms = v;
    }
    if let Some(v) = yaml.hash {
        config.hash_name = v;
    }
    if let Some(v) = yaml.scheduler {
        config.scheduler_kind = parse_scheduler_kind(&v);
    }
    if let Some(v) = yaml.access_log {
        config.access_log = Some(resolve_path(&config.basepath, &v));
    }
    if let Some(v) = yaml.error_log {
        config.error_log = Some(resolve_path(&config.basepath, &v));
    }
    if let Some(v) = yaml.readonly {
        config.readonly = v;
    }
    if let Some(v) = yaml.async_tail_replication {
        config.async_tail_replication = v;
    }

    Ok(())
}

fn apply_env(config: &mut Config) {
    if let Ok(v) = std::env::var("CACHEQUORUM_PORT")
        && let Ok(p) = v.parse()
    {
        config.listen_port = p;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_LISTEN") {
        config.listen_host = v;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_ADMIN_PORT")
        && let Ok(p) = v.parse()
    {
        config.admin_port = Some(p);
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_SERVERS") {
        config.servers = v.split(';').filter_map(parse_server_line).collect();
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_HASH") {
        config.hash_name = v;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_SCHEDULER") {
        config.scheduler_kind = parse_scheduler_kind(&v);
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_N")
        && let Ok(n) = v.parse()
    {
        config.n = n;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_W")
        && let Ok(n) = v.parse()
    {
        config.w = n;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_R")
        && let Ok(n) = v.parse()
    {
        config.r = n;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_BUCKETS")
        && let Ok(n) = v.parse()
    {
        config.num_buckets = n;
    }
    if let Ok(v) = std::env::var("CACHEQUORUM_READONLY") {
        config.readonly = matches!(v.as_str(), "true" | "1" | "yes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── YAML parsing ────────────────────────────────────────────────────

    #[test]
    fn parse_basic_yaml() {
        let mut config = Config::default();
        apply_yaml(
            &mut config,
            r#"
port: 11411
web_port: 8080
n: 2
w: 2
r: 1
buckets: 8
servers:
  - "host1:11211 0 1"
  - "host2:11211 2 3"
"#,
        )
        .unwrap();
        assert_eq!(config.listen_port, 11411);
        assert_eq!(config.admin_port, Some(8080));
        assert_eq!(config.n, 2);
        assert_eq!(config.num_buckets, 8);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].0, "host1:11211");
        assert_eq!(config.servers[0].1, vec!["0", "1"]);
    }

    #[test]
    fn parse_backup_tokens() {
        let mut config = Config::default();
        apply_yaml(
            &mut config,
            r#"
servers:
  - "main:11211 0 1"
  - "backup:11211 -0 -1"
"#,
        )
        .unwrap();
        assert_eq!(config.servers[1].1, vec!["-0", "-1"]);
    }

    #[test]
    fn scheduler_kind_parsing() {
        let mut config = Config::default();
        apply_yaml(&mut config, "scheduler: auto\n").unwrap();
        assert_eq!(config.scheduler_kind, SchedulerKind::Auto);

        apply_yaml(&mut config, "scheduler: mod\n").unwrap();
        assert_eq!(config.scheduler_kind, SchedulerKind::Mod);

        apply_yaml(&mut config, "scheduler: consistent_hash\n").unwrap();
        assert_eq!(config.scheduler_kind, SchedulerKind::ConsistentHash);

        apply_yaml(&mut config, "scheduler: manual\n").unwrap();
        assert_eq!(config.scheduler_kind, SchedulerKind::Manual);
    }

    #[test]
    fn readonly_and_async_tail_flags() {
        let mut config = Config::default();
        apply_yaml(&mut config, "readonly: true\nasync_tail_replication: true\n").unwrap();
        assert!(config.readonly);
        assert!(config.async_tail_replication);
    }

    #[test]
    fn invalid_yaml_is_reported_as_error() {
        let mut config = Config::default();
        let result = apply_yaml(&mut config, "servers: [this is not\n  valid yaml");
        assert!(result.is_err());
    }

    #[test]
    fn malformed_server_lines_are_skipped() {
        assert_eq!(parse_server_line("   "), None);
        assert_eq!(parse_server_line("host:11211 0 1"), Some(("host:11211".into(), vec!["0".into(), "1".into()])));
        assert_eq!(parse_server_line("host:11211"), Some(("host:11211".into(), vec![])));
    }

    // ─── basepath-relative log paths ─────────────────────────────────────

    #[test]
    fn relative_log_paths_join_basepath() {
        let mut config = Config::default();
        apply_yaml(&mut config, "basepath: /var/lib/cachequorum\naccess_log: logs/access.log\n").unwrap();
        assert_eq!(config.access_log, Some(PathBuf::from("/var/lib/cachequorum/logs/access.log")));
    }

    #[test]
    fn absolute_log_paths_ignore_basepath() {
        let mut config = Config::default();
        apply_yaml(&mut config, "basepath: /var/lib/cachequorum\naccess_log: /tmp/access.log\n").unwrap();
        assert_eq!(config.access_log, Some(PathBuf::from("/tmp/access.log")));
    }

    // ─── Env var overrides ───────────────────────────────────────────────

    #[test]
    fn env_var_overrides_port() {
        let mut config = Config::default();
        // SAFETY: test runs single-threaded (cargo test default), no concurrent env access
        unsafe { std::env::set_var("CACHEQUORUM_PORT", "9999") };
        apply_env(&mut config);
        assert_eq!(config.listen_port, 9999);
        unsafe { std::env::remove_var("CACHEQUORUM_PORT") };
    }

    #[test]
    fn env_var_servers_semicolon_separated() {
        let mut config = Config::default();
        // SAFETY: test runs single-threaded (cargo test default), no concurrent env access
        unsafe { std::env::set_var("CACHEQUORUM_SERVERS", "a:11211 0;b:11211 1") };
        apply_env(&mut config);
        assert_eq!(config.servers.len(), 2);
        unsafe { std::env::remove_var("CACHEQUORUM_SERVERS") };
    }

    // ─── Validation ──────────────────────────────────────────────────────

    fn configured(n: usize, w: usize, r: usize, buckets: u32, servers: usize) -> Config {
        let mut config = Config::default();
        config.n = n;
        config.w = w;
        config.r = r;
        config.num_buckets = buckets;
        config.servers = (0..servers).map(|i| (format!("h{i}:11211"), vec!["0".into()])).collect();
        config
    }

    #[test]
    fn validate_rejects_empty_servers() {
        let config = Config::default();
        assert!(config.validate().unwrap_err().contains("server"));
    }

    #[test]
    fn validate_rejects_non_power_of_two_buckets() {
        let config = configured(1, 1, 1, 10, 2);
        assert!(config.validate().unwrap_err().contains("power of two"));
    }

    #[test]
    fn validate_rejects_buckets_over_65536() {
        let config = configured(1, 1, 1, 131072, 2);
        assert!(config.validate().unwrap_err().contains("65536"));
    }

    #[test]
    fn validate_rejects_quorum_out_of_order() {
        let config = configured(2, 1, 2, 16, 3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_n_exceeding_server_count() {
        let config = configured(5, 1, 1, 16, 2);
        assert!(config.validate().unwrap_err().contains("exceed"));
    }

    #[test]
    fn validate_rejects_unknown_hash() {
        let mut config = configured(1, 1, 1, 16, 1);
        config.hash_name = "sha256".into();
        assert!(config.validate().unwrap_err().contains("hash"));
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        let config = configured(2, 2, 1, 16, 3);
        assert!(config.validate().is_ok());
    }
}
