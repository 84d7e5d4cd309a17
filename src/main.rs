mod admin;
mod client;
mod config;
mod connection;
mod hash;
mod host;
mod log;
mod metrics;
mod protocol;
mod proxy;
mod scheduler;

use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
  ╔══════════════════════════════════════════════════╗
  ║               C A C H E Q U O R U M                ║
  ║   Adaptive N/W/R Quorum Routing for Memcache        ║
  ║                    [ Rust ]                         ║
  ╚══════════════════════════════════════════════════╝
"#;

#[tokio::main]
async fn main() {
    let config = config::Config::load();

    // Set up tracing with the configured log level
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    eprintln!("{BANNER}");

    if let Err(e) = config.validate() {
        eprintln!("fatal: invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = proxy::run(config).await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
