use clap::Parser;
use session_pool::config::Config;
use session_pool::pool::{ConnectionPool, Destination, Request, TcpTransport};
use session_pool::{PoolError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "session-pool")]
#[command(about = "Probe a destination through a keyed, session-affine connection pool", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Destination to probe
    #[arg(long, value_name = "HOST:PORT")]
    target: Option<String>,

    /// Number of concurrent requests
    #[arg(long, default_value_t = 4)]
    requests: usize,

    /// Cookie header to send; repeat to spread requests over several sessions
    #[arg(long)]
    cookie: Vec<String>,

    /// How long each request holds its connection (milliseconds)
    #[arg(long, default_value_t = 50)]
    hold_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = &args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(config_path)?;
        println!("Example configuration file created successfully!");
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format)?;

    info!("session-pool v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    let target = args
        .target
        .as_deref()
        .ok_or_else(|| PoolError::Config("--target is required".to_string()))?;
    let destination = parse_target(target)?;

    let pool = ConnectionPool::new(
        config.pool.to_pool_config(),
        TcpTransport::new(config.transport.default_port),
    );

    tokio::select! {
        result = run_probe(&pool, destination, &args) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping probe");
        }
    }

    let stats = serde_json::to_string_pretty(&pool.stats()).map_err(std::io::Error::from)?;
    println!("{}", stats);

    pool.destroy();
    info!("Pool destroyed");

    Ok(())
}

async fn run_probe(
    pool: &ConnectionPool<TcpTransport>,
    destination: Destination,
    args: &Args,
) -> Result<()> {
    let hold = Duration::from_millis(args.hold_ms);
    let mut tasks = Vec::with_capacity(args.requests);

    for index in 0..args.requests {
        let mut request = Request::new(destination.clone());
        if !args.cookie.is_empty() {
            let cookie = &args.cookie[index % args.cookie.len()];
            request = request.with_header("cookie", cookie.clone());
        }

        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let lease = pool.acquire(&request).await?;
            info!(
                "Request #{} got connection #{} to {} via {}",
                index,
                lease.id(),
                lease.peer_addr(),
                lease.key()
            );
            tokio::time::sleep(hold).await;
            lease.release();
            Ok::<_, PoolError>(())
        }));
    }

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Request failed: {}", e),
            Err(e) => error!("Request task panicked: {}", e),
        }
    }

    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 literals and a bare host.
fn parse_target(target: &str) -> Result<Destination> {
    let invalid = || PoolError::Config(format!("Invalid target: {}", target));

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        (host, tail.strip_prefix(':'))
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (target, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let mut destination = Destination {
        host: Some(host.to_string()),
        ..Default::default()
    };
    if let Some(port) = port {
        destination.port = Some(port.parse().map_err(|_| invalid())?);
    }
    Ok(destination)
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| PoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
