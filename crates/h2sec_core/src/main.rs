use anyhow::Context;
use clap::Parser;
use h2sec_core::engine::EngineCore;
use h2sec_core::security_group;
use h2sec_harness::{CheckContext, Config};
use h2sec_net::TcpDialer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;

/// Open files wanted for slow-read, which may dial many connections.
const NOFILE_LIMIT: u64 = 65_536;

#[derive(Parser)]
#[command(name = "h2sec", version, about = "Security checks for HTTP/2 servers")]
struct Cli {
    /// Check ids to run, e.g. sec/2 or sec/2/1. Runs everything when omitted.
    targets: Vec<String>,

    /// JSON configuration file; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    path: Option<String>,

    /// Connect over TLS (ALPN h2).
    #[arg(short, long)]
    tls: bool,

    /// Do not verify the server certificate.
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Read timeout in milliseconds.
    #[arg(short = 'o', long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    requests: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    max_header_len: Option<usize>,

    #[arg(long)]
    slow_read_step: Option<u32>,

    #[arg(long)]
    slow_read_interval_ms: Option<u64>,

    /// Print the selected checks without running them.
    #[arg(long)]
    dry_run: bool,

    /// Also write the report as JSON.
    #[arg(short, long)]
    json_report: Option<PathBuf>,

    /// Log to stderr instead of the log directory.
    #[arg(short, long)]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: Level,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if self.port.is_some() {
            config.port = self.port;
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        config.tls |= self.tls;
        config.insecure |= self.insecure;
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.requests {
            config.requests = v;
        }
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = self.max_header_len {
            config.max_header_len = v;
        }
        if let Some(v) = self.slow_read_step {
            config.slow_read_step = v;
        }
        if let Some(v) = self.slow_read_interval_ms {
            config.slow_read_interval_ms = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(cli.log_level)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }
    // stdout is kept for the report
    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "h2sec.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_ansi(false)
        .with_writer(non_blocking)
        .init();
    Some(guard)
}

async fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = cli.config()?;

    match rlimit::increase_nofile_limit(NOFILE_LIMIT) {
        Ok(limit) => info!(limit, "open file limit"),
        Err(err) => warn!(error = %err, "could not raise open file limit"),
    }

    let dialer = TcpDialer::new(config.target())?;
    let ctx = CheckContext::new(Arc::new(config), Arc::new(dialer));
    let engine = EngineCore::new(security_group(), ctx);

    if cli.dry_run {
        print!("{}", engine.outline(&cli.targets));
        return Ok(true);
    }

    let report = engine.run(&cli.targets).await;
    print!("{}", report.render());

    if let Some(path) = &cli.json_report {
        let json = report.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    Ok(report.is_success())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let guard = init_logging(&cli);

    info!("Booting h2sec...");
    let success = run(&cli).await?;
    info!(success, "Shutdown complete.");

    // flush the log file before exiting
    drop(guard);
    if !success {
        std::process::exit(1);
    }
    Ok(())
}
