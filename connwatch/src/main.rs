mod config;
mod event;
mod loader;
mod poller;

use anyhow::Context as _;
use clap::Parser;
use log::info;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use config::{Config, OutputFormat, Overrides};
use loader::ConnectProbe;
use poller::Poller;

/// Stream outbound IPv4 connect() attempts (pid, process name, destination)
#[derive(Debug, Parser)]
#[command(version)]
struct Opt {
    /// TOML configuration file
    #[clap(short, long, env = "CONNWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Pages per CPU perf ring (power of two)
    #[clap(long, env = "CONNWATCH_PAGES")]
    pages: Option<usize>,

    /// Milliseconds to sleep between buffer polls
    #[clap(long, env = "CONNWATCH_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Output format for connect records
    #[clap(long, value_enum, env = "CONNWATCH_FORMAT")]
    format: Option<OutputFormat>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug")
    #[clap(long)]
    log_level: Option<String>,
}

impl Opt {
    fn overrides(&self) -> Overrides {
        Overrides {
            log_level: self.log_level.clone(),
            pages: self.pages,
            poll_interval_ms: self.poll_interval_ms,
            format: self.format,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let config = Config::resolve(opt.config.as_deref(), opt.overrides())
        .context("failed to load configuration")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    loader::preflight();
    loader::bump_memlock_rlimit();

    let mut probe = ConnectProbe::attach(aya::include_bytes_aligned!(concat!(
        env!("OUT_DIR"),
        "/connwatch"
    )))
    .context("failed to attach connect probe")?;

    let buffers = probe
        .open_buffers(config.transport.pages)
        .context("failed to open perf buffers")?;
    info!(
        "Watching IPv4 connect() on {} cpus ({} pages per ring)",
        buffers.len(),
        config.transport.pages
    );
    let mut poller = Poller::new(buffers);

    // Set up Ctrl+C / SIGTERM handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let format = config.consumer.format;
    let interval = Duration::from_millis(config.consumer.poll_interval_ms);
    let stdout = std::io::stdout();

    while running.load(Ordering::SeqCst) {
        let mut out = stdout.lock();
        poller.poll(|record| {
            if let Err(e) = writeln!(out, "{}", record.render(format)) {
                log::debug!("stdout write failed: {e}");
            }
        });
        drop(out);

        // Sleep briefly to avoid busy-waiting
        std::thread::sleep(interval);
    }

    let stats = poller.stats();
    info!(
        "Exiting: {} records received, {} lost, {} malformed",
        stats.received, stats.lost, stats.malformed
    );

    // Detaches the tracepoint and closes the map.
    drop(probe);
    Ok(())
}
