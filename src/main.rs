use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};

use webserv::config::{listen_map, load_config};
use webserv::mime::MimeMap;
use webserv::server::{LogSink, Server, ServerOptions};

const DEFAULT_CONFIG: &str = "configfile.conf";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

#[derive(Parser, Debug)]
#[command(version, about = "Serve static sites, uploads and CGI scripts")]
struct Cli {
    /// Configuration file with one or more `server` blocks
    #[arg(default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// File of `ext: mime/type` lines overriding the built-in table
    #[arg(long)]
    mimetypes: Option<PathBuf>,

    /// Append the access log to this file instead of stdout
    #[arg(long)]
    log: Option<PathBuf>,

    /// Seconds before an idle connection is closed
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Seconds a CGI script may run before it is killed
    #[arg(long, default_value_t = 10)]
    cgi_timeout: u64,

    /// Check the configuration, print a summary and exit
    #[arg(long, default_value_t = false)]
    test_config: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    tracing::info!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let configs = load_config(&cli.config)?;
    if cli.test_config {
        for group in listen_map(&configs) {
            let names: Vec<&str> = group
                .hosts
                .iter()
                .map(|&index| configs[index].server_name.as_str())
                .collect();
            println!("{} -> [{}]", group.addr(), names.join(", "));
        }
        println!("configuration file {} test is successful", cli.config.display());
        return Ok(());
    }

    let mut mime_map = MimeMap::default();
    if let Some(path) = &cli.mimetypes {
        mime_map.parse_extension_map_file(path)?;
    }

    let log_sink = match &cli.log {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            LogSink::File(BufWriter::new(file))
        }
        None => LogSink::Stdout,
    };

    let options = ServerOptions {
        idle_timeout: Duration::from_secs(cli.timeout),
        cgi_timeout: Duration::from_secs(cli.cgi_timeout),
    };
    let mut server = Server::new(configs, mime_map, options, log_sink)?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    // main loop
    while is_running() {
        server.poll()?;
    }

    tracing::info!("shutting down");
    server.shutdown()
}
