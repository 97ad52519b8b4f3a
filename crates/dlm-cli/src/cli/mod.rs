use anyhow::Result;
use clap::{Parser, Subcommand};
use dlm_core::config;
use dlm_core::manager::DownloadManager;
use dlm_core::parallel;
use dlm_core::pool::WorkerPool;
use dlm_core::registry::TaskRegistry;
use dlm_core::server::ControlServer;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

mod client;

/// Top-level CLI for the dlm download manager.
#[derive(Debug, Parser)]
#[command(name = "dlm")]
#[command(about = "dlm: multi-task HTTP download manager with a TCP control plane", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the download server: TCP control plane plus worker pool.
    Serve {
        /// Control port to listen on (default from config, then 10280).
        #[arg(long)]
        port: Option<u16>,

        /// Worker pool size (default from config, then 8).
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Connect to a running server and issue commands interactively.
    Client {
        /// Server address.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port (default from config, then 10280).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Download one URL with parallel ranged chunks, without a server.
    Fetch {
        /// Direct HTTP/HTTPS URL to download.
        url: String,

        /// Output file path.
        output: String,

        /// Number of concurrent chunks.
        #[arg(long, default_value_t = 4)]
        chunks: usize,
    },
}

impl CliCommand {
    pub fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Serve { port, threads } => serve(
                port.unwrap_or(cfg.port),
                threads.unwrap_or(cfg.worker_threads),
                cfg.timeout_secs,
            ),
            CliCommand::Client { host, port } => client::run(&host, port.unwrap_or(cfg.port)),
            CliCommand::Fetch {
                url,
                output,
                chunks,
            } => {
                let pool = WorkerPool::new(chunks.max(1));
                let written = parallel::fetch_parallel(
                    &url,
                    Path::new(&output),
                    chunks,
                    Duration::from_secs(cfg.timeout_secs),
                    &pool,
                )?;
                println!("Downloaded {} bytes to {}", written, output);
                Ok(())
            }
        }
    }
}

fn serve(port: u16, threads: usize, timeout_secs: u64) -> Result<()> {
    let pool = Arc::new(WorkerPool::new(threads));
    let registry = Arc::new(TaskRegistry::new(timeout_secs));
    let manager = Arc::new(DownloadManager::new(registry, Arc::clone(&pool)));

    let server = Arc::new(ControlServer::bind(port, manager, Arc::clone(&pool))?);
    let accept_thread = Arc::clone(&server).start();

    println!("Server started on port {} with {} worker threads", port, threads);
    println!("Press Enter to stop the server...");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    server.stop();
    let _ = accept_thread.join();
    pool.shutdown();
    Ok(())
}
