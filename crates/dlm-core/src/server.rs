//! TCP control server: accept loop, per-connection request loop, and the
//! progress frames streamed back to the connection that issued ADD.
//!
//! Each accepted connection becomes one unit of work on the worker pool. All
//! writes to a connection (responses and `PROGRESS` frames alike) go
//! through one shared sender whose mutex makes every frame an atomic
//! `line\r\n` write. Progress callbacks hold only a `Weak` reference to that
//! sender: a task outlives the connection that created it, and after the
//! connection closes its callbacks degrade to no-ops.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::manager::DownloadManager;
use crate::pool::WorkerPool;
use crate::protocol::{self, Command};

/// How long a connection read blocks before re-checking the running flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared write half of one client connection. `alive` is cleared when the
/// connection winds down so late progress ticks stop sending.
struct ConnectionSender {
    stream: Mutex<TcpStream>,
    alive: AtomicBool,
}

impl ConnectionSender {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            alive: AtomicBool::new(true),
        }
    }

    /// Sends `message` with every line CRLF-terminated, as one write under
    /// the send mutex so concurrent frames never interleave mid-line.
    fn send(&self, message: &str) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let mut buf = String::with_capacity(message.len() + 2);
        for line in message.split('\n') {
            buf.push_str(line.trim_end_matches('\r'));
            buf.push_str("\r\n");
        }
        let mut stream = self.stream.lock().unwrap();
        if let Err(e) = stream.write_all(buf.as_bytes()) {
            tracing::debug!("client write failed: {}", e);
            self.alive.store(false, Ordering::Release);
        }
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

pub struct ControlServer {
    listener: TcpListener,
    manager: Arc<DownloadManager>,
    pool: Arc<WorkerPool>,
    running: Arc<AtomicBool>,
}

impl ControlServer {
    /// Binds the listener. Port 0 picks an ephemeral port (used by tests).
    pub fn bind(port: u16, manager: Arc<DownloadManager>, pool: Arc<WorkerPool>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("failed to bind control port {}", port))?;
        Ok(Self {
            listener,
            manager,
            pool,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawns the accept loop on its own thread and returns its handle.
    pub fn start(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || self.accept_loop())
    }

    /// Stops the accept loop. Open connections drain on their own once they
    /// observe the flag at their next read poll.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping control server");
        // wake the blocking accept with one throwaway connection
        if let Ok(addr) = self.listener.local_addr() {
            let wake = SocketAddr::from(([127, 0, 0, 1], addr.port()));
            let _ = TcpStream::connect_timeout(&wake, Duration::from_secs(1));
        }
    }

    fn accept_loop(&self) {
        match self.local_addr() {
            Ok(addr) => tracing::info!("control server listening on {}", addr),
            Err(_) => tracing::info!("control server listening"),
        }
        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let manager = Arc::clone(&self.manager);
                    let pool = Arc::clone(&self.pool);
                    let running = Arc::clone(&self.running);
                    self.pool
                        .enqueue(move || handle_connection(stream, manager, pool, running));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            }
        }
        tracing::info!("control server stopped");
    }
}

fn handle_connection(
    stream: TcpStream,
    manager: Arc<DownloadManager>,
    pool: Arc<WorkerPool>,
    running: Arc<AtomicBool>,
) {
    tracing::info!("client connected");

    // short read timeouts let the loop re-check the running flag
    if let Err(e) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
        tracing::warn!("failed to set read timeout: {}", e);
        return;
    }
    let read_half = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to clone client stream: {}", e);
            return;
        }
    };

    let sender = Arc::new(ConnectionSender::new(stream));
    let mut reader = BufReader::with_capacity(1024, read_half);
    let mut line = String::new();

    while running.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let command = line.trim_end_matches(['\r', '\n']);
                tracing::debug!("received command: '{}'", command);
                let response = dispatch(command, &manager, &pool, &sender);
                sender.send(&response);
                line.clear();
            }
            // timeout with a partial line: keep what was read, poll again
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::debug!("client read failed: {}", e);
                break;
            }
        }
    }

    // unsubscribe before the socket drops so in-flight tasks tick into a no-op
    sender.close();
    tracing::info!("client disconnected");
}

fn dispatch(
    line: &str,
    manager: &Arc<DownloadManager>,
    pool: &Arc<WorkerPool>,
    sender: &Arc<ConnectionSender>,
) -> String {
    let command = match protocol::parse(line) {
        Ok(command) => command,
        Err(e) => return format!("ERROR {}", e),
    };

    match command {
        Command::Help => {
            "Available commands: HELP, ADD, START, PAUSE, RESUME, CANCEL, LIST, STATUS, THREADS"
                .to_string()
        }
        Command::Add { url, output_path } => {
            let id = manager.add_task(&url, &output_path);
            if let Some(task) = manager.registry().get(id) {
                task.set_progress_callback(progress_reporter(id, Arc::downgrade(sender)));
            }
            format!("OK {}", id)
        }
        Command::Start { task_id } => match task_id {
            Some(id) => {
                if manager.start_task(id) {
                    format!("OK Started task {}", id)
                } else {
                    format!("ERROR Failed to start task {}", id)
                }
            }
            None => {
                manager.start_all();
                "OK Started all tasks".to_string()
            }
        },
        Command::Pause { task_id } => match task_id {
            Some(id) => {
                if manager.pause_task(id) {
                    format!("OK Paused task {}", id)
                } else {
                    format!("ERROR Failed to pause task {}", id)
                }
            }
            None => {
                manager.pause_all();
                "OK Paused all tasks".to_string()
            }
        },
        Command::Resume { task_id } => match task_id {
            Some(id) => {
                if manager.resume_task(id) {
                    format!("OK Resumed task {}", id)
                } else {
                    format!("ERROR Failed to resume task {}", id)
                }
            }
            None => {
                manager.resume_all();
                "OK Resumed all tasks".to_string()
            }
        },
        Command::Cancel { task_id } => match task_id {
            Some(id) => {
                if manager.cancel_task(id) {
                    format!("OK Cancelled task {}", id)
                } else {
                    format!("ERROR Failed to cancel task {}", id)
                }
            }
            None => {
                manager.cancel_all();
                "OK Cancelled all tasks".to_string()
            }
        },
        Command::List => {
            let registry = manager.registry();
            let mut ids = registry.ids();
            ids.sort_unstable();
            // render first so the count prefix always matches the line count
            let lines: Vec<String> = ids
                .into_iter()
                .filter_map(|id| {
                    registry.get(id).map(|task| {
                        format!(
                            "{}: {} => {} [{}] {}/{} bytes",
                            id,
                            task.url(),
                            task.output_path().display(),
                            task.status(),
                            task.downloaded_size(),
                            task.total_size()
                        )
                    })
                })
                .collect();
            let mut response = format!("OK {} tasks:", lines.len());
            for line in lines {
                response.push('\n');
                response.push_str(&line);
            }
            response
        }
        Command::Status { task_id } => match manager.registry().get(task_id) {
            None => format!("ERROR Task not found: {}", task_id),
            Some(task) => {
                let mut response = format!(
                    "OK URL: {}\nOutput: {}\nStatus: {}\nProgress: {:.1}%\nDownloaded: {} bytes\nTotal size: {} bytes",
                    task.url(),
                    task.output_path().display(),
                    task.status(),
                    task.progress(),
                    task.downloaded_size(),
                    task.total_size()
                );
                let error = task.error_message();
                if !error.is_empty() {
                    response.push_str("\nError: ");
                    response.push_str(&error);
                }
                response
            }
        },
        Command::Threads => format!(
            "OK Thread pool status:\n- Pending tasks: {}\n- Active threads: {}",
            pool.pending(),
            pool.active_threads()
        ),
    }
}

/// Progress callback for one task, bound to the subscribing connection. The
/// sender is held weakly; once the connection is gone the tick does nothing.
fn progress_reporter(
    task_id: u64,
    subscriber: Weak<ConnectionSender>,
) -> crate::task::ProgressCallback {
    Box::new(move |downloaded, total| {
        if total == 0 {
            return;
        }
        let Some(sender) = subscriber.upgrade() else {
            return;
        };
        let percent = downloaded * 100 / total;
        sender.send(&format!("PROGRESS {}:{}%", task_id, percent));
    })
}
