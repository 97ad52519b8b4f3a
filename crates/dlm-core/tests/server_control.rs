//! End-to-end control-plane tests: a real server on an ephemeral port, a
//! plain TCP client speaking the line protocol, downloads served by the
//! local range server.

mod common;

use common::range_server;
use dlm_core::manager::DownloadManager;
use dlm_core::pool::WorkerPool;
use dlm_core::registry::TaskRegistry;
use dlm_core::server::ControlServer;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TestServer {
    server: Arc<ControlServer>,
    manager: Arc<DownloadManager>,
    _pool: Arc<WorkerPool>,
    addr: SocketAddr,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // stop the accept loop and abort leftover downloads so the pool's
        // shutdown join cannot hang on a busy worker
        self.server.stop();
        self.manager.cancel_all();
    }
}

fn start_server(threads: usize) -> TestServer {
    let pool = Arc::new(WorkerPool::new(threads));
    let registry = Arc::new(TaskRegistry::new(30));
    let manager = Arc::new(DownloadManager::new(registry, Arc::clone(&pool)));
    let server = Arc::new(
        ControlServer::bind(0, Arc::clone(&manager), Arc::clone(&pool)).expect("bind server"),
    );
    let port = server.local_addr().expect("local addr").port();
    Arc::clone(&server).start();
    TestServer {
        server,
        manager,
        _pool: pool,
        addr: SocketAddr::from(([127, 0, 0, 1], port)),
    }
}

struct Client {
    write: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Client {
            write: stream,
            reader,
        }
    }

    fn send(&mut self, command: &str) {
        self.write
            .write_all(format!("{}\r\n", command).as_bytes())
            .expect("send command");
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).expect("read line");
        assert!(n > 0, "connection closed by server");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Next non-PROGRESS line.
    fn response(&mut self) -> String {
        loop {
            let line = self.read_line();
            if !line.starts_with("PROGRESS ") {
                return line;
            }
        }
    }

    /// Reads until a `PROGRESS <id>:` frame arrives.
    fn wait_progress(&mut self, id: u64) -> String {
        let prefix = format!("PROGRESS {}:", id);
        loop {
            let line = self.read_line();
            if line.starts_with(&prefix) {
                return line;
            }
        }
    }

    /// Full STATUS block for `id` (or a single ERROR line).
    fn status(&mut self, id: u64) -> Vec<String> {
        self.send(&format!("STATUS {}", id));
        let first = self.response();
        if first.starts_with("ERROR") {
            return vec![first];
        }
        let mut lines = vec![first];
        for _ in 0..5 {
            lines.push(self.read_line());
        }
        if lines[2] == "Status: Failed" {
            lines.push(self.read_line());
        }
        lines
    }

    fn wait_status(&mut self, id: u64, want: &str, deadline: Duration) -> Vec<String> {
        let start = Instant::now();
        loop {
            let lines = self.status(id);
            if lines.len() > 2 && lines[2] == format!("Status: {}", want) {
                return lines;
            }
            assert!(
                start.elapsed() < deadline,
                "task {} never reached {}; last status: {:?}",
                id,
                want,
                lines
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn test_body(len: usize) -> Vec<u8> {
    (0u8..=255).cycle().take(len).collect()
}

#[test]
fn add_start_progress_complete() {
    let body = test_body(1024);
    let url = range_server::start_with_options(
        body.clone(),
        range_server::RangeServerOptions {
            chunk_size: 256,
            chunk_delay: Some(Duration::from_millis(10)),
            ..Default::default()
        },
    );
    let ts = start_server(8);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("a.bin");

    let mut client = Client::connect(ts.addr);
    client.send(&format!("ADD {} {}", url, out.display()));
    assert_eq!(client.response(), "OK 0");

    client.send("START 0");
    assert_eq!(client.response(), "OK Started task 0");

    let frame = client.wait_progress(0);
    assert!(frame.ends_with('%'), "malformed frame: {}", frame);

    let lines = client.wait_status(0, "Completed", Duration::from_secs(15));
    assert_eq!(lines[3], "Progress: 100.0%");
    assert_eq!(lines[4], "Downloaded: 1024 bytes");
    assert_eq!(lines[5], "Total size: 1024 bytes");
    assert_eq!(std::fs::read(&out).unwrap(), body);
}

#[test]
fn unknown_command_reports_error() {
    let ts = start_server(2);
    let mut client = Client::connect(ts.addr);
    client.send("FROB");
    assert_eq!(client.response(), "ERROR Unknown command: FROB");
}

#[test]
fn add_without_output_path_is_a_usage_error() {
    let ts = start_server(2);
    let mut client = Client::connect(ts.addr);
    client.send("ADD http://x/");
    assert_eq!(client.response(), "ERROR Usage: ADD <url> <output_path>");
}

#[test]
fn pause_resume_produces_identical_bytes() {
    let body = test_body(96 * 1024);
    let url = range_server::start_throttled(body.clone());
    let ts = start_server(8);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("b.bin");

    let mut client = Client::connect(ts.addr);
    client.send(&format!("ADD {} {}", url, out.display()));
    assert_eq!(client.response(), "OK 0");
    client.send("START 0");
    assert_eq!(client.response(), "OK Started task 0");

    client.wait_progress(0);
    client.send("PAUSE 0");
    assert_eq!(client.response(), "OK Paused task 0");
    client.wait_status(0, "Paused", Duration::from_secs(5));

    // the in-flight transfer aborts at its next tick; let the byte counter settle
    std::thread::sleep(Duration::from_millis(300));

    client.send("RESUME 0");
    assert_eq!(client.response(), "OK Resumed task 0");
    let lines = client.wait_status(0, "Completed", Duration::from_secs(30));
    assert_eq!(lines[4], format!("Downloaded: {} bytes", body.len()));
    assert_eq!(std::fs::read(&out).unwrap(), body);
}

#[test]
fn cancel_is_idempotent_over_the_wire() {
    let body = test_body(96 * 1024);
    let url = range_server::start_throttled(body);
    let ts = start_server(8);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("c.bin");

    let mut client = Client::connect(ts.addr);
    client.send(&format!("ADD {} {}", url, out.display()));
    assert_eq!(client.response(), "OK 0");
    client.send("START 0");
    assert_eq!(client.response(), "OK Started task 0");
    client.wait_progress(0);

    client.send("CANCEL 0");
    assert_eq!(client.response(), "OK Cancelled task 0");
    client.wait_status(0, "Cancelled", Duration::from_secs(5));

    client.send("CANCEL 0");
    assert_eq!(client.response(), "OK Cancelled task 0");
    client.wait_status(0, "Cancelled", Duration::from_secs(5));
}

#[test]
fn bulk_start_completes_every_task() {
    let bodies: Vec<Vec<u8>> = vec![test_body(4096), test_body(8192), test_body(12288)];
    let urls: Vec<String> = bodies.iter().map(|b| range_server::start(b.clone())).collect();
    let ts = start_server(8);
    let dir = tempfile::tempdir().unwrap();

    let mut client = Client::connect(ts.addr);
    let mut outs = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        let out = dir.path().join(format!("bulk-{}.bin", i));
        client.send(&format!("ADD {} {}", url, out.display()));
        assert_eq!(client.response(), format!("OK {}", i));
        outs.push(out);
    }

    client.send("START");
    assert_eq!(client.response(), "OK Started all tasks");

    for id in 0..3u64 {
        client.wait_status(id, "Completed", Duration::from_secs(15));
    }
    for (out, body) in outs.iter().zip(&bodies) {
        assert_eq!(&std::fs::read(out).unwrap(), body);
    }

    client.send("LIST");
    let first = client.response();
    assert_eq!(first, "OK 3 tasks:");
    for _ in 0..3 {
        let line = client.read_line();
        assert!(line.contains("[Completed]"), "unexpected line: {}", line);
    }
}

#[test]
fn list_is_empty_before_any_add() {
    let ts = start_server(2);
    let mut client = Client::connect(ts.addr);
    client.send("LIST");
    assert_eq!(client.response(), "OK 0 tasks:");
}

#[test]
fn status_of_unknown_task_is_an_error() {
    let ts = start_server(2);
    let mut client = Client::connect(ts.addr);
    client.send("STATUS 99");
    assert_eq!(client.response(), "ERROR Task not found: 99");
}

#[test]
fn threads_reports_pool_counters() {
    let ts = start_server(4);
    let mut client = Client::connect(ts.addr);
    client.send("THREADS");
    assert_eq!(client.response(), "OK Thread pool status:");
    let pending = client.read_line();
    assert!(pending.starts_with("- Pending tasks: "), "{}", pending);
    assert_eq!(client.read_line(), "- Active threads: 4");
}

#[test]
fn commands_are_case_insensitive_over_the_wire() {
    let ts = start_server(2);
    let mut client = Client::connect(ts.addr);
    client.send("add http://example.test/a /tmp/case-a.bin");
    assert_eq!(client.response(), "OK 0");
    client.send("LiSt");
    assert_eq!(client.response(), "OK 1 tasks:");
    client.read_line();
    client.send("hElP");
    assert_eq!(
        client.response(),
        "Available commands: HELP, ADD, START, PAUSE, RESUME, CANCEL, LIST, STATUS, THREADS"
    );
}

#[test]
fn pause_of_an_idle_task_fails() {
    let ts = start_server(2);
    let mut client = Client::connect(ts.addr);
    client.send("ADD http://example.test/a /tmp/idle-a.bin");
    assert_eq!(client.response(), "OK 0");
    client.send("PAUSE 0");
    assert_eq!(client.response(), "ERROR Failed to pause task 0");
    client.send("RESUME 99");
    assert_eq!(client.response(), "ERROR Failed to resume task 99");
}
