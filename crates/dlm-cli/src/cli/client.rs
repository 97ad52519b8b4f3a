//! Interactive control-plane client: sends stdin lines verbatim, prints
//! responses, and renders `PROGRESS` frames as per-task bars.

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;

pub fn run(host: &str, port: u16) -> Result<()> {
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("failed to connect to {}:{}", host, port))?;
    println!("Connected to {}:{}", host, port);
    println!("Type 'help' for available commands, 'exit' to quit");

    let read_half = stream.try_clone().context("failed to clone connection")?;
    let bars = MultiProgress::new();
    let reader = thread::spawn(move || response_loop(read_half, bars));

    let mut write_half = stream;
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("exit") || command.eq_ignore_ascii_case("quit") {
            break;
        }
        if write_half
            .write_all(format!("{}\r\n", command).as_bytes())
            .is_err()
        {
            eprintln!("Failed to send command; connection lost");
            break;
        }
    }

    let _ = write_half.shutdown(Shutdown::Both);
    let _ = reader.join();
    println!("Disconnected");
    Ok(())
}

fn response_loop(stream: TcpStream, bars: MultiProgress) {
    let mut task_bars: HashMap<u64, ProgressBar> = HashMap::new();
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let Ok(line) = line else { break };
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some(frame) = line.strip_prefix("PROGRESS ") {
            if let Some((task_id, percent)) = parse_progress(frame) {
                update_bar(&bars, &mut task_bars, task_id, percent);
            }
        } else {
            let _ = bars.println(line);
        }
    }
}

/// Parses `<task_id>:<percent>%`.
fn parse_progress(frame: &str) -> Option<(u64, u64)> {
    let (task_id, percent) = frame.split_once(':')?;
    let task_id = task_id.trim().parse().ok()?;
    let percent = percent.trim().trim_end_matches('%').parse().ok()?;
    Some((task_id, percent))
}

fn update_bar(
    bars: &MultiProgress,
    task_bars: &mut HashMap<u64, ProgressBar>,
    task_id: u64,
    percent: u64,
) {
    let bar = task_bars.entry(task_id).or_insert_with(|| {
        let bar = bars.add(ProgressBar::new(100));
        bar.set_style(
            ProgressStyle::with_template("Task {prefix} [{bar:20}] {pos}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(task_id.to_string());
        bar
    });
    bar.set_position(percent.min(100));
    if percent >= 100 {
        bar.finish();
    }
}
