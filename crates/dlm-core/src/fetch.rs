//! Single blocking HTTP GET with optional Range, streaming into a caller-supplied sink.
//!
//! The fetcher owns no state across calls: each call creates its own curl
//! handle and releases it on return. Cancellation is cooperative (the sink
//! signals abort by returning a short count, the progress hook by returning
//! `false`) and surfaces as [`FetchError::Aborted`], distinguishable from
//! transport and HTTP failures.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Error from a single fetch (transport failure, HTTP status, abort, or sink I/O).
/// Typed so callers can classify: an abort is a requested stop, not a failure.
#[derive(Debug)]
pub enum FetchError {
    /// Curl reported an error (timeout, connection, DNS, TLS, etc.).
    Curl(curl::Error),
    /// Response status was neither 200 nor 206.
    Http(u32),
    /// The sink returned a short count or the progress hook refused to continue.
    Aborted,
    /// The sink failed with an I/O error (e.g. disk full).
    Io(io::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Curl(e) => write!(f, "{}", e),
            FetchError::Http(code) => write!(f, "HTTP error: {}", code),
            FetchError::Aborted => write!(f, "transfer aborted"),
            FetchError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Curl(e) => Some(e),
            FetchError::Io(e) => Some(e),
            FetchError::Http(_) | FetchError::Aborted => None,
        }
    }
}

/// Performs one GET, streaming the body into `sink` and reporting body-level
/// progress `(total, received)` through `progress`.
///
/// A `Range: bytes=start-[end]` header is sent when `range_start > 0` or
/// `range_end > 0`; `range_end` is an inclusive offset, `0` meaning "to end of
/// resource". Redirects are followed (up to 10). `timeout` bounds both the
/// connect phase and read inactivity, so a dead peer cannot stall the caller
/// indefinitely.
///
/// The sink returns the number of bytes it consumed; anything less than the
/// offered slice aborts the transfer. The progress hook returns `true` to
/// continue, `false` to abort.
pub fn fetch<S, P>(
    url: &str,
    range_start: u64,
    range_end: u64,
    timeout: Duration,
    mut sink: S,
    mut progress: P,
) -> Result<(), FetchError>
where
    S: FnMut(&[u8]) -> io::Result<usize>,
    P: FnMut(u64, u64) -> bool,
{
    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(FetchError::Curl)?;
    easy.follow_location(true).map_err(FetchError::Curl)?;
    easy.max_redirections(10).map_err(FetchError::Curl)?;
    easy.useragent(concat!("dlm/", env!("CARGO_PKG_VERSION")))
        .map_err(FetchError::Curl)?;
    easy.connect_timeout(timeout).map_err(FetchError::Curl)?;
    // Read timeout as a low-speed cutoff: abort when throughput stays under
    // 1 KiB/s for the timeout window. A hard wall-clock timeout would kill
    // large downloads on slow links.
    easy.low_speed_limit(1024).map_err(FetchError::Curl)?;
    easy.low_speed_time(timeout).map_err(FetchError::Curl)?;

    if range_start > 0 || range_end > 0 {
        let range = if range_end > 0 {
            format!("{}-{}", range_start, range_end)
        } else {
            format!("{}-", range_start)
        };
        easy.range(&range).map_err(FetchError::Curl)?;
    }

    easy.progress(true).map_err(FetchError::Curl)?;

    // The sink's io::Error cannot cross the curl callback boundary directly;
    // stash it and report a short write so curl stops the transfer.
    let sink_error: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));
    let sink_error_cb = Arc::clone(&sink_error);

    {
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| match sink(data) {
                Ok(n) => Ok(n),
                Err(e) => {
                    let _ = sink_error_cb.lock().unwrap().replace(e);
                    Ok(0)
                }
            })
            .map_err(FetchError::Curl)?;
        transfer
            .progress_function(move |dltotal, dlnow, _ultotal, _ulnow| {
                progress(dltotal as u64, dlnow as u64)
            })
            .map_err(FetchError::Curl)?;

        if let Err(e) = transfer.perform() {
            if e.is_write_error() || e.is_aborted_by_callback() {
                if let Some(io_err) = sink_error.lock().unwrap().take() {
                    return Err(FetchError::Io(io_err));
                }
                return Err(FetchError::Aborted);
            }
            return Err(FetchError::Curl(e));
        }
    }

    let code = easy.response_code().map_err(FetchError::Curl)?;
    if code != 200 && code != 206 {
        return Err(FetchError::Http(code));
    }

    Ok(())
}
