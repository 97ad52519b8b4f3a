//! Remote size probing for the chunked fetcher.
//!
//! HEAD first; if the server blocks HEAD or omits the length, fall back to a
//! `Range: bytes=0-0` GET and read the total out of `Content-Range`.

use anyhow::{bail, Context, Result};
use std::str;
use std::time::Duration;

/// Returns the resource's total size in bytes, or an error if neither probe
/// can determine it.
pub fn content_length(url: &str, timeout: Duration) -> Result<u64> {
    match probe_head(url, timeout) {
        Ok(Some(len)) => Ok(len),
        _ => probe_range0(url, timeout),
    }
}

fn collect_headers(headers: &mut Vec<String>, data: &[u8]) -> bool {
    if let Ok(s) = str::from_utf8(data) {
        let line = s.trim_end();
        // curl emits one block per hop when following redirects; keep only
        // the final response's headers
        if line.starts_with("HTTP/") {
            headers.clear();
        }
        headers.push(line.to_string());
    }
    true
}

fn header_value<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    headers.iter().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn probe_head(url: &str, timeout: Duration) -> Result<Option<u64>> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.nobody(true)?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(timeout)?;
    easy.timeout(timeout)?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| collect_headers(&mut headers, data))?;
        transfer.perform().context("HEAD request failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        bail!("HEAD {} returned HTTP {}", url, code);
    }

    Ok(header_value(&headers, "content-length").and_then(|v| v.parse().ok()))
}

fn probe_range0(url: &str, timeout: Duration) -> Result<u64> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(timeout)?;
    easy.timeout(timeout)?;
    easy.range("0-0")?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| collect_headers(&mut headers, data))?;
        transfer.write_function(|data| Ok(data.len()))?;
        transfer.perform().context("range probe failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if !(200..300).contains(&code) {
        bail!("range probe {} returned HTTP {}", url, code);
    }

    if code == 206 {
        // "bytes 0-0/12345" -> 12345; "*" means the server doesn't know
        if let Some(total) = header_value(&headers, "content-range")
            .and_then(|v| v.split_once('/'))
            .and_then(|(_, total)| total.trim().parse().ok())
        {
            return Ok(total);
        }
    } else if let Some(len) = header_value(&headers, "content-length").and_then(|v| v.parse().ok())
    {
        // server ignored the range and sent the whole thing
        return Ok(len);
    }

    bail!("could not determine content length for {}", url)
}
