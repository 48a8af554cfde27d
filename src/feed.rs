//! Radio feed
//!
//! The radio transceiver is driven by an external helper process that prints
//! one line per received packet:
//!
//! ```text
//! RX: rssi=-71.50: 5100ee5823003201 2c4861
//! -71.5 51 00 ee 58 23 00 32 01 2c 48 61
//! ```
//!
//! The `RX` marker and the `rssi=` prefix are optional; hex bytes may be
//! separated by spaces or colons. Anything else on the helper's stdout is
//! treated as diagnostics.

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::frame::RawFrame;
use crate::pipeline::Pipeline;

/// Extract RSSI and frame bytes from a helper output line
///
/// Example input: `RX: rssi=-71.50: 5100ee58...`
/// Returns: `(-71.5, [0x51, 0x00, 0xee, 0x58, ...])`
pub fn parse_frame_line(line: &str) -> Option<(f64, Vec<u8>)> {
    let line = line.trim();
    let line = line
        .strip_prefix("RX")
        .map(|rest| rest.trim_start_matches(':').trim_start())
        .unwrap_or(line);

    let (rssi_token, rest) = line.split_once(char::is_whitespace)?;
    let rssi: f64 = rssi_token
        .trim_start_matches("rssi=")
        .trim_end_matches(':')
        .parse()
        .ok()?;
    if !rssi.is_finite() {
        return None;
    }

    let digits: String = rest
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.is_empty() {
        return None;
    }

    let bytes = hex::decode(&digits).ok()?;
    Some((rssi, bytes))
}

/// Feed every frame line from `reader` into the pipeline
///
/// Returns on EOF or once the pipeline stops accepting frames.
pub async fn run_feed<R>(mut reader: R, pipeline: Pipeline) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line_buf = String::new();
    let mut frames = 0u64;

    info!("Starting radio feed");

    loop {
        line_buf.clear();

        let read = reader
            .read_line(&mut line_buf)
            .await
            .context("Error reading from radio feed")?;
        if read == 0 {
            warn!(frames, "Radio feed ended (EOF)");
            break;
        }

        match parse_frame_line(&line_buf) {
            Some((rssi, bytes)) => {
                frames += 1;
                let frame = RawFrame::new(bytes, rssi, Utc::now());
                if !pipeline.receive_now(frame).await {
                    info!(frames, "Pipeline closed, stopping radio feed");
                    break;
                }
            }
            None => {
                debug!(line = %line_buf.trim_end(), "radio helper");
            }
        }
    }

    Ok(())
}

/// Log how the feed task ended and keep its error
///
/// EOF is not an error; an I/O failure or a panic is, and must end the
/// gateway with a non-zero exit once shutdown has finished.
pub fn feed_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            warn!("Radio feed ended");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "Radio feed failed");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "Radio feed task panicked");
            Err(anyhow::Error::new(e).context("Radio feed task panicked"))
        }
    }
}
