//! Raw stream-to-stream body pump.
//!
//! # Responsibilities
//! - Move bytes from a reader to a writer with pooled buffers
//! - Rearm the activity timeout on every successful read and write
//! - Classify failures by the side that failed
//! - Emit throttled progress events and one final accounting event
//!
//! # Design Decisions
//! - A buffer that came back full from a read is retained for the next
//!   iteration (another read is likely ready); otherwise it returns to
//!   the pool between iterations
//! - Flush after every write: upgraded connections are interactive

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::copy::activity::ActivityTimeoutToken;
use crate::copy::pool::{global_pool, PooledBuffer};
use crate::telemetry::{ContentTransfer, TelemetryListener};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal outcome of one body pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCopyResult {
    /// The source reached EOF and every byte was written out.
    Success,
    /// The read side failed.
    InputError,
    /// The write side failed.
    OutputError,
    /// The linked cancellation fired (externally or by inactivity).
    Canceled,
}

/// One direction of a body copy between two streams.
pub struct StreamCopier {
    telemetry: std::sync::Arc<dyn TelemetryListener>,
    is_request: bool,
}

impl StreamCopier {
    /// `is_request` marks the client → destination direction for
    /// telemetry purposes.
    pub fn new(telemetry: std::sync::Arc<dyn TelemetryListener>, is_request: bool) -> Self {
        Self {
            telemetry,
            is_request,
        }
    }

    /// Pump `reader` into `writer` until EOF, failure, or cancellation.
    /// The activity token is rearmed after every successful read and
    /// every successful write.
    pub async fn copy<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        activity: &ActivityTimeoutToken,
    ) -> (StreamCopyResult, Option<io::Error>)
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut transfer = ContentTransfer {
            is_request: self.is_request,
            ..Default::default()
        };
        let started = Instant::now();
        let mut last_progress = started;

        let (result, error) = self
            .run(reader, writer, activity, started, &mut transfer, &mut last_progress)
            .await;

        self.telemetry.on_content_transferred(&transfer);
        (result, error)
    }

    async fn run<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        activity: &ActivityTimeoutToken,
        started: Instant,
        transfer: &mut ContentTransfer,
        last_progress: &mut Instant,
    ) -> (StreamCopyResult, Option<io::Error>)
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf: Option<PooledBuffer> = None;

        loop {
            if activity.token().is_cancelled() {
                return (StreamCopyResult::Canceled, None);
            }

            let b = buf.get_or_insert_with(|| global_pool().acquire());

            let read_start = Instant::now();
            let n = tokio::select! {
                _ = activity.token().cancelled() => {
                    return (StreamCopyResult::Canceled, None);
                }
                r = reader.read(&mut b[..]) => match r {
                    Ok(n) => n,
                    Err(e) => return (StreamCopyResult::InputError, Some(e)),
                },
            };
            transfer.read_time += read_start.elapsed();

            if n == 0 {
                if let Err(e) = writer.flush().await {
                    return (StreamCopyResult::OutputError, Some(e));
                }
                return (StreamCopyResult::Success, None);
            }

            if transfer.iops == 0 {
                transfer.first_read_time = started.elapsed();
            }
            transfer.iops += 1;
            activity.reset_timeout();

            let write_start = Instant::now();
            let write = tokio::select! {
                _ = activity.token().cancelled() => {
                    return (StreamCopyResult::Canceled, None);
                }
                r = async {
                    writer.write_all(&b[..n]).await?;
                    writer.flush().await
                } => r,
            };
            transfer.write_time += write_start.elapsed();

            if let Err(e) = write {
                return (StreamCopyResult::OutputError, Some(e));
            }

            transfer.total_bytes += n as u64;
            activity.reset_timeout();

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                *last_progress = Instant::now();
                self.telemetry.on_content_transferring(transfer);
            }

            // Retention: a full read means more data is probably waiting,
            // so keep the buffer; a short read returns it to the pool.
            if n < b.len() {
                buf = None;
            }
        }
    }
}
