//! One dashboard client on the live feed

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::hub::{HubEvent, RecvError, Subscription};

/// Write one event as a newline-terminated JSON line
pub async fn write_event<W>(writer: &mut W, event: &HubEvent) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&event.line).await?;
    writer.flush().await
}

/// Streams hub events to a single client
///
/// The read half is only watched for the client hanging up. Anything the
/// client sends is discarded.
pub struct FeedConnection<R, W> {
    id: u64,
    peer_addr: SocketAddr,
    reader: R,
    writer: W,
    subscription: Subscription,
    shutdown: CancellationToken,
    events_written: u64,
    events_skipped: u64,
}

impl<R, W> FeedConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        reader: R,
        writer: W,
        subscription: Subscription,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            reader,
            writer,
            subscription,
            shutdown,
            events_written: 0,
            events_skipped: 0,
        }
    }

    /// Events written so far
    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    /// Events missed because the client fell behind
    pub fn events_skipped(&self) -> u64 {
        self.events_skipped
    }

    /// Forward events until the hub closes, the server stops, the client
    /// hangs up or a write fails
    pub async fn run(&mut self) -> Result<()> {
        let mut discard = [0u8; 512];
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                read = self.reader.read(&mut discard) => match read {
                    Ok(0) => {
                        tracing::debug!(conn_id = self.id, peer = %self.peer_addr, "Feed client hung up");
                        return Ok(());
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(conn_id = self.id, error = %e, "Feed client read failed");
                        return Ok(());
                    }
                },
                result = self.subscription.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            conn_id = self.id,
                            peer = %self.peer_addr,
                            skipped,
                            "Feed client lagging, events skipped"
                        );
                        self.events_skipped += skipped;
                        continue;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            };

            write_event(&mut self.writer, &event).await?;
            self.events_written += 1;

            tracing::trace!(conn_id = self.id, event = %event, "Event written");
        }
    }
}
