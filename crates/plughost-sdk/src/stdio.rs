//! JSON-lines transport for out-of-process plugins.

use std::sync::Arc;
use std::time::Duration;

use plughost_core::{GuestMessage, HostMessage, LogLevel};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::SdkResult;
use crate::guest::Guest;
use crate::serve::serve;

const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Serve `guest` over the process's stdin and stdout.
///
/// One JSON message per line in each direction. Unparseable input lines are
/// reported back to the host as warnings and otherwise ignored. Anything the
/// plugin wants to print for humans belongs on stderr, which the host
/// forwards to its own log.
///
/// # Errors
///
/// Returns an error if stdout cannot be written.
pub async fn run_stdio(guest: Arc<dyn Guest>) -> SdkResult<()> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

    let reader_outbox = outbox_tx.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HostMessage>(&line) {
                Ok(message) => {
                    if inbox_tx.send(message).is_err() {
                        break;
                    }
                },
                Err(e) => {
                    let _ = reader_outbox.send(GuestMessage::Log {
                        level: LogLevel::Warn,
                        message: format!("ignoring malformed host message: {e}"),
                    });
                },
            }
        }
    });

    let writer = tokio::spawn(write_lines(tokio::io::stdout(), outbox_rx));

    let served = serve(guest, inbox_rx, outbox_tx).await;
    reader.abort();
    // Handlers still winding down hold outbox senders; don't wait on them
    // forever.
    let written = tokio::time::timeout(FLUSH_GRACE, writer)
        .await
        .map_or(Ok(()), |joined| joined.unwrap_or(Ok(())));
    served?;
    written
}

async fn write_lines<W>(mut out: W, mut rx: mpsc::UnboundedReceiver<GuestMessage>) -> SdkResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}
