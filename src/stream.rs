//! Async adapters feeding a [`TrackingSession`](crate::TrackingSession) from
//! asynchronous position producers.
//!
//! Fixes are forwarded in stream order to the session's queue; matching itself
//! still runs on the session worker.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::FixSender;
use crate::{Position, Result};

/// Forward every fix from `stream` to the session. A failed item is reported as a
/// lost position and the stream keeps being polled.
///
/// Returns the number of fixes forwarded when the stream ends.
pub async fn pump_stream<S, E>(sender: FixSender, stream: S) -> Result<usize>
where
    S: Stream<Item = std::result::Result<Position, E>>,
    E: Display,
{
    futures::pin_mut!(stream);
    let mut forwarded = 0;

    while let Some(item) = stream.next().await {
        match item {
            Ok(position) => {
                sender.send(position)?;
                forwarded += 1;
            }
            Err(err) => {
                warn!("[PositionStream] Source error: {}", err);
                sender.report_lost()?;
            }
        }
    }

    debug!("[PositionStream] Ended after {} fixes", forwarded);
    Ok(forwarded)
}

/// Forward fixes from a tokio channel until every producer has hung up.
pub async fn pump_channel(sender: FixSender, mut rx: mpsc::Receiver<Position>) -> Result<usize> {
    let mut forwarded = 0;
    while let Some(position) = rx.recv().await {
        sender.send(position)?;
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Spawn [`pump_stream`] on the current tokio runtime.
pub fn spawn_pump<S, E>(sender: FixSender, stream: S) -> JoinHandle<Result<usize>>
where
    S: Stream<Item = std::result::Result<Position, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(pump_stream(sender, stream))
}
