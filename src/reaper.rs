use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::QueueService;

/// Sweep for stuck jobs every `every` until cancelled.
pub async fn start(
    cancel_token: CancellationToken,
    queue: QueueService,
    every: Duration,
    stale_after: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Reaper Cancelled");
                break;
            },
            _ = ticker.tick() => {
                match queue.reap_stale(stale_after).await {
                    Ok(0) => trace!("Nothing to reap"),
                    Ok(count) => info!(reaped = count, "Reaped stale jobs"),
                    Err(err) => error!(message = "Reaper sweep failed", error = %err),
                }
            }
        }
    }
    info!("Reaper stopped.");
}
