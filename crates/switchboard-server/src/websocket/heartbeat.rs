//! Liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound frame arrived within the timeout window.
    TimedOut,
    /// The connection closed first.
    Cancelled,
}

/// Shortest tick period; `tokio::time::interval` rejects a zero period.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Consecutive silent intervals tolerated before timing out.
///
/// `timeout / interval`, rounded up, at least 1.
pub fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    let missed = timeout.as_millis().div_ceil(interval_ms).max(1);
    u32::try_from(missed).unwrap_or(u32::MAX)
}

/// Watch a connection's alive flag.
///
/// At each `interval` tick the flag is checked and reset. Any inbound frame
/// (text, binary, ping or pong) sets it again. After [`max_missed`]
/// consecutive silent ticks the connection is reported dead.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = interval.max(MIN_TICK);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let max_missed = max_missed(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
