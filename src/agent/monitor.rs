//! Liveness tracking on the agent side: the out-of-band heartbeat sender and
//! the local health monitor.

use super::client::BrokerClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Connection flag plus the time of the last event seen on the stream
#[derive(Debug)]
pub struct Liveness {
    connected: AtomicBool,
    last_stream_event: Mutex<Instant>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_stream_event: Mutex::new(Instant::now()),
        }
    }
}

impl Liveness {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Records stream activity
    pub fn touch(&self) {
        let mut last = match self.last_stream_event.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        match self.last_stream_event.lock() {
            Ok(guard) => guard.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }

    /// Marks the agent disconnected when the stream has been quiet too long
    ///
    /// # Returns
    ///
    /// `true` if this call flipped the flag
    pub fn check(&self, heartbeat_timeout: Duration) -> bool {
        if self.is_connected() && self.silence() > heartbeat_timeout {
            self.set_connected(false);
            return true;
        }
        false
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sends `POST /agents/{id}/heartbeat` every `period` while connected
pub async fn heartbeat_loop(
    client: BrokerClient,
    agent_id: String,
    liveness: Arc<Liveness>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !liveness.is_connected() {
                    continue;
                }
                match client.heartbeat(&agent_id).await {
                    Ok(true) => debug!(%agent_id, "Heartbeat acknowledged"),
                    Ok(false) => warn!(%agent_id, "Broker no longer knows this agent"),
                    Err(e) => warn!(%agent_id, "Heartbeat failed: {}", e),
                }
            }
        }
    }
}

/// Every `period`, flags the agent disconnected if the stream went silent
/// for longer than `heartbeat_timeout`. The flag is advisory; reconnection is
/// driven by stream errors.
pub async fn health_monitor(
    liveness: Arc<Liveness>,
    period: Duration,
    heartbeat_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if liveness.check(heartbeat_timeout) {
                    warn!(
                        silence = ?liveness.silence(),
                        "No stream activity within heartbeat timeout, marking disconnected"
                    );
                }
            }
        }
    }
}
