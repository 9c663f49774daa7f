//! Liveness of the socket in both directions.
//!
//! The reader and writer tasks stamp [`LinkActivity`] on every frame. The
//! monitor only looks at those stamps: it writes a heartbeat frame when
//! nothing was sent for one interval, and shuts the connection down when
//! nothing was received for `missed_heartbeats` intervals.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use super::{ManagementCommand, OutgoingMessage};
use crate::{
    api::connection::ShutdownReason,
    frame::{Frame, DEFAULT_CONN_CHANNEL},
};

/// Finest resolution at which silence is checked.
const MIN_TICK: Duration = Duration::from_millis(10);

pub(crate) struct LinkActivity {
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
}

impl LinkActivity {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
        }
    }

    pub fn record_rx(&self) {
        if let Ok(mut last) = self.last_rx.lock() {
            *last = Instant::now();
        }
    }

    pub fn record_tx(&self) {
        if let Ok(mut last) = self.last_tx.lock() {
            *last = Instant::now();
        }
    }

    fn since_rx(&self, now: Instant) -> Duration {
        self.last_rx
            .lock()
            .map(|last| now.saturating_duration_since(*last))
            .unwrap_or_default()
    }

    fn since_tx(&self, now: Instant) -> Duration {
        self.last_tx
            .lock()
            .map(|last| now.saturating_duration_since(*last))
            .unwrap_or_default()
    }
}

/////////////////////////////////////////////////////////////////////////////

pub(crate) struct HeartbeatMonitor {
    interval: Duration,
    /// receive silence after which the peer is declared dead
    threshold: Duration,
    activity: Arc<LinkActivity>,
    outgoing_tx: mpsc::Sender<OutgoingMessage>,
    mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatMonitor {
    pub fn new(
        interval: Duration,
        missed_heartbeats: u32,
        activity: Arc<LinkActivity>,
        outgoing_tx: mpsc::Sender<OutgoingMessage>,
        mgmt_tx: mpsc::UnboundedSender<ManagementCommand>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval,
            threshold: interval * missed_heartbeats.max(1),
            activity,
            outgoing_tx,
            mgmt_tx,
            shutdown,
        }
    }

    pub async fn run_until_shutdown(mut self) {
        let mut ticker = time::interval((self.interval / 4).max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("heartbeat monitor received shutdown notification");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();

                    let silence = self.activity.since_rx(now);
                    if silence >= self.threshold {
                        warn!(
                            "no frame received for {:?}, threshold {:?}, connection considered dead",
                            silence, self.threshold
                        );
                        let reason = ShutdownReason::heartbeat_missed(self.threshold);
                        if self.mgmt_tx.send(ManagementCommand::Shutdown(reason)).is_err() {
                            debug!("connection already stopped");
                        }
                        break;
                    }

                    if self.activity.since_tx(now) >= self.interval {
                        // a full queue means frames are about to be written anyway
                        match self
                            .outgoing_tx
                            .try_send(OutgoingMessage::Frame(DEFAULT_CONN_CHANNEL, Frame::Heartbeat))
                        {
                            Ok(()) => trace!("heartbeat sent"),
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                trace!("outgoing queue busy, heartbeat skipped")
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
        }
        debug!("shutdown heartbeat monitor");
    }
}
