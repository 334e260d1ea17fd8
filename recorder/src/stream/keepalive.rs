//! Periodic keepalive pings for an open trace stream

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::connection::ConnectionControl;

/// Ping task for one connection; aborted on [`KeepAlive::stop`] or drop
pub struct KeepAlive {
    task: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Ping every `period` while the connection is open
    ///
    /// The first ping goes out one period after start. The task exits on its
    /// own once the connection leaves the open state.
    pub fn start(control: ConnectionControl, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !control.is_open() {
                            break;
                        }
                        trace!("Sending keepalive ping");
                        if control.ping().is_err() {
                            break;
                        }
                    }
                    _ = control.closed() => break,
                }
            }
            debug!("Keepalive stopped");
        });

        Self { task: Some(task) }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the ping timer; safe to call more than once
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}
