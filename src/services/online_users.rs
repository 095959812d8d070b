use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::observability::Metrics;

const MIN_ONLINE_USERS: i64 = 100;
const MAX_ONLINE_USERS: i64 = 1000;
const STEP: i64 = 10;

/// Next simulated value: climbs by 10 and wraps back to 100 past 1000.
pub fn next_online_users(current: i64) -> i64 {
    let next = current + STEP;
    if !(MIN_ONLINE_USERS..=MAX_ONLINE_USERS).contains(&next) {
        MIN_ONLINE_USERS
    } else {
        next
    }
}

/// Background task feeding the `online_users` gauge with a synthetic load
/// curve for dashboards.
pub struct OnlineUsersTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl OnlineUsersTask {
    /// Spawns the task on the current runtime. The gauge is set to 100
    /// right away and moves one step per `interval`.
    pub fn start(metrics: Arc<Metrics>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        info!(interval_ms = interval.as_millis() as u64, "Starting online users simulator");

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            let mut current = MIN_ONLINE_USERS;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        metrics.online_users.set(current);
                        debug!(online_users = current, "Updated online users");
                        current = next_online_users(current);
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Online users simulator received shutdown signal");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The receiver is gone only if the task already exited.
            let _ = shutdown.send(());
        }

        if let Err(e) = self.handle.await {
            warn!(error = %e, "Online users simulator ended abnormally");
        }

        info!("Online users simulator stopped");
    }
}
