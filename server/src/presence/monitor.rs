//! Heartbeat monitor: periodically moves idle connected users to away.

use std::sync::Arc;
use std::time::Duration;

use super::PresenceTracker;

pub fn spawn_heartbeat_monitor(presence: Arc<PresenceTracker>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let idle = presence.sweep_idle();
            if idle > 0 {
                tracing::debug!(idle, "Idle users marked away");
            }
        }
    });
}
