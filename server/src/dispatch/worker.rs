//! Delivery worker.
//!
//! Outboxes only take as many queued entries as they have room for, so a
//! large backlog is handed over in several rounds. This task periodically
//! tops up every connected user that still has pending entries.

use std::sync::Arc;
use std::time::Duration;

use super::Dispatcher;
use crate::notifications::NotificationQueue;

pub fn spawn_delivery_worker(
    dispatcher: Arc<Dispatcher>,
    queue: Arc<NotificationQueue>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pushed = deliver_pending(&dispatcher, &queue).await;
            if pushed > 0 {
                tracing::debug!(pushed, "Delivery worker pushed queued entries");
            }
        }
    });
}

/// One round: pump each connected user with pending entries.
pub async fn deliver_pending(dispatcher: &Dispatcher, queue: &NotificationQueue) -> usize {
    let mut pushed = 0;
    for user_id in queue.users_with_pending() {
        if dispatcher.registry().is_connected(&user_id) {
            pushed += dispatcher.pump(&user_id).await;
        }
    }
    pushed
}
