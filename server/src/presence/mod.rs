//! Presence Tracker.
//!
//! In-memory per-user presence (DashMap keyed by user id) driven by
//! connection lifecycle and heartbeats:
//!
//! - offline -> online when the first connection registers
//! - online -> away after `away_after` without a heartbeat
//! - away -> online on the next heartbeat (automatic away only)
//! - online/away -> offline once the last connection has been gone for
//!   `offline_grace`; reconnecting within the grace cancels the transition
//!
//! Every transition is published as a [`PresenceEvent`] and fanned out to
//! the user's observers by [`broadcast::run_presence_fanout`].

pub mod broadcast;
pub mod monitor;
pub mod routes;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{CoreError, Result};
use crate::messages::Recipient;
use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }

    /// Whether `self -> to` is a legal transition. Same-state is handled by
    /// callers as a no-op.
    pub fn can_transition_to(self, to: PresenceStatus) -> bool {
        use PresenceStatus::*;
        matches!(
            (self, to),
            (Offline, Online) | (Online, Away) | (Away, Online) | (Online, Offline) | (Away, Offline)
        )
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one user's presence as observers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceState {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// A user's status changed; goes to all of their observers.
    Changed(PresenceState),
    /// Current state of `state.user_id`, for one observer only.
    Snapshot { observer: UserId, state: PresenceState },
    /// Ephemeral typing indicator for a conversation.
    Typing { user_id: UserId, target: Recipient },
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub away_after: Duration,
    pub offline_grace: Duration,
}

#[derive(Debug)]
struct PresenceEntry {
    status: PresenceStatus,
    last_seen: DateTime<Utc>,
    last_heartbeat: Instant,
    /// Bumped on every connection open; a grace timer only fires if the
    /// generation it captured is still current.
    generation: u64,
    /// At least one connection is registered.
    live: bool,
    /// Away was entered by the idle sweep, not requested by the user.
    auto_away: bool,
}

impl PresenceEntry {
    fn offline() -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen: Utc::now(),
            last_heartbeat: Instant::now(),
            generation: 0,
            live: false,
            auto_away: false,
        }
    }

    fn snapshot(&self, user_id: &str) -> PresenceState {
        PresenceState {
            user_id: user_id.to_string(),
            status: self.status,
            last_seen: self.last_seen,
        }
    }
}

pub struct PresenceTracker {
    states: DashMap<UserId, PresenceEntry>,
    /// target -> users observing the target
    watchers: DashMap<UserId, HashSet<UserId>>,
    /// observer -> users the observer watches
    watching: DashMap<UserId, HashSet<UserId>>,
    events: mpsc::UnboundedSender<PresenceEvent>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig, events: mpsc::UnboundedSender<PresenceEvent>) -> Self {
        Self {
            states: DashMap::new(),
            watchers: DashMap::new(),
            watching: DashMap::new(),
            events,
            config,
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    fn publish(&self, event: PresenceEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Presence fanout stopped, dropping event");
        }
    }

    /// Current state. Unknown users are offline.
    pub fn status(&self, user_id: &str) -> PresenceState {
        self.states
            .get(user_id)
            .map(|e| e.snapshot(user_id))
            .unwrap_or_else(|| PresenceEntry::offline().snapshot(user_id))
    }

    /// Apply an explicit status change. Returns the new state, or `None` if
    /// the user already had that status.
    pub fn set_status(&self, user_id: &str, to: PresenceStatus) -> Result<Option<PresenceState>> {
        let changed = {
            let mut entry = self
                .states
                .entry(user_id.to_string())
                .or_insert_with(PresenceEntry::offline);
            let from = entry.status;
            if from == to {
                return Ok(None);
            }
            if !from.can_transition_to(to) {
                return Err(CoreError::InvalidTransition { from, to });
            }
            if to != PresenceStatus::Offline && !entry.live {
                return Err(CoreError::NotConnected {
                    user_id: user_id.to_string(),
                });
            }
            entry.status = to;
            entry.last_seen = Utc::now();
            entry.auto_away = false;
            if to == PresenceStatus::Online {
                entry.last_heartbeat = Instant::now();
            }
            entry.snapshot(user_id)
        };

        tracing::debug!(user_id = %user_id, status = %to, "Presence set");
        self.publish(PresenceEvent::Changed(changed.clone()));
        Ok(Some(changed))
    }

    /// First connection of a user registered.
    pub fn connection_opened(&self, user_id: &str) {
        let changed = {
            let mut entry = self
                .states
                .entry(user_id.to_string())
                .or_insert_with(PresenceEntry::offline);
            entry.generation += 1;
            entry.live = true;
            entry.last_heartbeat = Instant::now();
            entry.last_seen = Utc::now();
            if entry.status == PresenceStatus::Online {
                None
            } else {
                entry.status = PresenceStatus::Online;
                entry.auto_away = false;
                Some(entry.snapshot(user_id))
            }
        };

        if let Some(state) = changed {
            tracing::info!(user_id = %user_id, "User online");
            self.publish(PresenceEvent::Changed(state));
        }
    }

    /// Last connection of a user went away. Schedules the offline transition
    /// after the grace period.
    pub fn connection_closed(self: &Arc<Self>, user_id: &str) {
        let generation = {
            let Some(mut entry) = self.states.get_mut(user_id) else {
                return;
            };
            entry.live = false;
            entry.last_seen = Utc::now();
            entry.generation
        };

        let tracker = Arc::clone(self);
        let user_id = user_id.to_string();
        let grace = self.config.offline_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            tracker.expire(&user_id, generation);
        });
    }

    fn expire(&self, user_id: &str, generation: u64) {
        let changed = {
            let Some(mut entry) = self.states.get_mut(user_id) else {
                return;
            };
            if entry.live || entry.generation != generation || entry.status == PresenceStatus::Offline {
                return;
            }
            entry.status = PresenceStatus::Offline;
            entry.auto_away = false;
            entry.snapshot(user_id)
        };

        tracing::info!(user_id = %user_id, "User offline");
        self.publish(PresenceEvent::Changed(changed));
    }

    /// Any client activity. Restores online after an idle away.
    pub fn heartbeat(&self, user_id: &str) {
        let changed = {
            let Some(mut entry) = self.states.get_mut(user_id) else {
                return;
            };
            entry.last_heartbeat = Instant::now();
            entry.last_seen = Utc::now();
            if entry.live && entry.status == PresenceStatus::Away && entry.auto_away {
                entry.status = PresenceStatus::Online;
                entry.auto_away = false;
                Some(entry.snapshot(user_id))
            } else {
                None
            }
        };

        if let Some(state) = changed {
            self.publish(PresenceEvent::Changed(state));
        }
    }

    /// Move connected users with no heartbeat for `away_after` to away.
    /// Returns how many changed.
    pub fn sweep_idle(&self) -> usize {
        let mut changed = Vec::new();
        for mut entry in self.states.iter_mut() {
            if entry.live
                && entry.status == PresenceStatus::Online
                && entry.last_heartbeat.elapsed() >= self.config.away_after
            {
                entry.status = PresenceStatus::Away;
                entry.auto_away = true;
                let snapshot = entry.snapshot(entry.key());
                changed.push(snapshot);
            }
        }

        let count = changed.len();
        for state in changed {
            tracing::debug!(user_id = %state.user_id, "User idle, now away");
            self.publish(PresenceEvent::Changed(state));
        }
        count
    }

    /// `observer` starts receiving presence changes of `user_id`. The
    /// observer immediately gets a snapshot of the current state.
    pub fn subscribe(&self, user_id: &str, observer: &str) -> bool {
        let added = self
            .watchers
            .entry(user_id.to_string())
            .or_default()
            .insert(observer.to_string());
        self.watching
            .entry(observer.to_string())
            .or_default()
            .insert(user_id.to_string());

        if added {
            self.publish(PresenceEvent::Snapshot {
                observer: observer.to_string(),
                state: self.status(user_id),
            });
        }
        added
    }

    pub fn unsubscribe(&self, user_id: &str, observer: &str) -> bool {
        let removed = self
            .watchers
            .get_mut(user_id)
            .map(|mut set| set.remove(observer))
            .unwrap_or(false);
        self.watchers.remove_if(user_id, |_, set| set.is_empty());

        if let Some(mut set) = self.watching.get_mut(observer) {
            set.remove(user_id);
        }
        self.watching.remove_if(observer, |_, set| set.is_empty());
        removed
    }

    pub fn observers_of(&self, user_id: &str) -> Vec<UserId> {
        self.watchers
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn watched_by(&self, observer: &str) -> Vec<UserId> {
        self.watching
            .get(observer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-send the current state of everything `observer` watches, e.g.
    /// after they reconnect.
    pub fn announce_to(&self, observer: &str) {
        for user_id in self.watched_by(observer) {
            self.publish(PresenceEvent::Snapshot {
                observer: observer.to_string(),
                state: self.status(&user_id),
            });
        }
    }

    /// Typing counts as activity and is relayed to the conversation.
    pub fn typing(&self, user_id: &str, target: Recipient) {
        self.heartbeat(user_id);
        self.publish(PresenceEvent::Typing {
            user_id: user_id.to_string(),
            target,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AWAY: Duration = Duration::from_secs(90);
    const GRACE: Duration = Duration::from_secs(15);

    fn tracker() -> (Arc<PresenceTracker>, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = PresenceTracker::new(
            PresenceConfig {
                away_after: AWAY,
                offline_grace: GRACE,
            },
            tx,
        );
        (Arc::new(tracker), rx)
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<PresenceEvent>) -> Vec<PresenceStatus> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PresenceEvent::Changed(state) = event {
                out.push(state.status);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_transitions() {
        let (tracker, mut rx) = tracker();
        tracker.connection_opened("alice");
        assert_eq!(tracker.status("alice").status, PresenceStatus::Online);

        tokio::time::advance(AWAY + Duration::from_secs(1)).await;
        assert_eq!(tracker.sweep_idle(), 1);
        assert_eq!(tracker.status("alice").status, PresenceStatus::Away);

        tracker.heartbeat("alice");
        assert_eq!(tracker.status("alice").status, PresenceStatus::Online);

        tracker.connection_closed("alice");
        tokio::time::sleep(GRACE + Duration::from_millis(10)).await;
        assert_eq!(tracker.status("alice").status, PresenceStatus::Offline);

        assert_eq!(
            statuses(&mut rx),
            vec![
                PresenceStatus::Online,
                PresenceStatus::Away,
                PresenceStatus::Online,
                PresenceStatus::Offline
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_stays_online() {
        let (tracker, mut rx) = tracker();
        tracker.connection_opened("alice");
        tracker.connection_closed("alice");

        tokio::time::sleep(GRACE / 2).await;
        tracker.connection_opened("alice");
        tokio::time::sleep(GRACE * 2).await;

        assert_eq!(tracker.status("alice").status, PresenceStatus::Online);
        assert_eq!(statuses(&mut rx), vec![PresenceStatus::Online]);
    }

    #[tokio::test]
    async fn test_set_status_validates_transitions() {
        let (tracker, mut rx) = tracker();
        let err = tracker.set_status("bob", PresenceStatus::Away).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: PresenceStatus::Offline,
                to: PresenceStatus::Away
            }
        ));

        tracker.connection_opened("bob");
        assert!(tracker.set_status("bob", PresenceStatus::Offline).unwrap().is_some());
        assert!(tracker.set_status("bob", PresenceStatus::Online).unwrap().is_some());
        // Same status is a no-op without a broadcast
        assert!(tracker.set_status("bob", PresenceStatus::Online).unwrap().is_none());
        assert_eq!(
            statuses(&mut rx),
            vec![
                PresenceStatus::Online,
                PresenceStatus::Offline,
                PresenceStatus::Online
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_requires_a_connection() {
        let (tracker, mut rx) = tracker();
        let err = tracker.set_status("ghost", PresenceStatus::Online).unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));

        tokio::time::advance(Duration::from_secs(3600)).await;
        tracker.sweep_idle();
        assert_eq!(tracker.status("ghost").status, PresenceStatus::Offline);

        // Once the last connection is gone, away is refused as well
        tracker.connection_opened("alice");
        tracker.connection_closed("alice");
        let err = tracker.set_status("alice", PresenceStatus::Away).unwrap_err();
        assert!(matches!(err, CoreError::NotConnected { .. }));
        tokio::time::sleep(GRACE + Duration::from_millis(10)).await;
        assert_eq!(tracker.status("alice").status, PresenceStatus::Offline);
        assert_eq!(
            statuses(&mut rx),
            vec![PresenceStatus::Online, PresenceStatus::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_away_survives_heartbeat() {
        let (tracker, _rx) = tracker();
        tracker.connection_opened("alice");
        tracker.set_status("alice", PresenceStatus::Away).unwrap();
        tracker.heartbeat("alice");
        assert_eq!(tracker.status("alice").status, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn test_subscribe_sends_snapshot() {
        let (tracker, mut rx) = tracker();
        tracker.connection_opened("alice");
        let _ = rx.try_recv();

        assert!(tracker.subscribe("alice", "bob"));
        assert!(!tracker.subscribe("alice", "bob"));
        match rx.try_recv().unwrap() {
            PresenceEvent::Snapshot { observer, state } => {
                assert_eq!(observer, "bob");
                assert_eq!(state.status, PresenceStatus::Online);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        assert_eq!(tracker.observers_of("alice"), vec!["bob".to_string()]);
        assert_eq!(tracker.watched_by("bob"), vec!["alice".to_string()]);

        assert!(tracker.unsubscribe("alice", "bob"));
        assert!(tracker.observers_of("alice").is_empty());
        assert!(tracker.watched_by("bob").is_empty());
    }
}
