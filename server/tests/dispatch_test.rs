//! Integration tests for the messaging core: fan-out, queueing, ordering,
//! slow-consumer eviction, persistence failures and presence relay.

use chrono::{DateTime, Utc};
use prost::Message as ProstMessage;
use std::sync::Arc;
use std::time::Duration;

use agora_server::config::MessagingConfig;
use agora_server::dispatch::DeliveryOutcome;
use agora_server::messages::{DeliveryState, Message, NewMessage, Receipt, Recipient};
use agora_server::notifications::{NotificationEntry, NotificationPayload};
use agora_server::presence::PresenceStatus;
use agora_server::proto::{self, Payload};
use agora_server::registry::{ConnectionHandle, FrameKind, OutboundFrame};
use agora_server::store::sqlite::SqliteStore;
use agora_server::store::{Store, StoredQueue};
use agora_server::{CoreError, Hub, UserId};

fn test_config() -> MessagingConfig {
    MessagingConfig {
        offline_grace_secs: 0,
        ..MessagingConfig::default()
    }
}

fn hub_with(config: MessagingConfig) -> Hub {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    Hub::new(store, config)
}

fn dm(from: &str, to: &str, body: &str) -> NewMessage {
    NewMessage {
        sender_id: from.into(),
        target: Recipient::User(to.into()),
        body: body.into(),
    }
}

/// Take the next frame off a connection as the writer would.
async fn next_frame(handle: &ConnectionHandle) -> OutboundFrame {
    let frame = tokio::time::timeout(Duration::from_secs(2), handle.outbox().next())
        .await
        .expect("timed out waiting for frame")
        .expect("outbox closed");
    handle.outbox().complete();
    frame
}

fn message_id(frame: &OutboundFrame) -> String {
    frame
        .delivers()
        .map(|(id, _)| id.to_string())
        .expect("frame carries no message")
}

fn decode(frame: &OutboundFrame) -> Payload {
    proto::Envelope::decode(frame.bytes.clone())
        .unwrap()
        .payload
        .unwrap()
}

async fn wait_for_status(hub: &Hub, user: &str, status: PresenceStatus) {
    for _ in 0..200 {
        if hub.presence.status(user).status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{user} never became {status}");
}

#[tokio::test]
async fn test_offline_recipient_gets_message_on_connect() {
    let hub = hub_with(test_config());

    let (message, report) = hub.post_message(dm("alice", "bob", "hi bob")).await.unwrap();
    assert!(matches!(
        report.outcome_for("bob"),
        Some(DeliveryOutcome::Queued { sequence: 1 })
    ));

    let bob = hub.connect("bob", None).await.unwrap();
    let frame = next_frame(&bob).await;
    assert!(matches!(frame.kind, FrameKind::Queued { sequence: 1, .. }));
    assert_eq!(message_id(&frame), message.message_id);

    // The receipt is recorded by the time the writer callback returns
    hub.frame_written(&frame).await;
    let (loaded, receipts) = hub.messages.get(&message.message_id).await.unwrap();
    assert_eq!(loaded.delivery_state, DeliveryState::Delivered);
    assert_eq!(receipts[0].state, DeliveryState::Delivered);

    assert_eq!(hub.acknowledge("bob", 1).await.unwrap(), 1);
    assert_eq!(hub.queue.depth("bob").await.unwrap(), 0);
}

#[tokio::test]
async fn test_queued_messages_are_not_overtaken_by_live_ones() {
    let hub = hub_with(test_config());

    let (m1, _) = hub.post_message(dm("alice", "bob", "one")).await.unwrap();
    let (m2, _) = hub.post_message(dm("alice", "bob", "two")).await.unwrap();

    let bob = hub.connect("bob", None).await.unwrap();
    let (m3, report) = hub.post_message(dm("alice", "bob", "three")).await.unwrap();
    assert!(matches!(
        report.outcome_for("bob"),
        Some(DeliveryOutcome::Live { connections: 1 })
    ));

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(message_id(&next_frame(&bob).await));
    }
    assert_eq!(received, vec![m1.message_id, m2.message_id, m3.message_id]);
}

#[tokio::test]
async fn test_every_device_receives_live_message() {
    let hub = hub_with(test_config());
    let phone = hub.connect("bob", None).await.unwrap();
    let laptop = hub.connect("bob", None).await.unwrap();

    let (message, report) = hub.post_message(dm("alice", "bob", "hello")).await.unwrap();
    assert!(matches!(
        report.outcome_for("bob"),
        Some(DeliveryOutcome::Live { connections: 2 })
    ));
    assert_eq!(message_id(&next_frame(&phone).await), message.message_id);
    assert_eq!(message_id(&next_frame(&laptop).await), message.message_id);
}

#[tokio::test]
async fn test_slow_consumer_is_evicted_without_blocking_others() {
    let hub = hub_with(MessagingConfig {
        send_queue_depth: 2,
        ..test_config()
    });
    for user in ["alice", "bob", "carol"] {
        hub.messages.join_thread("t1", user).await.unwrap();
    }

    let bob = hub.connect("bob", None).await.unwrap();
    let carol = hub.connect("carol", None).await.unwrap();
    wait_for_status(&hub, "bob", PresenceStatus::Online).await;

    let mut sent = Vec::new();
    for body in ["one", "two", "three"] {
        let (message, report) = hub
            .post_message(NewMessage {
                sender_id: "alice".into(),
                target: Recipient::Thread("t1".into()),
                body: body.into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            report.outcome_for("carol"),
            Some(DeliveryOutcome::Live { .. })
        ));
        // Carol keeps up, bob never reads
        assert_eq!(message_id(&next_frame(&carol).await), message.message_id);
        sent.push(message);
    }

    assert!(bob.is_closed());
    assert!(!hub.registry.is_connected("bob"));
    assert!(hub.registry.is_connected("carol"));

    // Bob's undelivered messages wait in his queue, in order
    let queued: Vec<String> = hub
        .queue
        .drain("bob", 0)
        .collect_all()
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.payload.message().map(|m| m.message_id.clone()))
        .collect();
    let expected: Vec<String> = sent.iter().map(|m| m.message_id.clone()).collect();
    assert_eq!(queued, expected);

    wait_for_status(&hub, "bob", PresenceStatus::Offline).await;
    assert_eq!(hub.presence.status("carol").status, PresenceStatus::Online);
}

#[tokio::test]
async fn test_resume_from_skips_processed_entries() {
    let hub = hub_with(test_config());
    for body in ["one", "two", "three"] {
        hub.post_message(dm("alice", "bob", body)).await.unwrap();
    }

    let bob = hub.connect("bob", Some(2)).await.unwrap();
    let frame = next_frame(&bob).await;
    assert!(matches!(frame.kind, FrameKind::Queued { sequence: 3, .. }));
    assert_eq!(hub.queue.depth("bob").await.unwrap(), 1);
    assert!(bob.outbox().is_empty());
}

#[tokio::test]
async fn test_disconnect_moves_unwritten_frames_to_queue() {
    let hub = hub_with(test_config());
    let bob = hub.connect("bob", None).await.unwrap();
    hub.post_message(dm("alice", "bob", "in flight")).await.unwrap();

    // Writer died before the frame was written
    bob.cancel_token().cancel();
    hub.disconnect(&bob).await;

    assert_eq!(hub.queue.depth("bob").await.unwrap(), 1);
    let again = hub.connect("bob", None).await.unwrap();
    let frame = next_frame(&again).await;
    assert!(matches!(frame.kind, FrameKind::Queued { sequence: 1, .. }));
}

#[tokio::test]
async fn test_full_queue_is_reported_per_recipient() {
    let hub = hub_with(MessagingConfig {
        queue_capacity: 2,
        ..test_config()
    });
    let rsvp = || NotificationPayload::Rsvp {
        event_id: "e1".into(),
        attendee_id: "carol".into(),
        response: "yes".into(),
    };
    hub.notify("bob", rsvp()).await.unwrap();
    hub.notify("bob", rsvp()).await.unwrap();
    let overflow = hub.notify("bob", rsvp()).await;
    assert!(matches!(overflow, Err(CoreError::QueueOverflow { .. })));

    let (message, report) = hub.post_message(dm("alice", "bob", "lost?")).await.unwrap();
    assert!(matches!(
        report.outcome_for("bob"),
        Some(DeliveryOutcome::Failed(CoreError::QueueOverflow { .. }))
    ));
    // Still durable, just not delivered
    let (loaded, _) = hub.messages.get(&message.message_id).await.unwrap();
    assert_eq!(loaded.delivery_state, DeliveryState::Pending);
}

/// Store whose message writes always fail.
struct FailingStore {
    inner: SqliteStore,
}

impl Store for FailingStore {
    fn append_message(&self, _: &Message, _: &[UserId]) -> agora_server::Result<()> {
        Err(CoreError::PersistenceFailure("disk full".into()))
    }
    fn load_message(&self, id: &str) -> agora_server::Result<Option<Message>> {
        self.inner.load_message(id)
    }
    fn receipts(&self, id: &str) -> agora_server::Result<Vec<Receipt>> {
        self.inner.receipts(id)
    }
    fn advance_receipt(&self, id: &str, recipient: &str, state: DeliveryState) -> agora_server::Result<bool> {
        self.inner.advance_receipt(id, recipient, state)
    }
    fn add_participant(&self, thread: &str, user: &str) -> agora_server::Result<bool> {
        self.inner.add_participant(thread, user)
    }
    fn remove_participant(&self, thread: &str, user: &str) -> agora_server::Result<bool> {
        self.inner.remove_participant(thread, user)
    }
    fn participants(&self, thread: &str) -> agora_server::Result<Vec<UserId>> {
        self.inner.participants(thread)
    }
    fn append_notification(&self, entry: &NotificationEntry) -> agora_server::Result<()> {
        self.inner.append_notification(entry)
    }
    fn load_queue(&self, user: &str) -> agora_server::Result<StoredQueue> {
        self.inner.load_queue(user)
    }
    fn mark_consumed(&self, user: &str, up_to: u64) -> agora_server::Result<usize> {
        self.inner.mark_consumed(user, up_to)
    }
    fn purge_consumed(&self, before: DateTime<Utc>) -> agora_server::Result<usize> {
        self.inner.purge_consumed(before)
    }
}

#[tokio::test]
async fn test_persistence_failure_stops_fanout() {
    let store: Arc<dyn Store> = Arc::new(FailingStore {
        inner: SqliteStore::in_memory().unwrap(),
    });
    let hub = Hub::new(store, test_config());
    let bob = hub.connect("bob", None).await.unwrap();

    let result = hub.post_message(dm("alice", "bob", "never stored")).await;
    assert!(matches!(result, Err(CoreError::PersistenceFailure(_))));
    assert!(bob.outbox().is_empty());
    assert_eq!(hub.queue.depth("bob").await.unwrap(), 0);
}

#[tokio::test]
async fn test_observers_see_presence_changes() {
    let hub = hub_with(test_config());
    hub.presence.subscribe("bob", "alice");
    let alice = hub.connect("alice", None).await.unwrap();

    let bob = hub.connect("bob", None).await.unwrap();

    let mut seen = Vec::new();
    while !seen.contains(&proto::PresenceStatus::Online) {
        if let Payload::PresenceEvent(event) = decode(&next_frame(&alice).await) {
            assert_eq!(event.user_id, "bob");
            seen.push(proto::PresenceStatus::try_from(event.status).unwrap());
        }
    }

    hub.disconnect(&bob).await;
    loop {
        if let Payload::PresenceEvent(event) = decode(&next_frame(&alice).await) {
            if event.status == proto::PresenceStatus::Offline as i32 {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_typing_goes_to_other_participants() {
    let hub = hub_with(test_config());
    for user in ["alice", "bob"] {
        hub.messages.join_thread("t1", user).await.unwrap();
    }
    let alice = hub.connect("alice", None).await.unwrap();
    let bob = hub.connect("bob", None).await.unwrap();

    hub.typing("alice", Recipient::Thread("t1".into()));

    match decode(&next_frame(&bob).await) {
        Payload::TypingEvent(event) => {
            assert_eq!(event.user_id, "alice");
            assert_eq!(event.target.unwrap().thread_id, "t1");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    let nothing = tokio::time::timeout(Duration::from_millis(100), alice.outbox().next()).await;
    assert!(nothing.is_err());
}

fn body_of(frame: &OutboundFrame) -> String {
    match decode(frame) {
        Payload::MessageEvent(event) => event.message.unwrap().body,
        Payload::NotificationEvent(event) => event.message.unwrap().body,
        other => panic!("unexpected payload {other:?}"),
    }
}

/// Bodies sent by `sender`, in the order they appear in `bodies`.
fn from_sender<'a>(bodies: &'a [String], sender: &str) -> Vec<&'a str> {
    let prefix = format!("{sender}-");
    bodies
        .iter()
        .filter(|b| b.starts_with(&prefix))
        .map(|b| b.as_str())
        .collect()
}

async fn send_burst(hub: Hub, sender: &'static str, count: usize) {
    for i in 0..count {
        hub.post_message(dm(sender, "bob", &format!("{sender}-{i:02}")))
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_keep_per_sender_order() {
    const PER_SENDER: usize = 20;
    let hub = hub_with(test_config());
    let expected = |sender: &str| -> Vec<String> {
        (0..PER_SENDER).map(|i| format!("{sender}-{i:02}")).collect()
    };

    // Queued path: bob is offline while both senders race
    let a = tokio::spawn(send_burst(hub.clone(), "alice", PER_SENDER));
    let c = tokio::spawn(send_burst(hub.clone(), "carol", PER_SENDER));
    a.await.unwrap();
    c.await.unwrap();

    let queued: Vec<String> = hub
        .queue
        .drain("bob", 0)
        .collect_all()
        .await
        .unwrap()
        .iter()
        .filter_map(|e| e.payload.message().map(|m| m.body.clone()))
        .collect();
    assert_eq!(queued.len(), 2 * PER_SENDER);
    assert_eq!(from_sender(&queued, "alice"), expected("alice"));
    assert_eq!(from_sender(&queued, "carol"), expected("carol"));
    hub.acknowledge("bob", (2 * PER_SENDER) as u64).await.unwrap();

    // Live path: bob is connected and caught up
    let bob = hub.connect("bob", None).await.unwrap();
    let a = tokio::spawn(send_burst(hub.clone(), "alice", PER_SENDER));
    let c = tokio::spawn(send_burst(hub.clone(), "carol", PER_SENDER));
    a.await.unwrap();
    c.await.unwrap();

    let mut live = Vec::new();
    for _ in 0..2 * PER_SENDER {
        live.push(body_of(&next_frame(&bob).await));
    }
    assert_eq!(from_sender(&live, "alice"), expected("alice"));
    assert_eq!(from_sender(&live, "carol"), expected("carol"));
    assert!(bob.outbox().is_empty());
}

#[tokio::test]
async fn test_arrival_order_decides_between_senders() {
    let hub = hub_with(test_config());
    let bob = hub.connect("bob", None).await.unwrap();

    // Carol's message is created first but reaches the dispatcher second
    let (from_carol, carol_recipients) = hub
        .messages
        .persist(dm("carol", "bob", "carol-early"))
        .await
        .unwrap();
    hub.post_message(dm("alice", "bob", "alice-late")).await.unwrap();
    hub.dispatcher.dispatch(&from_carol, &carol_recipients).await;

    assert_eq!(body_of(&next_frame(&bob).await), "alice-late");
    assert_eq!(body_of(&next_frame(&bob).await), "carol-early");
}

#[tokio::test]
async fn test_per_user_state_is_released_after_disconnect() {
    let hub = hub_with(test_config());

    for i in 0..200 {
        let user = format!("user-{i}");
        let handle = hub.connect(&user, None).await.unwrap();
        hub.disconnect(&handle).await;
    }

    assert_eq!(hub.registry.total_connections(), 0);
    assert_eq!(hub.dispatcher.lane_count(), 0);
    assert_eq!(hub.queue.loaded_queues(), 0);

    // A user with pending entries keeps their queue until it is acknowledged
    hub.post_message(dm("alice", "bob", "pending")).await.unwrap();
    let bob = hub.connect("bob", None).await.unwrap();
    hub.disconnect(&bob).await;
    assert_eq!(hub.queue.loaded_queues(), 1);
    assert_eq!(hub.acknowledge("bob", 1).await.unwrap(), 1);
    assert_eq!(hub.queue.loaded_queues(), 0);
    assert_eq!(hub.dispatcher.lane_count(), 0);
}

#[tokio::test]
async fn test_acknowledged_entries_count_as_delivered() {
    let hub = hub_with(test_config());
    let (first, _) = hub.post_message(dm("alice", "bob", "one")).await.unwrap();
    let (second, _) = hub.post_message(dm("alice", "bob", "two")).await.unwrap();

    // Reconnecting with resume_from acknowledges the first entry
    let bob = hub.connect("bob", Some(1)).await.unwrap();
    let (loaded, _) = hub.messages.get(&first.message_id).await.unwrap();
    assert_eq!(loaded.delivery_state, DeliveryState::Delivered);
    let (loaded, _) = hub.messages.get(&second.message_id).await.unwrap();
    assert_eq!(loaded.delivery_state, DeliveryState::Pending);

    hub.disconnect(&bob).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_connections_to_detach() {
    let hub = hub_with(test_config());
    let bob = hub.connect("bob", None).await.unwrap();
    let (message, report) = hub.post_message(dm("alice", "bob", "late")).await.unwrap();
    assert!(matches!(
        report.outcome_for("bob"),
        Some(DeliveryOutcome::Live { connections: 1 })
    ));

    // Stands in for the WebSocket actor: it only detaches once cancelled
    let actor_hub = hub.clone();
    let actor_bob = bob.clone();
    hub.spawn_connection(async move {
        actor_bob.cancel_token().cancelled().await;
        tokio::task::yield_now().await;
        actor_hub.disconnect(&actor_bob).await;
    });

    hub.shutdown();
    assert!(hub.wait_for_connections(Duration::from_secs(2)).await);

    assert!(!hub.registry.is_connected("bob"));
    let pending = hub.queue.pending_after("bob", 0, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].payload.message().map(|m| m.message_id.as_str()),
        Some(message.message_id.as_str())
    );
}
