// Per-stream change fan-out.
//
// Every committed write to a session or its chat log is published here and
// forwarded to each subscriber of that stream over its own unbounded channel.
// Events are never coalesced; a subscriber sees every event published after it
// subscribed, in publish order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use scrolllive_common::types::{ChatMessage, SessionUpdate, StreamSession};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Session(SessionUpdate),
    Chat(ChatMessage),
}

#[derive(Default)]
struct FeedState {
    next_subscriber_id: u64,
    streams: HashMap<Uuid, HashMap<u64, mpsc::UnboundedSender<StreamEvent>>>,
}

#[derive(Clone, Default)]
pub struct ChangeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl ChangeFeed {
    pub fn subscribe(&self, stream_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber_id = {
            let mut state = self.lock();
            state.next_subscriber_id += 1;
            let subscriber_id = state.next_subscriber_id;
            state.streams.entry(stream_id).or_default().insert(subscriber_id, sender);
            subscriber_id
        };
        debug!(stream_id = %stream_id, subscriber_id, "feed subscriber attached");

        Subscription {
            receiver,
            disposer: Disposer {
                feed: Some(self.clone()),
                stream_id,
                subscriber_id,
                task: None,
            },
        }
    }

    /// Sends `event` to every live subscriber of the stream and prunes the
    /// ones whose receiver is gone. Returns the number of deliveries.
    pub fn publish(&self, stream_id: Uuid, event: StreamEvent) -> usize {
        let mut state = self.lock();
        let Some(subscribers) = state.streams.get_mut(&stream_id) else {
            return 0;
        };

        subscribers.retain(|_, sender| sender.send(event.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            state.streams.remove(&stream_id);
        }
        delivered
    }

    pub fn publish_session(&self, session: &StreamSession) -> usize {
        let update = SessionUpdate::from_session(Some(session.clone()));
        self.publish(session.id, StreamEvent::Session(update))
    }

    pub fn publish_chat(&self, message: &ChatMessage) -> usize {
        self.publish(message.stream_id, StreamEvent::Chat(message.clone()))
    }

    pub fn subscriber_count(&self, stream_id: Uuid) -> usize {
        self.lock().streams.get(&stream_id).map_or(0, HashMap::len)
    }

    fn unsubscribe(&self, stream_id: Uuid, subscriber_id: u64) {
        let mut state = self.lock();
        if let Some(subscribers) = state.streams.get_mut(&stream_id) {
            subscribers.remove(&subscriber_id);
            if subscribers.is_empty() {
                state.streams.remove(&stream_id);
            }
        }
        debug!(stream_id = %stream_id, subscriber_id, "feed subscriber detached");
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        // Critical sections never leave the map partially updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// How long a missing session version is waited for before later versions
/// are released without it.
pub const SEQUENCE_GAP_TIMEOUT: Duration = Duration::from_millis(500);

/// Puts one subscriber's session updates back into version order.
///
/// Writers publish after their store write returns, so two writes committed
/// as v2 then v3 can reach the feed as v3 then v2. Updates are released one
/// version at a time; a later version waits for the missing one until
/// `SEQUENCE_GAP_TIMEOUT` passes (a write from another server process never
/// shows up here). Versions at or below the last released one are dropped.
#[derive(Debug, Default)]
pub struct SessionSequencer {
    next: Option<i64>,
    held: BTreeMap<i64, SessionUpdate>,
    gap_deadline: Option<Instant>,
}

impl SessionSequencer {
    /// Starts after the version the subscriber already has, if any.
    pub fn new(delivered_version: Option<i64>) -> Self {
        Self { next: delivered_version.map(|version| version + 1), ..Self::default() }
    }

    /// Accepts an update and returns those now deliverable, in order.
    pub fn push(&mut self, update: SessionUpdate, now: Instant) -> Vec<SessionUpdate> {
        let Some(version) = update.stream.as_ref().map(|session| session.version) else {
            return vec![update];
        };

        let mut ready = Vec::new();
        match self.next {
            Some(next) if version < next => {}
            Some(next) if version > next => {
                self.held.insert(version, update);
                self.gap_deadline.get_or_insert(now + SEQUENCE_GAP_TIMEOUT);
            }
            _ => {
                self.next = Some(version + 1);
                ready.push(update);
                self.release_consecutive(&mut ready, now);
            }
        }
        ready
    }

    /// When the oldest open gap gives up, if one is open.
    pub fn gap_deadline(&self) -> Option<Instant> {
        self.gap_deadline
    }

    /// Skips to the oldest held version and releases the run that follows it.
    pub fn flush_gap(&mut self, now: Instant) -> Vec<SessionUpdate> {
        let Some((&first, _)) = self.held.iter().next() else {
            self.gap_deadline = None;
            return Vec::new();
        };
        debug!(skipped_to = first, "session version gap timed out");
        self.next = Some(first);
        let mut ready = Vec::new();
        self.release_consecutive(&mut ready, now);
        ready
    }

    fn release_consecutive(&mut self, ready: &mut Vec<SessionUpdate>, now: Instant) {
        while let Some(next) = self.next {
            let Some(update) = self.held.remove(&next) else {
                break;
            };
            ready.push(update);
            self.next = Some(next + 1);
        }
        self.gap_deadline =
            if self.held.is_empty() { None } else { Some(now + SEQUENCE_GAP_TIMEOUT) };
    }
}

/// Resolves at `deadline`, or never when there is none.
pub async fn gap_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A registered listener: the event receiver plus the handle that detaches it.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<StreamEvent>,
    disposer: Disposer,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    pub fn stream_id(&self) -> Uuid {
        self.disposer.stream_id
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<StreamEvent>, Disposer) {
        (self.receiver, self.disposer)
    }
}

/// Detaches a listener from the feed. Disposing twice is a no-op, and
/// dropping the disposer disposes it.
pub struct Disposer {
    feed: Option<ChangeFeed>,
    stream_id: Uuid,
    subscriber_id: u64,
    task: Option<JoinHandle<()>>,
}

impl Disposer {
    /// Ties a forwarding task to this disposer so disposing also stops it.
    pub(crate) fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    pub fn dispose(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.unsubscribe(self.stream_id, self.subscriber_id);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.feed.is_none()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.dispose();
    }
}
