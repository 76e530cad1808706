// Shared handle for the stream coordination operations.
//
// Lifecycle, presence and chat operations are implemented as `impl StreamHub`
// blocks in their own modules; this module holds the state they share and the
// session watcher.

use chrono::{DateTime, Utc};
use scrolllive_common::types::SessionUpdate;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    config::StreamSettings,
    error::ServiceError,
    feed::{gap_elapsed, ChangeFeed, Disposer, SessionSequencer, StreamEvent},
    media::{rooms::RoomService, token::MediaTokenIssuer},
    store::{Mutation, StreamStore},
};

#[derive(Clone)]
pub struct StreamHub {
    pub(crate) store: StreamStore,
    pub(crate) rooms: RoomService,
    pub(crate) media_tokens: MediaTokenIssuer,
    pub(crate) feed: ChangeFeed,
    pub(crate) settings: StreamSettings,
    /// Media server URL handed to clients alongside their tokens.
    pub(crate) media_ws_url: String,
}

impl StreamHub {
    pub fn new(
        store: StreamStore,
        rooms: RoomService,
        media_tokens: MediaTokenIssuer,
        settings: StreamSettings,
        media_ws_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            rooms,
            media_tokens,
            feed: ChangeFeed::default(),
            settings,
            media_ws_url: media_ws_url.into(),
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub(crate) fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_duration(self.settings.lease_ttl)
    }

    /// Pushes the post-write session to watchers when the write changed it.
    pub(crate) fn publish(&self, mutation: &Mutation) {
        if mutation.changed {
            self.feed.publish_session(&mutation.session);
        }
    }

    /// Calls `handler` with the current session state, then once per later
    /// write until the returned disposer is disposed or dropped.
    ///
    /// A missing stream yields an empty snapshot. Updates are delivered in
    /// version order; ones older than the last delivered are skipped.
    pub async fn watch_session<F>(
        &self,
        stream_id: Uuid,
        mut handler: F,
    ) -> Result<Disposer, ServiceError>
    where
        F: FnMut(SessionUpdate) + Send + 'static,
    {
        let subscription = self.feed.subscribe(stream_id);
        let snapshot = self.store.get_stream(stream_id).await?;
        let delivered = snapshot.as_ref().map(|session| session.version);
        let mut sequencer = SessionSequencer::new(delivered);
        handler(SessionUpdate::from_session(snapshot));

        let (mut receiver, disposer) = subscription.into_parts();
        let task = tokio::spawn(async move {
            loop {
                let ready = tokio::select! {
                    event = receiver.recv() => match event {
                        Some(StreamEvent::Session(update)) => sequencer.push(update, Instant::now()),
                        Some(StreamEvent::Chat(_)) => continue,
                        None => break,
                    },
                    _ = gap_elapsed(sequencer.gap_deadline()) => sequencer.flush_gap(Instant::now()),
                };
                for update in ready {
                    handler(update);
                }
            }
        });

        Ok(disposer.with_task(task))
    }
}

pub(crate) fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[cfg(test)]
impl StreamHub {
    pub(crate) fn for_tests() -> Self {
        Self::for_tests_with(StreamSettings::default())
    }

    pub(crate) fn for_tests_with(settings: StreamSettings) -> Self {
        use crate::media::token::tests::{TEST_API_KEY, TEST_API_SECRET};

        let media_tokens = MediaTokenIssuer::new(TEST_API_KEY, TEST_API_SECRET)
            .expect("test media issuer should initialize");
        Self::new(
            StreamStore::memory(),
            RoomService::memory(),
            media_tokens,
            settings,
            "ws://media.test",
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use scrolllive_common::types::SessionUpdate;
    use uuid::Uuid;

    use super::StreamHub;
    use crate::auth::middleware::AuthenticatedUser;

    fn user(id: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.to_string(),
            display_name: id.to_uppercase(),
            avatar_url: None,
        }
    }

    type Updates = Arc<Mutex<Vec<SessionUpdate>>>;

    fn collector() -> (Updates, impl FnMut(SessionUpdate) + Send + 'static) {
        let updates: Updates = Arc::default();
        let sink = Arc::clone(&updates);
        (updates, move |update| sink.lock().expect("collector lock").push(update))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn watching_a_missing_stream_yields_an_empty_snapshot() {
        let hub = StreamHub::for_tests();
        let (updates, handler) = collector();

        let _disposer =
            hub.watch_session(Uuid::new_v4(), handler).await.expect("watch should start");

        let updates = updates.lock().expect("collector lock");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], SessionUpdate::default());
    }

    #[tokio::test]
    async fn watcher_sees_snapshot_then_each_write_in_order() {
        let hub = StreamHub::for_tests();
        let owner = user("owner");
        let created = hub.create_stream(&owner, "Demo", None).await.expect("create should work");
        let (updates, handler) = collector();
        let _disposer =
            hub.watch_session(created.stream_id, handler).await.expect("watch should start");

        hub.join_stream(created.stream_id, &user("u1")).await.expect("u1 join");
        hub.join_stream(created.stream_id, &user("u2")).await.expect("u2 join");
        hub.leave_stream(created.stream_id, "u1").await.expect("u1 leave");
        settle().await;

        let counts: Vec<u32> = updates
            .lock()
            .expect("collector lock")
            .iter()
            .map(|update| update.viewer_count)
            .collect();
        assert_eq!(counts, vec![0, 1, 2, 1]);
    }

    #[tokio::test]
    async fn disposed_watcher_stops_receiving_and_double_dispose_is_harmless() {
        let hub = StreamHub::for_tests();
        let created =
            hub.create_stream(&user("owner"), "Demo", None).await.expect("create should work");
        let (updates, handler) = collector();
        let mut disposer =
            hub.watch_session(created.stream_id, handler).await.expect("watch should start");

        disposer.dispose();
        disposer.dispose();
        assert_eq!(hub.feed().subscriber_count(created.stream_id), 0);

        hub.join_stream(created.stream_id, &user("u1")).await.expect("u1 join");
        settle().await;
        assert_eq!(updates.lock().expect("collector lock").len(), 1);
    }

    #[tokio::test]
    async fn watcher_receives_versions_published_out_of_order() {
        let hub = StreamHub::for_tests();
        let created =
            hub.create_stream(&user("owner"), "Demo", None).await.expect("create should work");
        let (updates, handler) = collector();
        let _disposer =
            hub.watch_session(created.stream_id, handler).await.expect("watch should start");

        let base = created.session.version;
        let mut second = created.session.clone();
        second.version = base + 2;
        second.viewer_count = 2;
        let mut first = created.session.clone();
        first.version = base + 1;
        first.viewer_count = 1;

        hub.feed().publish_session(&second);
        hub.feed().publish_session(&first);
        settle().await;

        let versions: Vec<i64> = updates
            .lock()
            .expect("collector lock")
            .iter()
            .filter_map(|update| update.stream.as_ref().map(|session| session.version))
            .collect();
        assert_eq!(versions, vec![base, base + 1, base + 2]);
    }

    #[tokio::test]
    async fn watcher_moves_past_a_version_that_never_arrives() {
        let hub = StreamHub::for_tests();
        let created =
            hub.create_stream(&user("owner"), "Demo", None).await.expect("create should work");
        let (updates, handler) = collector();
        let _disposer =
            hub.watch_session(created.stream_id, handler).await.expect("watch should start");

        let base = created.session.version;
        let mut later = created.session.clone();
        later.version = base + 2;
        hub.feed().publish_session(&later);
        settle().await;
        assert_eq!(updates.lock().expect("collector lock").len(), 1);

        tokio::time::sleep(crate::feed::SEQUENCE_GAP_TIMEOUT + Duration::from_millis(50)).await;
        let updates = updates.lock().expect("collector lock");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].stream.as_ref().map(|session| session.version), Some(base + 2));
    }
}
