// Per-stream chat log.

use std::collections::HashSet;

use chrono::Utc;
use scrolllive_common::{types::ChatMessage, validation::normalize_chat_message};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::middleware::AuthenticatedUser,
    error::ServiceError,
    feed::{Disposer, StreamEvent},
    hub::StreamHub,
    metrics,
    store::NewChatMessage,
};

const AVATAR_SERVICE_URL: &str = "https://ui-avatars.com/api/";

impl StreamHub {
    /// Appends a message to the stream's chat. Ended streams still accept chat.
    pub async fn send_chat(
        &self,
        stream_id: Uuid,
        author: &AuthenticatedUser,
        text: &str,
    ) -> Result<ChatMessage, ServiceError> {
        let message = normalize_chat_message(text)?;
        let user_avatar = author
            .avatar_url
            .clone()
            .filter(|avatar| !avatar.trim().is_empty())
            .unwrap_or_else(|| default_avatar_url(&author.display_name));

        let stored = self
            .store
            .append_chat(NewChatMessage {
                stream_id,
                user_id: author.user_id.clone(),
                user_name: author.display_name.clone(),
                user_avatar,
                message,
                sent_at: Utc::now(),
            })
            .await?;

        debug!(stream_id = %stream_id, user_id = %author.user_id, message_id = %stored.id, "chat message stored");
        metrics::record_chat_message();
        self.feed.publish_chat(&stored);
        Ok(stored)
    }

    pub async fn chat_history(&self, stream_id: Uuid) -> Result<Vec<ChatMessage>, ServiceError> {
        self.store.list_chat(stream_id).await
    }

    /// Calls `handler` with the full ordered history now and again after
    /// every new message.
    pub async fn watch_chat<F>(&self, stream_id: Uuid, mut handler: F) -> Result<Disposer, ServiceError>
    where
        F: FnMut(&[ChatMessage]) + Send + 'static,
    {
        let subscription = self.feed.subscribe(stream_id);
        let mut messages = self.store.list_chat(stream_id).await?;
        let mut seen: HashSet<Uuid> = messages.iter().map(|message| message.id).collect();
        handler(&messages);

        let (mut receiver, disposer) = subscription.into_parts();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let StreamEvent::Chat(message) = event else {
                    continue;
                };
                if !seen.insert(message.id) {
                    continue;
                }

                // Equal timestamps keep arrival order.
                let at = messages
                    .partition_point(|existing| existing.timestamp <= message.timestamp);
                messages.insert(at, message);
                handler(&messages);
            }
        });

        Ok(disposer.with_task(task))
    }
}

fn default_avatar_url(name: &str) -> String {
    let name = if name.trim().is_empty() { "User" } else { name };
    Url::parse_with_params(
        AVATAR_SERVICE_URL,
        [("name", name), ("background", "3F8AE0"), ("color", "fff")],
    )
    .map(String::from)
    .unwrap_or_default()
}
