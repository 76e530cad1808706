// Stream lifecycle: creation, teardown, listing and the abandoned-stream check.

use chrono::{DateTime, Utc};
use scrolllive_common::{
    types::StreamSession,
    validation::{normalize_category, normalize_title},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::middleware::AuthenticatedUser,
    error::ServiceError,
    hub::{chrono_duration, StreamHub},
    media::{rooms::RoomOptions, token::MediaGrant},
    metrics,
    store::{CleanupJob, DetailsChange, NewStream},
};

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

/// Credentials handed to the owner of a freshly started stream.
#[derive(Debug, Clone)]
pub struct CreatedStream {
    pub stream_id: Uuid,
    pub room_name: String,
    pub token: String,
    pub ws_url: String,
    pub session: StreamSession,
}

/// What a cleanup run did with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Ended,
    Skipped,
}

impl CleanupOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ended => "ended",
            Self::Skipped => "skipped",
        }
    }
}

impl StreamHub {
    pub async fn create_stream(
        &self,
        owner: &AuthenticatedUser,
        title: &str,
        category: Option<&str>,
    ) -> Result<CreatedStream, ServiceError> {
        let title = normalize_title(title)?;
        let category = normalize_category(category)?;
        let now = Utc::now();
        let room_name = room_name_for(&owner.user_id, now);

        let options = RoomOptions {
            empty_timeout: self.settings.room_empty_timeout,
            max_participants: self.settings.room_max_participants,
        };
        self.rooms
            .create_room(&room_name, options)
            .await
            .map_err(ServiceError::MediaUnavailable)?;

        let new = NewStream {
            id: Uuid::new_v4(),
            room_name: room_name.clone(),
            title,
            category,
            created_by: owner.user_id.clone(),
            created_by_name: owner.display_name.clone(),
            created_by_avatar: owner.avatar_url.clone(),
            created_at: now,
            owner_lease_expires_at: self.lease_expiry(now),
        };
        let cleanup_due_at = now + chrono_duration(self.settings.cleanup_delay);

        let session = match self.store.create_stream(new, cleanup_due_at).await {
            Ok(session) => session,
            Err(error) => {
                if let Err(delete_error) = self.rooms.delete_room(&room_name).await {
                    warn!(
                        room_name = %room_name,
                        error = ?delete_error,
                        "failed to delete media room after stream persistence failed"
                    );
                }
                return Err(error);
            }
        };

        let token = self.media_tokens.issue(
            &owner.user_id,
            &owner.display_name,
            MediaGrant::publisher(&room_name),
        )?;

        info!(
            stream_id = %session.id,
            room_name = %room_name,
            user_id = %owner.user_id,
            "stream started"
        );
        metrics::record_stream_event("started");
        self.feed.publish_session(&session);

        Ok(CreatedStream {
            stream_id: session.id,
            room_name,
            token,
            ws_url: self.media_ws_url.clone(),
            session,
        })
    }

    /// Owner-only. Deletes the media room before marking the stream ended so a
    /// failed teardown leaves the stream live and retryable.
    pub async fn end_stream(
        &self,
        stream_id: Uuid,
        caller: &AuthenticatedUser,
    ) -> Result<StreamSession, ServiceError> {
        let session =
            self.store.get_stream(stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
        if !session.is_owned_by(&caller.user_id) {
            return Err(ServiceError::PermissionDenied(
                "only the stream creator can end the stream",
            ));
        }
        if !session.is_live {
            return Ok(session);
        }

        self.finish_stream(session, "ended by owner").await
    }

    pub async fn list_live_streams(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<StreamSession>, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.store.list_live_streams(limit).await
    }

    pub async fn get_stream(&self, stream_id: Uuid) -> Result<StreamSession, ServiceError> {
        self.store.get_stream(stream_id).await?.ok_or(ServiceError::NotFound("stream"))
    }

    /// Owner-only conditional update of title and category.
    pub async fn update_stream_details(
        &self,
        stream_id: Uuid,
        caller: &AuthenticatedUser,
        expected_version: Option<i64>,
        title: Option<&str>,
        category: Option<&str>,
    ) -> Result<StreamSession, ServiceError> {
        let change = DetailsChange {
            title: title.map(normalize_title).transpose()?,
            category: category.map(|category| normalize_category(Some(category))).transpose()?,
        };

        let session = self.get_stream(stream_id).await?;
        if !session.is_owned_by(&caller.user_id) {
            return Err(ServiceError::PermissionDenied(
                "only the stream creator can update the stream",
            ));
        }

        let updated =
            self.store.update_details(stream_id, expected_version, change, Utc::now()).await?;
        info!(stream_id = %stream_id, version = updated.version, "stream details updated");
        self.feed.publish_session(&updated);
        Ok(updated)
    }

    /// Ends a stream still live with nobody watching. Safe to run repeatedly.
    ///
    /// The idle check and the end are one store write, so a viewer joining
    /// while this runs either keeps the stream live or is refused. The room is
    /// torn down only after the stream has ended.
    pub async fn run_cleanup(&self, job: &CleanupJob) -> Result<CleanupOutcome, ServiceError> {
        let Some(mutation) = self.store.end_if_idle(job.stream_id, Utc::now()).await? else {
            return Ok(CleanupOutcome::Skipped);
        };
        if !mutation.changed {
            return Ok(CleanupOutcome::Skipped);
        }

        let session = &mutation.session;
        info!(
            stream_id = %session.id,
            room_name = %session.room_name,
            reason = "no viewers after cleanup delay",
            "stream ended"
        );
        metrics::record_stream_event("ended");
        self.publish(&mutation);

        if let Err(err) = self.rooms.delete_room(&session.room_name).await {
            // The media server closes empty rooms on its own after empty_timeout.
            warn!(
                stream_id = %session.id,
                room_name = %session.room_name,
                error = %err,
                "room teardown after cleanup failed"
            );
        }
        Ok(CleanupOutcome::Ended)
    }

    /// Deletes the room, then marks the session ended and notifies watchers.
    pub(crate) async fn finish_stream(
        &self,
        session: StreamSession,
        reason: &'static str,
    ) -> Result<StreamSession, ServiceError> {
        self.rooms
            .delete_room(&session.room_name)
            .await
            .map_err(ServiceError::MediaUnavailable)?;

        let Some(mutation) = self.store.end_stream(session.id, Utc::now()).await? else {
            return Err(ServiceError::NotFound("stream"));
        };
        if mutation.changed {
            info!(
                stream_id = %session.id,
                room_name = %session.room_name,
                reason,
                "stream ended"
            );
            metrics::record_stream_event("ended");
        }
        self.publish(&mutation);
        Ok(mutation.session)
    }
}

/// `stream_{owner}_{unix millis}_{suffix}`; the suffix keeps names unique when
/// one owner starts two streams in the same millisecond.
fn room_name_for(owner_id: &str, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("stream_{owner_id}_{}_{}", now.timestamp_millis(), &suffix[..8])
}
