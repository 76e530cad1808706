// Session document store.
//
// One session record per stream plus keyed participant records, chat lines
// and cleanup jobs. Every participant write and the viewer count it implies
// are applied together: under one write lock in memory, or in one
// transaction holding the session row lock in PostgreSQL.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scrolllive_common::types::{ChatMessage, ParticipantRole, StreamSession};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ServiceError;
use memory::MemoryStore;

pub const MAX_CLEANUP_ATTEMPTS: u32 = 8;
const CLEANUP_RETRY_BASE_SECS: i64 = 30;
const CLEANUP_RETRY_MAX_SECS: i64 = 10 * 60;

#[derive(Clone)]
pub enum StreamStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryStore>>),
}

/// Fields of a freshly started stream.
#[derive(Debug, Clone)]
pub struct NewStream {
    pub id: Uuid,
    pub room_name: String,
    pub title: String,
    pub category: String,
    pub created_by: String,
    pub created_by_name: String,
    pub created_by_avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub owner_lease_expires_at: DateTime<Utc>,
}

/// Who is joining, as shown to other participants.
#[derive(Debug, Clone)]
pub struct ParticipantProfile {
    pub user_id: String,
    pub user_name: String,
    pub user_avatar: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DetailsChange {
    pub title: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub stream_id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub user_avatar: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Session state after a write, and whether the write changed anything.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub session: StreamSession,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    pub stream_id: Uuid,
    pub due_at: DateTime<Utc>,
    /// Attempts made so far, including the current claim.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupRetry {
    Rescheduled(DateTime<Utc>),
    Abandoned,
}

/// Delay before the next attempt after `attempts` failures.
pub fn cleanup_backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let secs = CLEANUP_RETRY_BASE_SECS.saturating_mul(1_i64 << exponent);
    Duration::seconds(secs.min(CLEANUP_RETRY_MAX_SECS))
}

impl StreamStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryStore::default())))
    }

    /// Persists the session and its cleanup job together.
    pub async fn create_stream(
        &self,
        new: NewStream,
        cleanup_due_at: DateTime<Utc>,
    ) -> Result<StreamSession, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::create_stream(pool, new, cleanup_due_at).await,
            Self::Memory(store) => memory::create_stream(store, new, cleanup_due_at).await,
        }
    }

    pub async fn get_stream(&self, stream_id: Uuid) -> Result<Option<StreamSession>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::get_stream(pool, stream_id).await,
            Self::Memory(store) => memory::get_stream(store, stream_id).await,
        }
    }

    /// Live sessions, newest first.
    pub async fn list_live_streams(&self, limit: usize) -> Result<Vec<StreamSession>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::list_live_streams(pool, limit).await,
            Self::Memory(store) => memory::list_live_streams(store, limit).await,
        }
    }

    /// Conditional write: fails with `Conflict` when `expected_version` is stale.
    pub async fn update_details(
        &self,
        stream_id: Uuid,
        expected_version: Option<i64>,
        change: DetailsChange,
        now: DateTime<Utc>,
    ) -> Result<StreamSession, ServiceError> {
        match self {
            Self::Postgres(pool) => {
                postgres::update_details(pool, stream_id, expected_version, change, now).await
            }
            Self::Memory(store) => {
                memory::update_details(store, stream_id, expected_version, change, now).await
            }
        }
    }

    /// Marks the stream ended and drops its cleanup job. `None` if missing.
    pub async fn end_stream(
        &self,
        stream_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Mutation>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::end_stream(pool, stream_id, now).await,
            Self::Memory(store) => memory::end_stream(store, stream_id, now).await,
        }
    }

    /// Ends the stream only if it is still live with nobody online, and drops
    /// its cleanup job when it does. `changed` reports whether it ended it.
    /// `None` if missing.
    pub async fn end_if_idle(
        &self,
        stream_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Mutation>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::end_if_idle(pool, stream_id, now).await,
            Self::Memory(store) => memory::end_if_idle(store, stream_id, now).await,
        }
    }

    /// Adds the participant or brings an existing record back online.
    /// An existing record keeps its role and join time.
    pub async fn upsert_participant(
        &self,
        stream_id: Uuid,
        profile: ParticipantProfile,
        role: ParticipantRole,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Mutation, ServiceError> {
        match self {
            Self::Postgres(pool) => {
                postgres::upsert_participant(pool, stream_id, profile, role, now, lease_expires_at)
                    .await
            }
            Self::Memory(store) => {
                memory::upsert_participant(store, stream_id, profile, role, now, lease_expires_at)
                    .await
            }
        }
    }

    /// `None` if the stream is missing; `changed = false` if the user was not present.
    pub async fn remove_participant(
        &self,
        stream_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Mutation>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::remove_participant(pool, stream_id, user_id, now).await,
            Self::Memory(store) => memory::remove_participant(store, stream_id, user_id, now).await,
        }
    }

    /// `lease_expires_at` is applied when going online and cleared when going offline.
    pub async fn set_participant_online(
        &self,
        stream_id: Uuid,
        user_id: &str,
        is_online: bool,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Mutation, ServiceError> {
        match self {
            Self::Postgres(pool) => {
                postgres::set_participant_online(
                    pool,
                    stream_id,
                    user_id,
                    is_online,
                    now,
                    lease_expires_at,
                )
                .await
            }
            Self::Memory(store) => {
                memory::set_participant_online(
                    store,
                    stream_id,
                    user_id,
                    is_online,
                    now,
                    lease_expires_at,
                )
                .await
            }
        }
    }

    pub async fn set_participant_role(
        &self,
        stream_id: Uuid,
        user_id: &str,
        role: ParticipantRole,
        now: DateTime<Utc>,
    ) -> Result<Mutation, ServiceError> {
        match self {
            Self::Postgres(pool) => {
                postgres::set_participant_role(pool, stream_id, user_id, role, now).await
            }
            Self::Memory(store) => {
                memory::set_participant_role(store, stream_id, user_id, role, now).await
            }
        }
    }

    /// Returns false when the stream is missing or no longer live.
    pub async fn renew_owner_lease(
        &self,
        stream_id: Uuid,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        match self {
            Self::Postgres(pool) => {
                postgres::renew_owner_lease(pool, stream_id, lease_expires_at).await
            }
            Self::Memory(store) => memory::renew_owner_lease(store, stream_id, lease_expires_at).await,
        }
    }

    /// Extends an online participant's lease without a session write.
    /// Returns false when the participant is missing or offline, or the
    /// stream has ended.
    pub async fn renew_participant_lease(
        &self,
        stream_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        match self {
            Self::Postgres(pool) => {
                postgres::renew_participant_lease(pool, stream_id, user_id, now, lease_expires_at)
                    .await
            }
            Self::Memory(store) => {
                memory::renew_participant_lease(store, stream_id, user_id, now, lease_expires_at)
                    .await
            }
        }
    }

    /// Marks every participant whose lease has lapsed offline.
    /// Returns the sessions that changed.
    pub async fn expire_participant_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StreamSession>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::expire_participant_leases(pool, now).await,
            Self::Memory(store) => memory::expire_participant_leases(store, now).await,
        }
    }

    pub async fn streams_with_expired_owner_lease(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::streams_with_expired_owner_lease(pool, now).await,
            Self::Memory(store) => memory::streams_with_expired_owner_lease(store, now).await,
        }
    }

    /// Appends a chat line. The stored timestamp never precedes the stream's
    /// latest message.
    pub async fn append_chat(&self, message: NewChatMessage) -> Result<ChatMessage, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::append_chat(pool, message).await,
            Self::Memory(store) => memory::append_chat(store, message).await,
        }
    }

    /// Ascending by timestamp, ties in insertion order.
    pub async fn list_chat(&self, stream_id: Uuid) -> Result<Vec<ChatMessage>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::list_chat(pool, stream_id).await,
            Self::Memory(store) => memory::list_chat(store, stream_id).await,
        }
    }

    pub async fn claim_due_cleanups(
        &self,
        now: DateTime<Utc>,
        lock_for: Duration,
        limit: usize,
    ) -> Result<Vec<CleanupJob>, ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::claim_due_cleanups(pool, now, lock_for, limit).await,
            Self::Memory(store) => memory::claim_due_cleanups(store, now, lock_for, limit).await,
        }
    }

    pub async fn complete_cleanup(&self, stream_id: Uuid) -> Result<(), ServiceError> {
        match self {
            Self::Postgres(pool) => postgres::complete_cleanup(pool, stream_id).await,
            Self::Memory(store) => memory::complete_cleanup(store, stream_id).await,
        }
    }

    /// Reschedules a failed job with backoff, or drops it after
    /// [`MAX_CLEANUP_ATTEMPTS`].
    pub async fn retry_cleanup(
        &self,
        job: &CleanupJob,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<CleanupRetry, ServiceError> {
        if job.attempts >= MAX_CLEANUP_ATTEMPTS {
            self.complete_cleanup(job.stream_id).await?;
            return Ok(CleanupRetry::Abandoned);
        }

        let next_due_at = now + cleanup_backoff(job.attempts);
        match self {
            Self::Postgres(pool) => {
                postgres::reschedule_cleanup(pool, job.stream_id, next_due_at, error).await?
            }
            Self::Memory(store) => {
                memory::reschedule_cleanup(store, job.stream_id, next_due_at).await?
            }
        }
        Ok(CleanupRetry::Rescheduled(next_due_at))
    }
}
