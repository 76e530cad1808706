use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use scrolllive_common::types::{ChatMessage, Participant, ParticipantRole, StreamSession};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CleanupJob, DetailsChange, Mutation, NewChatMessage, NewStream, ParticipantProfile,
};
use crate::error::ServiceError;

#[derive(Default)]
pub struct MemoryStore {
    sessions: HashMap<Uuid, MemorySession>,
    chat: HashMap<Uuid, Vec<ChatMessage>>,
    cleanup_jobs: HashMap<Uuid, MemoryCleanupJob>,
}

struct MemorySession {
    session: StreamSession,
    owner_lease_expires_at: DateTime<Utc>,
}

struct MemoryCleanupJob {
    due_at: DateTime<Utc>,
    attempts: u32,
    locked_until: Option<DateTime<Utc>>,
}

type Shared = Arc<RwLock<MemoryStore>>;

/// Re-derives the viewer count and stamps the write.
fn touch(session: &mut StreamSession, now: DateTime<Utc>) {
    session.viewer_count = session.online_participants() as u32;
    session.version += 1;
    session.last_activity_at = now;
}

fn session_mut<'a>(
    state: &'a mut MemoryStore,
    stream_id: Uuid,
) -> Result<&'a mut StreamSession, ServiceError> {
    state
        .sessions
        .get_mut(&stream_id)
        .map(|entry| &mut entry.session)
        .ok_or(ServiceError::NotFound("stream"))
}

pub async fn create_stream(
    store: &Shared,
    new: NewStream,
    cleanup_due_at: DateTime<Utc>,
) -> Result<StreamSession, ServiceError> {
    let mut state = store.write().await;

    let session = StreamSession {
        id: new.id,
        room_name: new.room_name,
        title: new.title,
        category: new.category,
        created_by: new.created_by,
        created_by_name: new.created_by_name,
        created_by_avatar: new.created_by_avatar,
        is_live: true,
        viewer_count: 0,
        participants: Vec::new(),
        created_at: new.created_at,
        ended_at: None,
        last_activity_at: new.created_at,
        version: 1,
    };

    state.sessions.insert(
        new.id,
        MemorySession {
            session: session.clone(),
            owner_lease_expires_at: new.owner_lease_expires_at,
        },
    );
    state.cleanup_jobs.insert(
        new.id,
        MemoryCleanupJob { due_at: cleanup_due_at, attempts: 0, locked_until: None },
    );

    Ok(session)
}

pub async fn get_stream(
    store: &Shared,
    stream_id: Uuid,
) -> Result<Option<StreamSession>, ServiceError> {
    let state = store.read().await;
    Ok(state.sessions.get(&stream_id).map(|entry| entry.session.clone()))
}

pub async fn list_live_streams(
    store: &Shared,
    limit: usize,
) -> Result<Vec<StreamSession>, ServiceError> {
    let state = store.read().await;
    let mut live: Vec<StreamSession> = state
        .sessions
        .values()
        .filter(|entry| entry.session.is_live)
        .map(|entry| entry.session.clone())
        .collect();
    live.sort_by(|left, right| {
        right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
    });
    live.truncate(limit);
    Ok(live)
}

pub async fn update_details(
    store: &Shared,
    stream_id: Uuid,
    expected_version: Option<i64>,
    change: DetailsChange,
    now: DateTime<Utc>,
) -> Result<StreamSession, ServiceError> {
    let mut state = store.write().await;
    let session = session_mut(&mut state, stream_id)?;

    if expected_version.is_some_and(|expected| expected != session.version) {
        return Err(ServiceError::Conflict);
    }
    if !session.is_live {
        return Err(ServiceError::FailedPrecondition("stream has ended"));
    }

    if let Some(title) = change.title {
        session.title = title;
    }
    if let Some(category) = change.category {
        session.category = category;
    }
    touch(session, now);

    Ok(session.clone())
}

pub async fn end_stream(
    store: &Shared,
    stream_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, ServiceError> {
    let mut state = store.write().await;
    state.cleanup_jobs.remove(&stream_id);

    let Some(entry) = state.sessions.get_mut(&stream_id) else {
        return Ok(None);
    };
    let session = &mut entry.session;
    if !session.is_live {
        return Ok(Some(Mutation { session: session.clone(), changed: false }));
    }

    session.is_live = false;
    session.ended_at = Some(now);
    touch(session, now);

    Ok(Some(Mutation { session: session.clone(), changed: true }))
}

pub async fn end_if_idle(
    store: &Shared,
    stream_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, ServiceError> {
    let mut state = store.write().await;
    let Some(entry) = state.sessions.get_mut(&stream_id) else {
        return Ok(None);
    };
    let session = &mut entry.session;
    if !session.is_live || session.viewer_count > 0 {
        return Ok(Some(Mutation { session: session.clone(), changed: false }));
    }

    session.is_live = false;
    session.ended_at = Some(now);
    touch(session, now);
    let ended = session.clone();
    state.cleanup_jobs.remove(&stream_id);

    Ok(Some(Mutation { session: ended, changed: true }))
}

pub async fn upsert_participant(
    store: &Shared,
    stream_id: Uuid,
    profile: ParticipantProfile,
    role: ParticipantRole,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Mutation, ServiceError> {
    let mut state = store.write().await;
    let session = session_mut(&mut state, stream_id)?;
    if !session.is_live {
        return Err(ServiceError::FailedPrecondition("stream is not live"));
    }

    match session.participants.iter_mut().find(|p| p.user_id == profile.user_id) {
        Some(existing) => {
            existing.user_name = profile.user_name;
            existing.user_avatar = profile.user_avatar;
            existing.is_online = true;
            existing.last_seen = Some(now);
            existing.lease_expires_at = Some(lease_expires_at);
        }
        None => session.participants.push(Participant {
            user_id: profile.user_id,
            user_name: profile.user_name,
            user_avatar: profile.user_avatar,
            role,
            joined_at: now,
            is_online: true,
            last_seen: Some(now),
            lease_expires_at: Some(lease_expires_at),
        }),
    }
    touch(session, now);

    Ok(Mutation { session: session.clone(), changed: true })
}

pub async fn remove_participant(
    store: &Shared,
    stream_id: Uuid,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, ServiceError> {
    let mut state = store.write().await;
    let Some(entry) = state.sessions.get_mut(&stream_id) else {
        return Ok(None);
    };
    let session = &mut entry.session;

    let Some(index) = session.participants.iter().position(|p| p.user_id == user_id) else {
        return Ok(Some(Mutation { session: session.clone(), changed: false }));
    };
    session.participants.remove(index);
    touch(session, now);

    Ok(Some(Mutation { session: session.clone(), changed: true }))
}

pub async fn set_participant_online(
    store: &Shared,
    stream_id: Uuid,
    user_id: &str,
    is_online: bool,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Mutation, ServiceError> {
    let mut state = store.write().await;
    let session = session_mut(&mut state, stream_id)?;
    if is_online && !session.is_live {
        return Err(ServiceError::FailedPrecondition("stream is not live"));
    }

    let participant = session
        .participants
        .iter_mut()
        .find(|p| p.user_id == user_id)
        .ok_or(ServiceError::NotFound("participant"))?;
    participant.is_online = is_online;
    participant.last_seen = Some(now);
    participant.lease_expires_at = is_online.then_some(lease_expires_at);
    touch(session, now);

    Ok(Mutation { session: session.clone(), changed: true })
}

pub async fn set_participant_role(
    store: &Shared,
    stream_id: Uuid,
    user_id: &str,
    role: ParticipantRole,
    now: DateTime<Utc>,
) -> Result<Mutation, ServiceError> {
    let mut state = store.write().await;
    let session = session_mut(&mut state, stream_id)?;

    let participant = session
        .participants
        .iter_mut()
        .find(|p| p.user_id == user_id)
        .ok_or(ServiceError::NotFound("participant"))?;
    if participant.role == role {
        return Ok(Mutation { session: session.clone(), changed: false });
    }
    participant.role = role;
    touch(session, now);

    Ok(Mutation { session: session.clone(), changed: true })
}

pub async fn renew_owner_lease(
    store: &Shared,
    stream_id: Uuid,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let mut state = store.write().await;
    match state.sessions.get_mut(&stream_id) {
        Some(entry) if entry.session.is_live => {
            entry.owner_lease_expires_at = lease_expires_at;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Extends the lease of a participant who is already online. Does not count
/// as a session write.
pub async fn renew_participant_lease(
    store: &Shared,
    stream_id: Uuid,
    user_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let mut state = store.write().await;
    let Some(entry) = state.sessions.get_mut(&stream_id) else {
        return Ok(false);
    };
    if !entry.session.is_live {
        return Ok(false);
    }

    match entry
        .session
        .participants
        .iter_mut()
        .find(|participant| participant.user_id == user_id && participant.is_online)
    {
        Some(participant) => {
            participant.last_seen = Some(now);
            participant.lease_expires_at = Some(lease_expires_at);
            Ok(true)
        }
        None => Ok(false),
    }
}

pub async fn expire_participant_leases(
    store: &Shared,
    now: DateTime<Utc>,
) -> Result<Vec<StreamSession>, ServiceError> {
    let mut state = store.write().await;
    let mut changed = Vec::new();

    for entry in state.sessions.values_mut() {
        let session = &mut entry.session;
        if !session.is_live {
            continue;
        }
        let mut expired_any = false;
        for participant in session.participants.iter_mut() {
            let expired =
                participant.is_online && participant.lease_expires_at.is_some_and(|at| at <= now);
            if expired {
                participant.is_online = false;
                participant.last_seen = Some(now);
                participant.lease_expires_at = None;
                expired_any = true;
            }
        }
        if expired_any {
            touch(session, now);
            changed.push(session.clone());
        }
    }

    Ok(changed)
}

pub async fn streams_with_expired_owner_lease(
    store: &Shared,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, ServiceError> {
    let state = store.read().await;
    Ok(state
        .sessions
        .values()
        .filter(|entry| entry.session.is_live && entry.owner_lease_expires_at <= now)
        .map(|entry| entry.session.id)
        .collect())
}

pub async fn append_chat(
    store: &Shared,
    message: NewChatMessage,
) -> Result<ChatMessage, ServiceError> {
    let mut state = store.write().await;
    if !state.sessions.contains_key(&message.stream_id) {
        return Err(ServiceError::NotFound("stream"));
    }

    let log = state.chat.entry(message.stream_id).or_default();
    let timestamp = log
        .last()
        .map(|last| last.timestamp.max(message.sent_at))
        .unwrap_or(message.sent_at);
    let stored = ChatMessage {
        id: Uuid::new_v4(),
        stream_id: message.stream_id,
        user_id: message.user_id,
        user_name: message.user_name,
        user_avatar: message.user_avatar,
        message: message.message,
        timestamp,
    };
    log.push(stored.clone());

    Ok(stored)
}

pub async fn list_chat(store: &Shared, stream_id: Uuid) -> Result<Vec<ChatMessage>, ServiceError> {
    let state = store.read().await;
    Ok(state.chat.get(&stream_id).cloned().unwrap_or_default())
}

pub async fn claim_due_cleanups(
    store: &Shared,
    now: DateTime<Utc>,
    lock_for: Duration,
    limit: usize,
) -> Result<Vec<CleanupJob>, ServiceError> {
    let mut state = store.write().await;

    let mut due: Vec<(Uuid, DateTime<Utc>)> = state
        .cleanup_jobs
        .iter()
        .filter(|(_, job)| job.due_at <= now && job.locked_until.map_or(true, |until| until <= now))
        .map(|(stream_id, job)| (*stream_id, job.due_at))
        .collect();
    due.sort_by_key(|(_, due_at)| *due_at);
    due.truncate(limit);

    let mut claimed = Vec::with_capacity(due.len());
    for (stream_id, due_at) in due {
        if let Some(job) = state.cleanup_jobs.get_mut(&stream_id) {
            job.attempts += 1;
            job.locked_until = Some(now + lock_for);
            claimed.push(CleanupJob { stream_id, due_at, attempts: job.attempts });
        }
    }

    Ok(claimed)
}

pub async fn complete_cleanup(store: &Shared, stream_id: Uuid) -> Result<(), ServiceError> {
    store.write().await.cleanup_jobs.remove(&stream_id);
    Ok(())
}

pub async fn reschedule_cleanup(
    store: &Shared,
    stream_id: Uuid,
    due_at: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if let Some(job) = store.write().await.cleanup_jobs.get_mut(&stream_id) {
        job.due_at = due_at;
        job.locked_until = None;
    }
    Ok(())
}
