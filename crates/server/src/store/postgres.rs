use std::collections::HashMap;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use scrolllive_common::types::{ChatMessage, Participant, ParticipantRole, StreamSession};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    CleanupJob, DetailsChange, Mutation, NewChatMessage, NewStream, ParticipantProfile,
};
use crate::error::ServiceError;

#[derive(sqlx::FromRow)]
struct StreamRow {
    id: Uuid,
    room_name: String,
    title: String,
    category: String,
    created_by: String,
    created_by_name: String,
    created_by_avatar: Option<String>,
    is_live: bool,
    viewer_count: i32,
    version: i64,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
}

impl StreamRow {
    fn into_session(self, participants: Vec<Participant>) -> StreamSession {
        StreamSession {
            id: self.id,
            room_name: self.room_name,
            title: self.title,
            category: self.category,
            created_by: self.created_by,
            created_by_name: self.created_by_name,
            created_by_avatar: self.created_by_avatar,
            is_live: self.is_live,
            viewer_count: u32::try_from(self.viewer_count).unwrap_or(0),
            participants,
            created_at: self.created_at,
            ended_at: self.ended_at,
            last_activity_at: self.last_activity_at,
            version: self.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    stream_id: Uuid,
    user_id: String,
    user_name: String,
    user_avatar: Option<String>,
    role: String,
    joined_at: DateTime<Utc>,
    is_online: bool,
    last_seen: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = ServiceError;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        let role = ParticipantRole::parse(&row.role)
            .ok_or_else(|| anyhow!("unknown participant role '{}'", row.role))?;
        Ok(Participant {
            user_id: row.user_id,
            user_name: row.user_name,
            user_avatar: row.user_avatar,
            role,
            joined_at: row.joined_at,
            is_online: row.is_online,
            last_seen: row.last_seen,
            lease_expires_at: row.lease_expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: Uuid,
    stream_id: Uuid,
    user_id: String,
    user_name: String,
    user_avatar: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl From<ChatRow> for ChatMessage {
    fn from(row: ChatRow) -> Self {
        ChatMessage {
            id: row.id,
            stream_id: row.stream_id,
            user_id: row.user_id,
            user_name: row.user_name,
            user_avatar: row.user_avatar,
            message: row.message,
            timestamp: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CleanupRow {
    stream_id: Uuid,
    due_at: DateTime<Utc>,
    attempts: i32,
}

async fn lock_stream(
    conn: &mut PgConnection,
    stream_id: Uuid,
) -> Result<Option<StreamRow>, ServiceError> {
    let row = sqlx::query_as::<_, StreamRow>(
        r#"
        SELECT id, room_name, title, category, created_by, created_by_name,
               created_by_avatar, is_live, viewer_count, version, created_at,
               ended_at, last_activity_at
        FROM live_streams
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(stream_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row)
}

/// Recomputes the viewer count from participant rows and bumps the version.
/// Callers hold the session row lock.
async fn touch(
    conn: &mut PgConnection,
    stream_id: Uuid,
    now: DateTime<Utc>,
) -> Result<StreamRow, ServiceError> {
    let row = sqlx::query_as::<_, StreamRow>(
        r#"
        UPDATE live_streams
        SET viewer_count = (
                SELECT count(*)::int
                FROM stream_participants
                WHERE stream_id = $1 AND is_online
            ),
            version = version + 1,
            last_activity_at = $2
        WHERE id = $1
        RETURNING id, room_name, title, category, created_by, created_by_name,
                  created_by_avatar, is_live, viewer_count, version, created_at,
                  ended_at, last_activity_at
        "#,
    )
    .bind(stream_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

async fn participants_for(
    conn: &mut PgConnection,
    stream_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<Participant>>, ServiceError> {
    let rows = sqlx::query_as::<_, ParticipantRow>(
        r#"
        SELECT stream_id, user_id, user_name, user_avatar, role, joined_at,
               is_online, last_seen, lease_expires_at
        FROM stream_participants
        WHERE stream_id = ANY($1)
        ORDER BY joined_at ASC, seq ASC
        "#,
    )
    .bind(stream_ids.to_vec())
    .fetch_all(&mut *conn)
    .await?;

    let mut grouped: HashMap<Uuid, Vec<Participant>> = HashMap::new();
    for row in rows {
        let stream_id = row.stream_id;
        grouped.entry(stream_id).or_default().push(Participant::try_from(row)?);
    }
    Ok(grouped)
}

async fn with_participants(
    conn: &mut PgConnection,
    row: StreamRow,
) -> Result<StreamSession, ServiceError> {
    let participants = participants_for(conn, &[row.id]).await?.remove(&row.id).unwrap_or_default();
    Ok(row.into_session(participants))
}

pub async fn create_stream(
    pool: &PgPool,
    new: NewStream,
    cleanup_due_at: DateTime<Utc>,
) -> Result<StreamSession, ServiceError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, StreamRow>(
        r#"
        INSERT INTO live_streams (
            id, room_name, title, category, created_by, created_by_name,
            created_by_avatar, is_live, viewer_count, version,
            owner_lease_expires_at, created_at, last_activity_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, 0, 1, $8, $9, $9)
        RETURNING id, room_name, title, category, created_by, created_by_name,
                  created_by_avatar, is_live, viewer_count, version, created_at,
                  ended_at, last_activity_at
        "#,
    )
    .bind(new.id)
    .bind(&new.room_name)
    .bind(&new.title)
    .bind(&new.category)
    .bind(&new.created_by)
    .bind(&new.created_by_name)
    .bind(&new.created_by_avatar)
    .bind(new.owner_lease_expires_at)
    .bind(new.created_at)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO stream_cleanup_jobs (stream_id, due_at)
        VALUES ($1, $2)
        "#,
    )
    .bind(new.id)
    .bind(cleanup_due_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(row.into_session(Vec::new()))
}

pub async fn get_stream(
    pool: &PgPool,
    stream_id: Uuid,
) -> Result<Option<StreamSession>, ServiceError> {
    let mut conn = pool.acquire().await?;

    let row = sqlx::query_as::<_, StreamRow>(
        r#"
        SELECT id, room_name, title, category, created_by, created_by_name,
               created_by_avatar, is_live, viewer_count, version, created_at,
               ended_at, last_activity_at
        FROM live_streams
        WHERE id = $1
        "#,
    )
    .bind(stream_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some(with_participants(&mut conn, row).await?)),
        None => Ok(None),
    }
}

pub async fn list_live_streams(
    pool: &PgPool,
    limit: usize,
) -> Result<Vec<StreamSession>, ServiceError> {
    let mut conn = pool.acquire().await?;

    let rows = sqlx::query_as::<_, StreamRow>(
        r#"
        SELECT id, room_name, title, category, created_by, created_by_name,
               created_by_avatar, is_live, viewer_count, version, created_at,
               ended_at, last_activity_at
        FROM live_streams
        WHERE is_live
        ORDER BY created_at DESC, id DESC
        LIMIT $1
        "#,
    )
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
    let mut participants = participants_for(&mut conn, &ids).await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let list = participants.remove(&row.id).unwrap_or_default();
            row.into_session(list)
        })
        .collect())
}

pub async fn update_details(
    pool: &PgPool,
    stream_id: Uuid,
    expected_version: Option<i64>,
    change: DetailsChange,
    now: DateTime<Utc>,
) -> Result<StreamSession, ServiceError> {
    let mut tx = pool.begin().await?;

    let current = lock_stream(&mut tx, stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
    if expected_version.is_some_and(|expected| expected != current.version) {
        return Err(ServiceError::Conflict);
    }
    if !current.is_live {
        return Err(ServiceError::FailedPrecondition("stream has ended"));
    }

    sqlx::query(
        r#"
        UPDATE live_streams
        SET title = COALESCE($2, title),
            category = COALESCE($3, category)
        WHERE id = $1
        "#,
    )
    .bind(stream_id)
    .bind(change.title)
    .bind(change.category)
    .execute(&mut *tx)
    .await?;

    let row = touch(&mut tx, stream_id, now).await?;
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(session)
}

pub async fn end_stream(
    pool: &PgPool,
    stream_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, ServiceError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM stream_cleanup_jobs WHERE stream_id = $1")
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

    let Some(current) = lock_stream(&mut tx, stream_id).await? else {
        tx.commit().await?;
        return Ok(None);
    };
    if !current.is_live {
        let session = with_participants(&mut tx, current).await?;
        tx.commit().await?;
        return Ok(Some(Mutation { session, changed: false }));
    }

    sqlx::query(
        r#"
        UPDATE live_streams
        SET is_live = FALSE, ended_at = $2
        WHERE id = $1
        "#,
    )
    .bind(stream_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let row = touch(&mut tx, stream_id, now).await?;
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(Some(Mutation { session, changed: true }))
}

pub async fn end_if_idle(
    pool: &PgPool,
    stream_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, ServiceError> {
    let mut tx = pool.begin().await?;

    let Some(current) = lock_stream(&mut tx, stream_id).await? else {
        tx.commit().await?;
        return Ok(None);
    };
    if !current.is_live || current.viewer_count > 0 {
        let session = with_participants(&mut tx, current).await?;
        tx.commit().await?;
        return Ok(Some(Mutation { session, changed: false }));
    }

    sqlx::query("UPDATE live_streams SET is_live = FALSE, ended_at = $2 WHERE id = $1")
        .bind(stream_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM stream_cleanup_jobs WHERE stream_id = $1")
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

    let row = touch(&mut tx, stream_id, now).await?;
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(Some(Mutation { session, changed: true }))
}

pub async fn upsert_participant(
    pool: &PgPool,
    stream_id: Uuid,
    profile: ParticipantProfile,
    role: ParticipantRole,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Mutation, ServiceError> {
    let mut tx = pool.begin().await?;

    let current = lock_stream(&mut tx, stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
    if !current.is_live {
        return Err(ServiceError::FailedPrecondition("stream is not live"));
    }

    sqlx::query(
        r#"
        INSERT INTO stream_participants (
            stream_id, user_id, user_name, user_avatar, role, joined_at,
            is_online, last_seen, lease_expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, $6, $7)
        ON CONFLICT (stream_id, user_id) DO UPDATE
        SET user_name = EXCLUDED.user_name,
            user_avatar = EXCLUDED.user_avatar,
            is_online = TRUE,
            last_seen = EXCLUDED.last_seen,
            lease_expires_at = EXCLUDED.lease_expires_at
        "#,
    )
    .bind(stream_id)
    .bind(&profile.user_id)
    .bind(&profile.user_name)
    .bind(&profile.user_avatar)
    .bind(role.as_str())
    .bind(now)
    .bind(lease_expires_at)
    .execute(&mut *tx)
    .await?;

    let row = touch(&mut tx, stream_id, now).await?;
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(Mutation { session, changed: true })
}

pub async fn remove_participant(
    pool: &PgPool,
    stream_id: Uuid,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Mutation>, ServiceError> {
    let mut tx = pool.begin().await?;

    let Some(current) = lock_stream(&mut tx, stream_id).await? else {
        tx.commit().await?;
        return Ok(None);
    };

    let removed = sqlx::query(
        r#"
        DELETE FROM stream_participants
        WHERE stream_id = $1 AND user_id = $2
        "#,
    )
    .bind(stream_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let (row, changed) = if removed == 0 {
        (current, false)
    } else {
        (touch(&mut tx, stream_id, now).await?, true)
    };
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(Some(Mutation { session, changed }))
}

pub async fn set_participant_online(
    pool: &PgPool,
    stream_id: Uuid,
    user_id: &str,
    is_online: bool,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Mutation, ServiceError> {
    let mut tx = pool.begin().await?;

    let current = lock_stream(&mut tx, stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
    if is_online && !current.is_live {
        return Err(ServiceError::FailedPrecondition("stream is not live"));
    }

    let updated = sqlx::query(
        r#"
        UPDATE stream_participants
        SET is_online = $3,
            last_seen = $4,
            lease_expires_at = CASE WHEN $3 THEN $5 ELSE NULL END
        WHERE stream_id = $1 AND user_id = $2
        "#,
    )
    .bind(stream_id)
    .bind(user_id)
    .bind(is_online)
    .bind(now)
    .bind(lease_expires_at)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(ServiceError::NotFound("participant"));
    }

    let row = touch(&mut tx, stream_id, now).await?;
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(Mutation { session, changed: true })
}

pub async fn set_participant_role(
    pool: &PgPool,
    stream_id: Uuid,
    user_id: &str,
    role: ParticipantRole,
    now: DateTime<Utc>,
) -> Result<Mutation, ServiceError> {
    let mut tx = pool.begin().await?;

    let current = lock_stream(&mut tx, stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;

    let existing_role = sqlx::query_scalar::<_, String>(
        r#"
        SELECT role
        FROM stream_participants
        WHERE stream_id = $1 AND user_id = $2
        "#,
    )
    .bind(stream_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ServiceError::NotFound("participant"))?;

    if existing_role == role.as_str() {
        let session = with_participants(&mut tx, current).await?;
        tx.commit().await?;
        return Ok(Mutation { session, changed: false });
    }

    sqlx::query(
        r#"
        UPDATE stream_participants
        SET role = $3
        WHERE stream_id = $1 AND user_id = $2
        "#,
    )
    .bind(stream_id)
    .bind(user_id)
    .bind(role.as_str())
    .execute(&mut *tx)
    .await?;

    let row = touch(&mut tx, stream_id, now).await?;
    let session = with_participants(&mut tx, row).await?;
    tx.commit().await?;

    Ok(Mutation { session, changed: true })
}

pub async fn renew_owner_lease(
    pool: &PgPool,
    stream_id: Uuid,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let updated = sqlx::query(
        r#"
        UPDATE live_streams
        SET owner_lease_expires_at = $2
        WHERE id = $1 AND is_live
        "#,
    )
    .bind(stream_id)
    .bind(lease_expires_at)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated > 0)
}

pub async fn renew_participant_lease(
    pool: &PgPool,
    stream_id: Uuid,
    user_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let updated = sqlx::query(
        r#"
        UPDATE stream_participants AS p
        SET last_seen = $3,
            lease_expires_at = $4
        FROM live_streams AS s
        WHERE p.stream_id = $1
          AND p.user_id = $2
          AND p.is_online
          AND s.id = p.stream_id
          AND s.is_live
        "#,
    )
    .bind(stream_id)
    .bind(user_id)
    .bind(now)
    .bind(lease_expires_at)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated > 0)
}

pub async fn expire_participant_leases(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<StreamSession>, ServiceError> {
    let stream_ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT DISTINCT p.stream_id
        FROM stream_participants p
        JOIN live_streams s ON s.id = p.stream_id
        WHERE s.is_live AND p.is_online AND p.lease_expires_at <= $1
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut changed = Vec::new();
    for stream_id in stream_ids {
        let mut tx = pool.begin().await?;
        if !lock_stream(&mut tx, stream_id).await?.is_some_and(|current| current.is_live) {
            tx.commit().await?;
            continue;
        }

        let expired = sqlx::query(
            r#"
            UPDATE stream_participants
            SET is_online = FALSE,
                last_seen = $2,
                lease_expires_at = NULL
            WHERE stream_id = $1 AND is_online AND lease_expires_at <= $2
            "#,
        )
        .bind(stream_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if expired > 0 {
            let row = touch(&mut tx, stream_id, now).await?;
            changed.push(with_participants(&mut tx, row).await?);
        }
        tx.commit().await?;
    }

    Ok(changed)
}

pub async fn streams_with_expired_owner_lease(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, ServiceError> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT id
        FROM live_streams
        WHERE is_live AND owner_lease_expires_at <= $1
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

pub async fn append_chat(
    pool: &PgPool,
    message: NewChatMessage,
) -> Result<ChatMessage, ServiceError> {
    let mut tx = pool.begin().await?;

    if lock_stream(&mut tx, message.stream_id).await?.is_none() {
        return Err(ServiceError::NotFound("stream"));
    }

    let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT max(created_at) FROM live_chat_messages WHERE stream_id = $1",
    )
    .bind(message.stream_id)
    .fetch_one(&mut *tx)
    .await?;
    let timestamp = latest.map_or(message.sent_at, |latest| latest.max(message.sent_at));

    let row = sqlx::query_as::<_, ChatRow>(
        r#"
        INSERT INTO live_chat_messages (
            id, stream_id, user_id, user_name, user_avatar, message, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, stream_id, user_id, user_name, user_avatar, message, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(message.stream_id)
    .bind(&message.user_id)
    .bind(&message.user_name)
    .bind(&message.user_avatar)
    .bind(&message.message)
    .bind(timestamp)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(row.into())
}

pub async fn list_chat(pool: &PgPool, stream_id: Uuid) -> Result<Vec<ChatMessage>, ServiceError> {
    let rows = sqlx::query_as::<_, ChatRow>(
        r#"
        SELECT id, stream_id, user_id, user_name, user_avatar, message, created_at
        FROM live_chat_messages
        WHERE stream_id = $1
        ORDER BY created_at ASC, seq ASC
        "#,
    )
    .bind(stream_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(ChatMessage::from).collect())
}

pub async fn claim_due_cleanups(
    pool: &PgPool,
    now: DateTime<Utc>,
    lock_for: Duration,
    limit: usize,
) -> Result<Vec<CleanupJob>, ServiceError> {
    let rows = sqlx::query_as::<_, CleanupRow>(
        r#"
        UPDATE stream_cleanup_jobs
        SET attempts = attempts + 1,
            locked_until = $2
        WHERE stream_id IN (
            SELECT stream_id
            FROM stream_cleanup_jobs
            WHERE due_at <= $1
              AND (locked_until IS NULL OR locked_until <= $1)
            ORDER BY due_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING stream_id, due_at, attempts
        "#,
    )
    .bind(now)
    .bind(now + lock_for)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut jobs: Vec<CleanupJob> = rows
        .into_iter()
        .map(|row| CleanupJob {
            stream_id: row.stream_id,
            due_at: row.due_at,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
        })
        .collect();
    jobs.sort_by_key(|job| job.due_at);

    Ok(jobs)
}

pub async fn complete_cleanup(pool: &PgPool, stream_id: Uuid) -> Result<(), ServiceError> {
    sqlx::query("DELETE FROM stream_cleanup_jobs WHERE stream_id = $1")
        .bind(stream_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn reschedule_cleanup(
    pool: &PgPool,
    stream_id: Uuid,
    due_at: DateTime<Utc>,
    error: &str,
) -> Result<(), ServiceError> {
    sqlx::query(
        r#"
        UPDATE stream_cleanup_jobs
        SET due_at = $2,
            locked_until = NULL,
            last_error = $3
        WHERE stream_id = $1
        "#,
    )
    .bind(stream_id)
    .bind(due_at)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}
