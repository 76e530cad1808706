// Participant presence: join, leave, online flags, leases and roles.
//
// The viewer count is never adjusted here; the store re-derives it from the
// online participants in the same atomic step as each participant write.

use chrono::{DateTime, Utc};
use scrolllive_common::types::{Participant, ParticipantRole, StreamInfo, StreamSession};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::middleware::AuthenticatedUser,
    error::ServiceError,
    hub::StreamHub,
    media::token::MediaGrant,
    metrics,
    store::ParticipantProfile,
};

/// Credentials and stream details handed to a joining participant.
#[derive(Debug, Clone)]
pub struct JoinedStream {
    pub stream_id: Uuid,
    pub room_name: String,
    pub token: String,
    pub ws_url: String,
    pub stream_info: StreamInfo,
    pub session: StreamSession,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions in which at least one participant went offline.
    pub sessions_updated: usize,
    /// Live sessions ended because the owner stopped heartbeating.
    pub streams_ended: usize,
}

impl StreamHub {
    /// Adds the caller to a live stream as a viewer, or brings their existing
    /// record back online with its role intact.
    ///
    /// The creator is recorded like anyone else; their publish grant comes
    /// from owning the stream, not from a participant role.
    pub async fn join_stream(
        &self,
        stream_id: Uuid,
        user: &AuthenticatedUser,
    ) -> Result<JoinedStream, ServiceError> {
        let session =
            self.store.get_stream(stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
        if !session.is_live {
            return Err(ServiceError::FailedPrecondition("stream is not live"));
        }

        let now = Utc::now();
        let profile = ParticipantProfile {
            user_id: user.user_id.clone(),
            user_name: user.display_name.clone(),
            user_avatar: user.avatar_url.clone(),
        };
        let mutation = self
            .store
            .upsert_participant(
                stream_id,
                profile,
                ParticipantRole::Viewer,
                now,
                self.lease_expiry(now),
            )
            .await?;
        self.publish(&mutation);

        let session = mutation.session;
        let granted_role = session
            .participant(&user.user_id)
            .map_or(ParticipantRole::Viewer, |participant| participant.role);
        let grant = if session.is_owned_by(&user.user_id) {
            MediaGrant::publisher(&session.room_name)
        } else {
            MediaGrant::subscriber(&session.room_name)
        };
        let token = self.media_tokens.issue(&user.user_id, &user.display_name, grant)?;

        info!(
            stream_id = %stream_id,
            user_id = %user.user_id,
            role = granted_role.as_str(),
            viewer_count = session.viewer_count,
            "participant joined"
        );
        metrics::record_stream_event("joined");

        Ok(JoinedStream {
            stream_id,
            room_name: session.room_name.clone(),
            token,
            ws_url: self.media_ws_url.clone(),
            stream_info: session.info(),
            session,
        })
    }

    /// Removes the participant record. Leaving an unknown stream, or one the
    /// user never joined, succeeds without effect.
    pub async fn leave_stream(&self, stream_id: Uuid, user_id: &str) -> Result<(), ServiceError> {
        let Some(mutation) = self.store.remove_participant(stream_id, user_id, Utc::now()).await?
        else {
            debug!(stream_id = %stream_id, user_id = %user_id, "leave for unknown stream");
            return Ok(());
        };

        if mutation.changed {
            info!(
                stream_id = %stream_id,
                user_id = %user_id,
                viewer_count = mutation.session.viewer_count,
                "participant left"
            );
            metrics::record_stream_event("left");
        }
        self.publish(&mutation);
        Ok(())
    }

    pub async fn set_presence(
        &self,
        stream_id: Uuid,
        user_id: &str,
        is_online: bool,
    ) -> Result<StreamSession, ServiceError> {
        let now = Utc::now();
        let mutation = self
            .store
            .set_participant_online(stream_id, user_id, is_online, now, self.lease_expiry(now))
            .await?;
        debug!(stream_id = %stream_id, user_id = %user_id, is_online, "presence updated");
        self.publish(&mutation);
        Ok(mutation.session)
    }

    /// Renews the caller's presence lease and returns its new expiry.
    ///
    /// The owner renews the stream's owner lease. A participant renews their
    /// own lease, coming back online if the reaper had marked them offline.
    pub async fn heartbeat(
        &self,
        stream_id: Uuid,
        user_id: &str,
    ) -> Result<DateTime<Utc>, ServiceError> {
        let session =
            self.store.get_stream(stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
        if !session.is_live {
            return Err(ServiceError::FailedPrecondition("stream is not live"));
        }

        let now = Utc::now();
        let lease_expires_at = self.lease_expiry(now);
        let is_owner = session.is_owned_by(user_id);
        if is_owner {
            self.store.renew_owner_lease(stream_id, lease_expires_at).await?;
        }

        if session.participant(user_id).is_some() {
            let renewed = self
                .store
                .renew_participant_lease(stream_id, user_id, now, lease_expires_at)
                .await?;
            if !renewed {
                let mutation = self
                    .store
                    .set_participant_online(stream_id, user_id, true, now, lease_expires_at)
                    .await?;
                info!(stream_id = %stream_id, user_id = %user_id, "participant back online");
                self.publish(&mutation);
            }
        } else if !is_owner {
            return Err(ServiceError::NotFound("participant"));
        }

        Ok(lease_expires_at)
    }

    /// Owner-only promotion or demotion between viewer and moderator.
    pub async fn set_participant_role(
        &self,
        stream_id: Uuid,
        caller: &AuthenticatedUser,
        user_id: &str,
        role: ParticipantRole,
    ) -> Result<Participant, ServiceError> {
        if role == ParticipantRole::Broadcaster {
            return Err(ServiceError::InvalidArgument(
                "broadcaster role cannot be assigned".to_string(),
            ));
        }

        let session =
            self.store.get_stream(stream_id).await?.ok_or(ServiceError::NotFound("stream"))?;
        if !session.is_owned_by(&caller.user_id) {
            return Err(ServiceError::PermissionDenied(
                "only the stream creator can change participant roles",
            ));
        }
        if session.is_owned_by(user_id) {
            return Err(ServiceError::InvalidArgument(
                "the stream creator's role cannot be changed".to_string(),
            ));
        }

        let mutation =
            self.store.set_participant_role(stream_id, user_id, role, Utc::now()).await?;
        if mutation.changed {
            info!(stream_id = %stream_id, user_id = %user_id, role = role.as_str(), "role changed");
        }
        self.publish(&mutation);

        mutation.session.participant(user_id).cloned().ok_or(ServiceError::NotFound("participant"))
    }

    /// Marks participants with lapsed leases offline and ends live streams
    /// whose owner lease has lapsed.
    pub async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<ReapReport, ServiceError> {
        let updated = self.store.expire_participant_leases(now).await?;
        for session in &updated {
            debug!(
                stream_id = %session.id,
                viewer_count = session.viewer_count,
                "participant leases expired"
            );
            self.feed.publish_session(session);
        }
        if !updated.is_empty() {
            metrics::record_leases_expired(updated.len() as u64);
        }

        let mut streams_ended = 0;
        for stream_id in self.store.streams_with_expired_owner_lease(now).await? {
            let Some(session) = self.store.get_stream(stream_id).await? else {
                continue;
            };
            if !session.is_live {
                continue;
            }

            match self.finish_stream(session, "owner lease expired").await {
                Ok(_) => {
                    streams_ended += 1;
                    metrics::record_stream_event("reaped");
                }
                Err(error) => {
                    warn!(stream_id = %stream_id, error = %error, "failed to end abandoned stream");
                    error.log();
                }
            }
        }

        Ok(ReapReport { sessions_updated: updated.len(), streams_ended })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use scrolllive_common::types::ParticipantRole;

    use crate::{
        auth::middleware::AuthenticatedUser, config::StreamSettings, error::ServiceError,
        hub::StreamHub, media::token::tests::decode_media_token,
    };

    use super::ReapReport;

    fn user(id: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.to_string(),
            display_name: format!("{id} name"),
            avatar_url: Some(format!("https://avatars.test/{id}.png")),
        }
    }

    #[tokio::test]
    async fn join_then_leave_restores_viewer_count() {
        let hub = StreamHub::for_tests();
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");

        let joined = hub.join_stream(created.stream_id, &user("u1")).await.expect("join");
        assert_eq!(joined.session.viewer_count, 1);
        assert_eq!(joined.stream_info.title, "Demo");
        assert_eq!(joined.stream_info.created_by, "owner name");
        assert_eq!(joined.room_name, created.room_name);

        let claims = decode_media_token(&joined.token);
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.video.can_publish, Some(false));
        assert_eq!(claims.video.can_subscribe, Some(true));

        hub.leave_stream(created.stream_id, "u1").await.expect("leave");
        let session = hub.get_stream(created.stream_id).await.expect("get");
        assert_eq!(session.viewer_count, 0);
        assert!(session.participants.is_empty());
    }

    #[tokio::test]
    async fn rejoining_does_not_double_count() {
        let hub = StreamHub::for_tests();
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");

        hub.join_stream(created.stream_id, &user("u1")).await.expect("join");
        let again = hub.join_stream(created.stream_id, &user("u1")).await.expect("rejoin");

        assert_eq!(again.session.viewer_count, 1);
        assert_eq!(again.session.participants.len(), 1);
    }

    #[tokio::test]
    async fn join_on_ended_stream_is_rejected_and_appends_nothing() {
        let hub = StreamHub::for_tests();
        let owner = user("owner");
        let created = hub.create_stream(&owner, "Demo", None).await.expect("create");
        hub.end_stream(created.stream_id, &owner).await.expect("end");

        let error = hub.join_stream(created.stream_id, &user("late")).await.expect_err("ended");
        assert!(matches!(error, ServiceError::FailedPrecondition(_)));
        let session = hub.get_stream(created.stream_id).await.expect("get");
        assert!(session.participants.is_empty());
        assert_eq!(session.viewer_count, 0);
    }

    #[tokio::test]
    async fn join_on_unknown_stream_is_not_found() {
        let hub = StreamHub::for_tests();
        let error = hub.join_stream(uuid::Uuid::new_v4(), &user("u1")).await.expect_err("missing");
        assert!(matches!(error, ServiceError::NotFound("stream")));
    }

    #[tokio::test]
    async fn owner_joins_as_viewer_but_keeps_publish_grant() {
        let hub = StreamHub::for_tests();
        let owner = user("owner");
        let created = hub.create_stream(&owner, "Demo", None).await.expect("create");

        let joined = hub.join_stream(created.stream_id, &owner).await.expect("join");
        let participant = joined.session.participant("owner").expect("owner record");
        assert_eq!(participant.role, ParticipantRole::Viewer);
        assert_eq!(decode_media_token(&joined.token).video.can_publish, Some(true));

        let viewer = hub.join_stream(created.stream_id, &user("u1")).await.expect("u1");
        assert_eq!(decode_media_token(&viewer.token).video.can_publish, Some(false));
    }

    #[tokio::test]
    async fn scenario_counts_follow_joins_and_leaves_until_end() {
        let hub = StreamHub::for_tests();
        let owner = user("owner");
        let created = hub.create_stream(&owner, "Demo", None).await.expect("create");

        let one = hub.join_stream(created.stream_id, &user("u1")).await.expect("u1");
        assert_eq!(one.session.viewer_count, 1);
        let two = hub.join_stream(created.stream_id, &user("u2")).await.expect("u2");
        assert_eq!(two.session.viewer_count, 2);
        hub.leave_stream(created.stream_id, "u1").await.expect("u1 leaves");
        assert_eq!(hub.get_stream(created.stream_id).await.expect("get").viewer_count, 1);

        let ended = hub.end_stream(created.stream_id, &owner).await.expect("end");
        assert!(!ended.is_live);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_converge_to_participant_count() {
        let hub = Arc::new(StreamHub::for_tests());
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");

        let mut handles = Vec::new();
        for index in 0..40 {
            let hub = Arc::clone(&hub);
            handles.push(tokio::spawn(async move {
                hub.join_stream(created.stream_id, &user(&format!("viewer-{index}"))).await
            }));
        }
        for handle in handles {
            handle.await.expect("join task").expect("join");
        }

        let session = hub.get_stream(created.stream_id).await.expect("get");
        assert_eq!(session.viewer_count, 40);
        assert_eq!(session.online_participants(), 40);
    }

    #[tokio::test]
    async fn leave_is_a_no_op_for_unknown_stream_or_user() {
        let hub = StreamHub::for_tests();
        hub.leave_stream(uuid::Uuid::new_v4(), "ghost").await.expect("unknown stream");

        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");
        let version = created.session.version;
        hub.leave_stream(created.stream_id, "ghost").await.expect("unknown user");
        assert_eq!(hub.get_stream(created.stream_id).await.expect("get").version, version);
    }

    #[tokio::test]
    async fn set_presence_toggles_count_and_requires_participant() {
        let hub = StreamHub::for_tests();
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");
        hub.join_stream(created.stream_id, &user("u1")).await.expect("join");

        let offline = hub.set_presence(created.stream_id, "u1", false).await.expect("offline");
        assert_eq!(offline.viewer_count, 0);
        let record = offline.participant("u1").expect("record kept");
        assert!(!record.is_online);
        assert!(record.last_seen.is_some());

        let online = hub.set_presence(created.stream_id, "u1", true).await.expect("online");
        assert_eq!(online.viewer_count, 1);

        let error =
            hub.set_presence(created.stream_id, "nobody", true).await.expect_err("missing");
        assert!(matches!(error, ServiceError::NotFound("participant")));
    }

    #[tokio::test]
    async fn heartbeat_revives_reaped_participant() {
        let hub = StreamHub::for_tests();
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");
        hub.join_stream(created.stream_id, &user("u1")).await.expect("join");

        let later = Utc::now() + chrono::Duration::minutes(5);
        hub.store
            .renew_owner_lease(created.stream_id, later + chrono::Duration::hours(1))
            .await
            .expect("owner lease");
        let report = hub.reap_expired_leases(later).await.expect("reap");
        assert_eq!(report, ReapReport { sessions_updated: 1, streams_ended: 0 });
        assert_eq!(hub.get_stream(created.stream_id).await.expect("get").viewer_count, 0);

        let lease = hub.heartbeat(created.stream_id, "u1").await.expect("heartbeat");
        assert!(lease > Utc::now());
        assert_eq!(hub.get_stream(created.stream_id).await.expect("get").viewer_count, 1);
    }

    #[tokio::test]
    async fn heartbeat_of_online_participant_is_not_a_session_write() {
        let hub = StreamHub::for_tests();
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");
        let joined = hub.join_stream(created.stream_id, &user("u1")).await.expect("join");

        hub.heartbeat(created.stream_id, "u1").await.expect("heartbeat");
        let session = hub.get_stream(created.stream_id).await.expect("get");
        assert_eq!(session.version, joined.session.version);
    }

    #[tokio::test]
    async fn heartbeat_from_stranger_is_rejected() {
        let hub = StreamHub::for_tests();
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");

        hub.heartbeat(created.stream_id, "owner").await.expect("owner heartbeat");
        let error = hub.heartbeat(created.stream_id, "stranger").await.expect_err("stranger");
        assert!(matches!(error, ServiceError::NotFound("participant")));
    }

    #[tokio::test]
    async fn expired_owner_lease_ends_stream() {
        let settings = StreamSettings { lease_ttl: Duration::from_secs(30), ..Default::default() };
        let hub = StreamHub::for_tests_with(settings);
        let created = hub.create_stream(&user("owner"), "Demo", None).await.expect("create");

        let report = hub.reap_expired_leases(Utc::now()).await.expect("early reap");
        assert_eq!(report.streams_ended, 0);

        let later = Utc::now() + chrono::Duration::seconds(31);
        let report = hub.reap_expired_leases(later).await.expect("reap");
        assert_eq!(report.streams_ended, 1);
        assert!(!hub.get_stream(created.stream_id).await.expect("get").is_live);
        assert!(hub.rooms.room(&created.room_name).await.is_none());
    }

    #[tokio::test]
    async fn ended_stream_is_not_rewritten_by_lease_expiry() {
        let hub = StreamHub::for_tests();
        let owner = user("owner");
        let created = hub.create_stream(&owner, "Demo", None).await.expect("create");
        hub.join_stream(created.stream_id, &user("u1")).await.expect("join");
        let ended = hub.end_stream(created.stream_id, &owner).await.expect("end");

        let later = Utc::now() + chrono::Duration::minutes(5);
        let report = hub.reap_expired_leases(later).await.expect("reap");
        assert_eq!(report, ReapReport::default());

        let session = hub.get_stream(created.stream_id).await.expect("get");
        assert_eq!(session.version, ended.version);
        assert_eq!(session.last_activity_at, ended.last_activity_at);
        assert_eq!(session.viewer_count, ended.viewer_count);
    }

    #[tokio::test]
    async fn owner_can_promote_and_demote_but_not_grant_broadcaster() {
        let hub = StreamHub::for_tests();
        let owner = user("owner");
        let created = hub.create_stream(&owner, "Demo", None).await.expect("create");
        hub.join_stream(created.stream_id, &user("u1")).await.expect("join");

        let promoted = hub
            .set_participant_role(created.stream_id, &owner, "u1", ParticipantRole::Moderator)
            .await
            .expect("promote");
        assert_eq!(promoted.role, ParticipantRole::Moderator);

        let rejoined = hub.join_stream(created.stream_id, &user("u1")).await.expect("rejoin");
        assert_eq!(
            rejoined.session.participant("u1").map(|participant| participant.role),
            Some(ParticipantRole::Moderator)
        );

        let error = hub
            .set_participant_role(created.stream_id, &owner, "u1", ParticipantRole::Broadcaster)
            .await
            .expect_err("broadcaster");
        assert!(matches!(error, ServiceError::InvalidArgument(_)));

        let error = hub
            .set_participant_role(created.stream_id, &user("u1"), "u1", ParticipantRole::Viewer)
            .await
            .expect_err("not owner");
        assert!(matches!(error, ServiceError::PermissionDenied(_)));

        let demoted = hub
            .set_participant_role(created.stream_id, &owner, "u1", ParticipantRole::Viewer)
            .await
            .expect("demote");
        assert_eq!(demoted.role, ParticipantRole::Viewer);
    }
}
