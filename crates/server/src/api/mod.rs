// HTTP surface for stream lifecycle, presence and chat.
//
// Everything except the live stream directory requires a bearer token.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{header::ETAG, StatusCode},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use scrolllive_common::types::{
    ChatMessage, Participant, ParticipantRole, StreamInfo, StreamSession, StreamSummary,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::{
        jwt::UserTokenService,
        middleware::{require_bearer_auth, AuthenticatedUser},
    },
    error::ServiceError,
    etag::{stream_etag, IfMatchHeader},
    hub::StreamHub,
    validation::{parse_stream_id, ValidatedJson},
    ws,
};

type EtagHeader = [(axum::http::HeaderName, String); 1];

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateStreamRequest {
    title: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStreamResponse {
    stream_id: Uuid,
    room_name: String,
    token: String,
    ws_url: String,
}

#[derive(Debug, Deserialize)]
struct ListStreamsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamsEnvelope {
    streams: Vec<StreamSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamEnvelope {
    stream: StreamSession,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStreamRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinStreamResponse {
    stream_id: Uuid,
    room_name: String,
    token: String,
    ws_url: String,
    stream_info: StreamInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct SuccessEnvelope {
    success: bool,
}

impl SuccessEnvelope {
    fn ok() -> Json<Self> {
        Json(Self { success: true })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatResponse {
    lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceRequest {
    is_online: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct RoleRequest {
    role: ParticipantRole,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParticipantEnvelope {
    participant: Participant,
}

#[derive(Debug, Deserialize, Serialize)]
struct SendChatRequest {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessagesEnvelope {
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessageEnvelope {
    message: ChatMessage,
}

pub fn router(hub: StreamHub, token_service: Arc<UserTokenService>) -> Router {
    let public = Router::new().route("/v1/streams", get(list_streams)).with_state(hub.clone());

    let protected = Router::new()
        .route("/v1/streams", post(create_stream))
        .route("/v1/streams/{id}", get(get_stream).patch(update_stream))
        .route("/v1/streams/{id}/join", post(join_stream))
        .route("/v1/streams/{id}/leave", post(leave_stream))
        .route("/v1/streams/{id}/end", post(end_stream))
        .route("/v1/streams/{id}/heartbeat", post(heartbeat))
        .route("/v1/streams/{id}/presence", put(update_presence))
        .route("/v1/streams/{id}/participants/{user_id}/role", put(set_participant_role))
        .route("/v1/streams/{id}/chat", get(chat_history).post(send_chat))
        .route("/v1/streams/{id}/ws", get(ws::stream_feed))
        .with_state(hub)
        .route_layer(middleware::from_fn_with_state(token_service, require_bearer_auth));

    public.merge(protected)
}

async fn create_stream(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    ValidatedJson(payload): ValidatedJson<CreateStreamRequest>,
) -> Result<(StatusCode, Json<CreateStreamResponse>), ServiceError> {
    let created = hub.create_stream(&user, &payload.title, payload.category.as_deref()).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateStreamResponse {
            stream_id: created.stream_id,
            room_name: created.room_name,
            token: created.token,
            ws_url: created.ws_url,
        }),
    ))
}

async fn list_streams(
    State(hub): State<StreamHub>,
    Query(query): Query<ListStreamsQuery>,
) -> Result<Json<StreamsEnvelope>, ServiceError> {
    let streams = hub.list_live_streams(query.limit).await?;

    Ok(Json(StreamsEnvelope { streams: streams.iter().map(StreamSession::summary).collect() }))
}

async fn get_stream(
    State(hub): State<StreamHub>,
    Path(stream_id): Path<String>,
) -> Result<(EtagHeader, Json<StreamEnvelope>), ServiceError> {
    let stream = hub.get_stream(parse_stream_id(&stream_id)?).await?;

    Ok(([(ETAG, stream_etag(stream.version))], Json(StreamEnvelope { stream })))
}

async fn update_stream(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
    if_match: IfMatchHeader,
    ValidatedJson(payload): ValidatedJson<UpdateStreamRequest>,
) -> Result<(EtagHeader, Json<StreamEnvelope>), ServiceError> {
    let stream_id = parse_stream_id(&stream_id)?;
    if payload.title.is_none() && payload.category.is_none() {
        return Err(ServiceError::InvalidArgument(
            "at least one of title or category is required".to_string(),
        ));
    }

    let stream = hub
        .update_stream_details(
            stream_id,
            &user,
            if_match.expected_version()?,
            payload.title.as_deref(),
            payload.category.as_deref(),
        )
        .await?;

    Ok(([(ETAG, stream_etag(stream.version))], Json(StreamEnvelope { stream })))
}

async fn join_stream(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
) -> Result<Json<JoinStreamResponse>, ServiceError> {
    let joined = hub.join_stream(parse_stream_id(&stream_id)?, &user).await?;

    Ok(Json(JoinStreamResponse {
        stream_id: joined.stream_id,
        room_name: joined.room_name,
        token: joined.token,
        ws_url: joined.ws_url,
        stream_info: joined.stream_info,
    }))
}

async fn leave_stream(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
) -> Result<Json<SuccessEnvelope>, ServiceError> {
    hub.leave_stream(parse_stream_id(&stream_id)?, &user.user_id).await?;
    Ok(SuccessEnvelope::ok())
}

async fn end_stream(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
) -> Result<Json<SuccessEnvelope>, ServiceError> {
    hub.end_stream(parse_stream_id(&stream_id)?, &user).await?;
    Ok(SuccessEnvelope::ok())
}

async fn heartbeat(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
) -> Result<Json<HeartbeatResponse>, ServiceError> {
    let lease_expires_at = hub.heartbeat(parse_stream_id(&stream_id)?, &user.user_id).await?;
    Ok(Json(HeartbeatResponse { lease_expires_at }))
}

async fn update_presence(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<PresenceRequest>,
) -> Result<Json<SuccessEnvelope>, ServiceError> {
    hub.set_presence(parse_stream_id(&stream_id)?, &user.user_id, payload.is_online).await?;
    Ok(SuccessEnvelope::ok())
}

async fn set_participant_role(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((stream_id, user_id)): Path<(String, String)>,
    ValidatedJson(payload): ValidatedJson<RoleRequest>,
) -> Result<Json<ParticipantEnvelope>, ServiceError> {
    let participant = hub
        .set_participant_role(parse_stream_id(&stream_id)?, &user, &user_id, payload.role)
        .await?;
    Ok(Json(ParticipantEnvelope { participant }))
}

async fn chat_history(
    State(hub): State<StreamHub>,
    Path(stream_id): Path<String>,
) -> Result<Json<ChatMessagesEnvelope>, ServiceError> {
    let messages = hub.chat_history(parse_stream_id(&stream_id)?).await?;
    Ok(Json(ChatMessagesEnvelope { messages }))
}

async fn send_chat(
    State(hub): State<StreamHub>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(stream_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<SendChatRequest>,
) -> Result<(StatusCode, Json<ChatMessageEnvelope>), ServiceError> {
    let message = hub.send_chat(parse_stream_id(&stream_id)?, &user, &payload.message).await?;
    Ok((StatusCode::CREATED, Json(ChatMessageEnvelope { message })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::jwt::{UserIdentity, UserTokenService},
        media::token::tests::decode_media_token,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TEST_SECRET: &str = "scrolllive_test_secret_that_is_long_enough";

    struct TestApi {
        router: Router,
        tokens: Arc<UserTokenService>,
        hub: StreamHub,
    }

    impl TestApi {
        fn new() -> Self {
            let tokens = Arc::new(
                UserTokenService::new(TEST_SECRET).expect("token service should initialize"),
            );
            let hub = StreamHub::for_tests();
            Self { router: router(hub.clone(), Arc::clone(&tokens)), tokens, hub }
        }

        fn bearer(&self, user_id: &str) -> String {
            let identity = UserIdentity::new(user_id).with_name(format!("{user_id} name"));
            let token = self.tokens.issue_user_token(&identity).expect("token should be issued");
            format!("Bearer {token}")
        }

        async fn send(
            &self,
            method: Method,
            uri: &str,
            user_id: Option<&str>,
            body: Option<Value>,
        ) -> Response {
            self.send_with(method, uri, user_id, body, &[]).await
        }

        async fn send_with(
            &self,
            method: Method,
            uri: &str,
            user_id: Option<&str>,
            body: Option<Value>,
            headers: &[(&str, &str)],
        ) -> Response {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(user_id) = user_id {
                request = request.header(AUTHORIZATION, self.bearer(user_id));
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            let body = match body {
                Some(body) => {
                    request = request.header("content-type", "application/json");
                    Body::from(body.to_string())
                }
                None => Body::empty(),
            };

            self.router
                .clone()
                .oneshot(request.body(body).expect("request should build"))
                .await
                .expect("request should return response")
        }

        async fn start_stream(&self, owner: &str) -> CreateStreamResponse {
            let response = self
                .send(
                    Method::POST,
                    "/v1/streams",
                    Some(owner),
                    Some(json!({ "title": "Morning scroll", "category": "Music" })),
                )
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
            read_json(response).await
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body =
            to_bytes(response.into_body(), usize::MAX).await.expect("response body should read");
        serde_json::from_slice(&body).expect("response body should be valid json")
    }

    #[tokio::test]
    async fn stream_routes_require_bearer_auth() {
        let api = TestApi::new();

        let response =
            api.send(Method::POST, "/v1/streams", None, Some(json!({ "title": "x" }))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

        let join_uri = format!("/v1/streams/{}/join", Uuid::new_v4());
        let join = api.send(Method::POST, &join_uri, None, None).await;
        assert_eq!(join.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stream_directory_is_public() {
        let api = TestApi::new();
        api.start_stream("owner").await;

        let response = api.send(Method::GET, "/v1/streams", None, None).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: StreamsEnvelope = read_json(response).await;
        assert_eq!(body.streams.len(), 1);
        assert_eq!(body.streams[0].title, "Morning scroll");
        assert_eq!(body.streams[0].created_by, "owner name");
    }

    #[tokio::test]
    async fn create_returns_publisher_credentials() {
        let api = TestApi::new();

        let created = api.start_stream("owner").await;

        assert!(created.room_name.starts_with("stream_owner_"));
        assert_eq!(created.ws_url, "ws://media.test");
        let claims = decode_media_token(&created.token);
        assert_eq!(claims.sub, "owner");
        assert_eq!(claims.video.can_publish, Some(true));
        assert_eq!(claims.video.room.as_deref(), Some(created.room_name.as_str()));
    }

    #[tokio::test]
    async fn create_rejects_blank_title() {
        let api = TestApi::new();

        let response = api
            .send(Method::POST, "/v1/streams", Some("owner"), Some(json!({ "title": "   " })))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn join_leave_and_end_flow() {
        let api = TestApi::new();
        let created = api.start_stream("owner").await;
        let base = format!("/v1/streams/{}", created.stream_id);

        let join = api.send(Method::POST, &format!("{base}/join"), Some("viewer"), None).await;
        assert_eq!(join.status(), StatusCode::OK);
        let joined: JoinStreamResponse = read_json(join).await;
        assert_eq!(joined.stream_info.title, "Morning scroll");
        assert_eq!(joined.stream_info.created_by, "owner name");
        assert_eq!(decode_media_token(&joined.token).video.can_publish, Some(false));
        assert_eq!(api.hub.get_stream(created.stream_id).await.expect("get").viewer_count, 1);

        let leave = api.send(Method::POST, &format!("{base}/leave"), Some("viewer"), None).await;
        assert_eq!(leave.status(), StatusCode::OK);
        let body: SuccessEnvelope = read_json(leave).await;
        assert!(body.success);
        assert_eq!(api.hub.get_stream(created.stream_id).await.expect("get").viewer_count, 0);

        let forbidden = api.send(Method::POST, &format!("{base}/end"), Some("viewer"), None).await;
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let end = api.send(Method::POST, &format!("{base}/end"), Some("owner"), None).await;
        assert_eq!(end.status(), StatusCode::OK);

        let late_join = api.send(Method::POST, &format!("{base}/join"), Some("late"), None).await;
        assert_eq!(late_join.status(), StatusCode::PRECONDITION_FAILED);
        let body: Value = read_json(late_join).await;
        assert_eq!(body["error"]["code"], "FAILED_PRECONDITION");
    }

    #[tokio::test]
    async fn unknown_and_malformed_stream_ids() {
        let api = TestApi::new();

        let missing = api
            .send(Method::POST, &format!("/v1/streams/{}/join", Uuid::new_v4()), Some("u"), None)
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = api.send(Method::GET, "/v1/streams/not-a-uuid", Some("u"), None).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_stream_enforces_if_match() {
        let api = TestApi::new();
        let created = api.start_stream("owner").await;
        let uri = format!("/v1/streams/{}", created.stream_id);

        let get = api.send(Method::GET, &uri, Some("owner"), None).await;
        assert_eq!(get.status(), StatusCode::OK);
        let etag = get
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .expect("etag header")
            .to_owned();

        let missing = api
            .send(Method::PATCH, &uri, Some("owner"), Some(json!({ "title": "Renamed" })))
            .await;
        assert_eq!(missing.status(), StatusCode::PRECONDITION_REQUIRED);

        let stale = api
            .send_with(
                Method::PATCH,
                &uri,
                Some("owner"),
                Some(json!({ "title": "Renamed" })),
                &[("if-match", "\"v999\"")],
            )
            .await;
        assert_eq!(stale.status(), StatusCode::CONFLICT);

        let not_owner = api
            .send_with(
                Method::PATCH,
                &uri,
                Some("viewer"),
                Some(json!({ "title": "Renamed" })),
                &[("if-match", etag.as_str())],
            )
            .await;
        assert_eq!(not_owner.status(), StatusCode::FORBIDDEN);

        let updated = api
            .send_with(
                Method::PATCH,
                &uri,
                Some("owner"),
                Some(json!({ "title": "Renamed" })),
                &[("if-match", etag.as_str())],
            )
            .await;
        assert_eq!(updated.status(), StatusCode::OK);
        let new_etag = updated.headers().get(ETAG).expect("etag header").clone();
        assert_ne!(new_etag, etag.as_str());
        let body: StreamEnvelope = read_json(updated).await;
        assert_eq!(body.stream.title, "Renamed");
        assert_eq!(body.stream.category, "Music");
    }

    #[tokio::test]
    async fn heartbeat_and_presence_routes() {
        let api = TestApi::new();
        let created = api.start_stream("owner").await;
        let base = format!("/v1/streams/{}", created.stream_id);

        let stranger =
            api.send(Method::POST, &format!("{base}/heartbeat"), Some("stranger"), None).await;
        assert_eq!(stranger.status(), StatusCode::NOT_FOUND);

        api.send(Method::POST, &format!("{base}/join"), Some("viewer"), None).await;
        let heartbeat =
            api.send(Method::POST, &format!("{base}/heartbeat"), Some("viewer"), None).await;
        assert_eq!(heartbeat.status(), StatusCode::OK);
        let body: HeartbeatResponse = read_json(heartbeat).await;
        assert!(body.lease_expires_at > Utc::now());

        let offline = api
            .send(
                Method::PUT,
                &format!("{base}/presence"),
                Some("viewer"),
                Some(json!({ "isOnline": false })),
            )
            .await;
        assert_eq!(offline.status(), StatusCode::OK);
        assert_eq!(api.hub.get_stream(created.stream_id).await.expect("get").viewer_count, 0);
    }

    #[tokio::test]
    async fn owner_can_promote_a_viewer() {
        let api = TestApi::new();
        let created = api.start_stream("owner").await;
        let base = format!("/v1/streams/{}", created.stream_id);
        api.send(Method::POST, &format!("{base}/join"), Some("viewer"), None).await;

        let response = api
            .send(
                Method::PUT,
                &format!("{base}/participants/viewer/role"),
                Some("owner"),
                Some(json!({ "role": "moderator" })),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: ParticipantEnvelope = read_json(response).await;
        assert_eq!(body.participant.role, ParticipantRole::Moderator);

        let unknown_role = api
            .send(
                Method::PUT,
                &format!("{base}/participants/viewer/role"),
                Some("owner"),
                Some(json!({ "role": "admin" })),
            )
            .await;
        assert_eq!(unknown_role.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_round_trip_over_http() {
        let api = TestApi::new();
        let created = api.start_stream("owner").await;
        let uri = format!("/v1/streams/{}/chat", created.stream_id);

        let sent = api
            .send(Method::POST, &uri, Some("viewer"), Some(json!({ "message": "  hello  " })))
            .await;
        assert_eq!(sent.status(), StatusCode::CREATED);
        let sent: ChatMessageEnvelope = read_json(sent).await;
        assert_eq!(sent.message.message, "hello");
        assert_eq!(sent.message.user_name, "viewer name");

        let too_long = api
            .send(Method::POST, &uri, Some("viewer"), Some(json!({ "message": "x".repeat(501) })))
            .await;
        assert_eq!(too_long.status(), StatusCode::BAD_REQUEST);

        let history = api.send(Method::GET, &uri, Some("viewer"), None).await;
        let history: ChatMessagesEnvelope = read_json(history).await;
        assert_eq!(history.messages, vec![sent.message]);
    }

    #[tokio::test]
    async fn media_outage_surfaces_as_unavailable() {
        let api = TestApi::new();
        api.hub.rooms.set_unavailable(true).await;

        let response = api
            .send(Method::POST, "/v1/streams", Some("owner"), Some(json!({ "title": "Demo" })))
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = read_json(response).await;
        assert_eq!(body["error"]["code"], "UNAVAILABLE");
        assert_eq!(body["error"]["retryable"], true);
        assert_eq!(body["error"]["message"], "media service is unavailable");
    }
}
