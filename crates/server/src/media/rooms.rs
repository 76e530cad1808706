// Remote media room management.
//
// The LiveKit backend talks to the room service over its Twirp JSON API.
// The memory backend keeps a local registry and is used for development and
// tests.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use super::token::MediaTokenIssuer;

const ROOM_SERVICE_PATH: &str = "twirp/livekit.RoomService";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomOptions {
    pub empty_timeout: Duration,
    pub max_participants: u32,
}

#[derive(Clone)]
pub enum RoomService {
    LiveKit(LiveKitRoomClient),
    Memory(Arc<RwLock<MemoryRooms>>),
}

#[derive(Debug, Default)]
pub struct MemoryRooms {
    rooms: HashMap<String, RoomOptions>,
    unavailable: bool,
}

impl RoomService {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryRooms::default())))
    }

    pub async fn create_room(&self, name: &str, options: RoomOptions) -> anyhow::Result<()> {
        match self {
            Self::LiveKit(client) => client.create_room(name, options).await,
            Self::Memory(rooms) => {
                let mut rooms = rooms.write().await;
                if rooms.unavailable {
                    bail!("memory room service is marked unavailable");
                }
                rooms.rooms.insert(name.to_string(), options);
                Ok(())
            }
        }
    }

    /// Deleting a room that no longer exists succeeds.
    pub async fn delete_room(&self, name: &str) -> anyhow::Result<()> {
        match self {
            Self::LiveKit(client) => client.delete_room(name).await,
            Self::Memory(rooms) => {
                let mut rooms = rooms.write().await;
                if rooms.unavailable {
                    bail!("memory room service is marked unavailable");
                }
                rooms.rooms.remove(name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
impl RoomService {
    pub async fn room(&self, name: &str) -> Option<RoomOptions> {
        match self {
            Self::Memory(rooms) => rooms.read().await.rooms.get(name).copied(),
            Self::LiveKit(_) => None,
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        if let Self::Memory(rooms) = self {
            rooms.write().await.unavailable = unavailable;
        }
    }
}

#[derive(Clone)]
pub struct LiveKitRoomClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: MediaTokenIssuer,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomBody<'a> {
    name: &'a str,
    empty_timeout: u64,
    max_participants: u32,
}

#[derive(Serialize)]
struct DeleteRoomBody<'a> {
    room: &'a str,
}

impl LiveKitRoomClient {
    pub fn new(
        service_url: &str,
        tokens: MediaTokenIssuer,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base_url = http_base_url(service_url)?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build media room service HTTP client")?;

        Ok(Self { http, base_url, tokens })
    }

    async fn create_room(&self, name: &str, options: RoomOptions) -> anyhow::Result<()> {
        let body = CreateRoomBody {
            name,
            empty_timeout: options.empty_timeout.as_secs(),
            max_participants: options.max_participants,
        };
        let status = self.call("CreateRoom", &body).await?;
        if !status.is_success() {
            bail!("media room service rejected CreateRoom for {name}: {status}");
        }

        info!(room_name = %name, "media room created");
        Ok(())
    }

    async fn delete_room(&self, name: &str) -> anyhow::Result<()> {
        let status = self.call("DeleteRoom", &DeleteRoomBody { room: name }).await?;
        if status == StatusCode::NOT_FOUND {
            debug!(room_name = %name, "media room already gone");
            return Ok(());
        }
        if !status.is_success() {
            bail!("media room service rejected DeleteRoom for {name}: {status}");
        }

        info!(room_name = %name, "media room deleted");
        Ok(())
    }

    async fn call<B: Serialize>(&self, method: &str, body: &B) -> anyhow::Result<StatusCode> {
        let url = self
            .base_url
            .join(&format!("{ROOM_SERVICE_PATH}/{method}"))
            .with_context(|| format!("failed to build room service URL for {method}"))?;
        let token = self.tokens.issue_room_admin()?;

        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("media room service {method} request failed"))?;

        Ok(response.status())
    }
}

/// Room service calls go over HTTP(S) even when clients are given a ws(s) URL.
fn http_base_url(service_url: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(service_url)
        .with_context(|| format!("invalid media service URL '{service_url}'"))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(anyhow!("unsupported media service URL scheme '{other}'")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to convert media service URL scheme to {scheme}"))?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}
