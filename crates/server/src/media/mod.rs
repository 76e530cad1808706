pub mod rooms;
pub mod token;

use anyhow::Context;

use crate::config::MediaConfig;
use rooms::{LiveKitRoomClient, RoomService};
use token::MediaTokenIssuer;

/// Builds the token issuer and room service for the configured media backend.
pub fn from_config(config: &MediaConfig) -> anyhow::Result<(MediaTokenIssuer, RoomService)> {
    let tokens = MediaTokenIssuer::new(&config.api_key, &config.api_secret)
        .context("invalid media API credentials")?;

    let rooms = match config.service_url.as_deref() {
        Some(url) => RoomService::LiveKit(
            LiveKitRoomClient::new(url, tokens.clone(), config.request_timeout)
                .context("failed to configure media room service")?,
        ),
        None => {
            tracing::warn!("SCROLLLIVE_LIVEKIT_URL is not set; using in-memory media rooms");
            RoomService::memory()
        }
    };

    Ok((tokens, rooms))
}
