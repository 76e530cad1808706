use std::time::Duration;

use scrolllive_common::protocol::ws::CURRENT_PROTOCOL_VERSION;

const WS_SOURCE: &str = include_str!("../src/ws/mod.rs");
const CONFIG_SOURCE: &str = include_str!("../src/config.rs");
const VALIDATION_SOURCE: &str = include_str!("../src/validation.rs");

#[test]
fn websocket_contract_ping_is_shorter_than_idle_timeout() {
    let ping = parse_secs_const(WS_SOURCE, "PING_INTERVAL");
    let idle = parse_secs_const(WS_SOURCE, "IDLE_TIMEOUT");

    assert_eq!(ping, Duration::from_secs(15));
    assert_eq!(idle, Duration::from_secs(45));
    assert!(ping < idle, "pings must be sent before the idle timeout fires");
}

#[test]
fn websocket_contract_idle_timeout_matches_default_lease_ttl() {
    let idle = parse_secs_const(WS_SOURCE, "IDLE_TIMEOUT");
    assert!(
        CONFIG_SOURCE.contains(&format!("lease_ttl: Duration::from_secs({})", idle.as_secs())),
        "default participant lease must outlive the same idle window the socket allows"
    );
}

#[test]
fn websocket_contract_frame_limit_is_16_kib() {
    assert!(VALIDATION_SOURCE.contains("pub const MAX_WS_FRAME_BYTES: usize = 16 * 1024;"));
    assert!(WS_SOURCE.contains("max_frame_size(MAX_WS_FRAME_BYTES)"));
    assert!(WS_SOURCE.contains("check_ws_frame_size("));
}

#[test]
fn websocket_contract_protocol_version_is_feed_v1() {
    assert_eq!(CURRENT_PROTOCOL_VERSION, "scrolllive-feed.v1");
    assert!(WS_SOURCE.contains("protocol_version: CURRENT_PROTOCOL_VERSION"));
}

#[test]
fn websocket_contract_snapshot_precedes_live_events() {
    let subscribe = WS_SOURCE.find("feed().subscribe(").expect("feed subscription");
    let snapshot = WS_SOURCE.find("initial_frames(&hub").expect("initial snapshot");
    assert!(
        subscribe < snapshot,
        "the feed must be subscribed before the snapshot is read so no event is lost"
    );
}

#[test]
fn websocket_contract_only_accepts_client_frames() {
    for token in ["WsMessage::Heartbeat", "WsMessage::SendChat", "message type is not accepted"] {
        assert!(WS_SOURCE.contains(token), "frame dispatch must handle `{token}`");
    }
}

fn parse_secs_const(source: &str, name: &str) -> Duration {
    let prefix = format!("const {name}: Duration = Duration::from_secs(");
    let start = source
        .find(&prefix)
        .unwrap_or_else(|| panic!("constant `{name}` should be declared"))
        + prefix.len();
    let digits: String = source[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    Duration::from_secs(digits.parse().unwrap_or_else(|_| panic!("`{name}` should be numeric")))
}
