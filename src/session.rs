use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CHANNEL_ID_PREFIX: &str = "Bot-";
pub const BRIDGE_KEY_PREFIX: &str = "BRG-";
const BRIDGE_KEY_LEN: usize = 5;
const ASSISTANT_ID_PREFIX: &str = "AI-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    #[serde(alias = "connecting", alias = "waiting")]
    Disconnected,
    Connected,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "type")]
    pub direction: Direction,
}

impl ChatMessage {
    pub fn new(direction: Direction, sender_name: impl Into<String>, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        let prefix = match direction {
            Direction::Inbound => "",
            Direction::Outbound => ASSISTANT_ID_PREFIX,
        };
        Self {
            id: message_id(prefix, at),
            sender_name: sender_name.into(),
            text: text.into(),
            timestamp: at,
            direction,
        }
    }
}

fn message_id(prefix: &str, at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", prefix, at.timestamp_millis(), &suffix[..8])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSession {
    pub id: String,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub ai_profile_id: String,
    #[serde(default)]
    pub bridge_key: String,
    #[serde(default, alias = "realQrData")]
    pub qr_payload: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ChannelSession {
    pub fn new(ai_profile_id: impl Into<String>, existing: &[ChannelSession]) -> Self {
        let id = unique(generate_channel_id, |c| existing.iter().any(|s| s.id == c));
        let bridge_key = unique(generate_bridge_key, |c| existing.iter().any(|s| s.bridge_key == c));
        Self {
            id,
            status: ChannelStatus::Disconnected,
            ai_profile_id: ai_profile_id.into(),
            bridge_key,
            qr_payload: None,
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ChannelStatus::Connected
    }

    pub fn transition(&mut self, to: ChannelStatus) -> bool {
        if self.status == to {
            return false;
        }
        self.status = to;
        true
    }

    // never stamped earlier than the last message, even if the clock steps back
    pub fn record(&mut self, direction: Direction, sender_name: &str, text: &str) -> ChatMessage {
        let now = Utc::now();
        let at = self.messages.last().map_or(now, |m| m.timestamp.max(now));
        let msg = ChatMessage::new(direction, sender_name, text, at);
        self.messages.push(msg.clone());
        msg
    }

    pub fn clear_messages(&mut self) -> usize {
        let n = self.messages.len();
        self.messages.clear();
        n
    }
}

fn unique(generate: fn() -> String, taken: impl Fn(&str) -> bool) -> String {
    loop {
        let candidate = generate();
        if !taken(&candidate) {
            return candidate;
        }
    }
}

pub fn generate_channel_id() -> String {
    let n: u32 = rand::thread_rng().gen_range(100..1_000_000);
    format!("{}{}", CHANNEL_ID_PREFIX, n)
}

pub fn generate_bridge_key() -> String {
    let key: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(BRIDGE_KEY_LEN)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("{}{}", BRIDGE_KEY_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_channel_starts_disconnected_and_empty() {
        let s = ChannelSession::new("p1", &[]);
        assert_eq!(s.status, ChannelStatus::Disconnected);
        assert_eq!(s.ai_profile_id, "p1");
        assert!(s.id.starts_with(CHANNEL_ID_PREFIX));
        assert!(s.bridge_key.starts_with(BRIDGE_KEY_PREFIX));
        assert_eq!(s.bridge_key.len(), BRIDGE_KEY_PREFIX.len() + 5);
        assert!(s.qr_payload.is_none());
        assert!(s.messages.is_empty());
    }

    #[test]
    fn hundred_channels_have_distinct_ids_and_keys() {
        let mut all: Vec<ChannelSession> = Vec::new();
        for _ in 0..100 {
            let s = ChannelSession::new("p1", &all);
            all.push(s);
        }
        let ids: HashSet<_> = all.iter().map(|s| s.id.clone()).collect();
        let keys: HashSet<_> = all.iter().map(|s| s.bridge_key.clone()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(keys.len(), 100);
    }

    #[test]
    fn transition_reports_change_only_once() {
        let mut s = ChannelSession::new("p1", &[]);
        assert!(s.transition(ChannelStatus::Connected));
        assert!(!s.transition(ChannelStatus::Connected));
        assert!(s.is_connected());
        assert!(s.transition(ChannelStatus::Disconnected));
        assert!(!s.is_connected());
    }

    #[test]
    fn legacy_document_decodes() {
        let raw = r#"[{
            "id": "Bot-412",
            "status": "connecting",
            "aiProfileId": "farida-main",
            "bridgeKey": "EHAB-AB12C",
            "realQrData": null,
            "messages": [
                {"id": "1700000000000", "senderName": "Ahmed", "text": "hi",
                 "timestamp": "2024-01-01T10:00:00.000Z", "type": "inbound"}
            ]
        }]"#;
        let sessions: Vec<ChannelSession> = serde_json::from_str(raw).unwrap();
        assert_eq!(sessions[0].status, ChannelStatus::Disconnected);
        assert_eq!(sessions[0].messages[0].direction, Direction::Inbound);
        assert_eq!(sessions[0].messages[0].sender_name, "Ahmed");
    }

    #[test]
    fn serializes_camel_case_fields() {
        let mut s = ChannelSession::new("p1", &[]);
        s.record(Direction::Inbound, "Sara", "help");
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["aiProfileId"], "p1");
        assert_eq!(v["status"], "disconnected");
        assert!(v["qrPayload"].is_null());
        assert_eq!(v["messages"][0]["senderName"], "Sara");
        assert_eq!(v["messages"][0]["direction"], "inbound");
    }

    #[test]
    fn message_ids_distinct_within_same_millisecond() {
        let now = Utc::now();
        let a = ChatMessage::new(Direction::Outbound, "Assistant", "x", now);
        let b = ChatMessage::new(Direction::Outbound, "Assistant", "x", now);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("AI-"));
        assert!(!ChatMessage::new(Direction::Inbound, "Sara", "x", now).id.starts_with("AI-"));
    }

    #[test]
    fn recorded_timestamps_never_go_backwards() {
        let mut s = ChannelSession::new("p1", &[]);
        let ahead = Utc::now() + chrono::Duration::seconds(30);
        s.messages.push(ChatMessage::new(Direction::Inbound, "Ahmed", "from the future", ahead));
        let next = s.record(Direction::Outbound, "Assistant", "reply");
        assert_eq!(next.timestamp, ahead);
        assert_eq!(s.messages.last(), Some(&next));
        assert!(s.messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
