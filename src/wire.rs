//! # Stream Protocol Messages
//!
//! JSON payloads carried inside pub/sub messages:
//!
//! | Topic | Message | Variants |
//! |-------|---------|----------|
//! | `<ns>/stream-directory` | [`DirectoryMessage`] | announce, heartbeat, deregister, query, response |
//! | `<ns>/stream/<id>` | [`StreamMessage`] | metadata, audio, iq_data, end |
//!
//! Every message is an object with a `type` tag and camelCase keys.
//! Binary chunks travel base64-encoded in `chunk` (audio) or `data` (IQ).
//! Free-form metadata keys survive a decode/encode cycle through
//! [`StreamMetadata::extra`].

use serde::{Deserialize, Deserializer, Serialize};

use crate::identity::Identity;

pub const DEFAULT_NAMESPACE: &str = "argus-defense";

pub fn directory_topic(namespace: &str) -> String {
    format!("{}/stream-directory", namespace)
}

pub fn stream_topic(namespace: &str, stream_id: &str) -> String {
    format!("{}/stream/{}", namespace, stream_id)
}

#[derive(Debug)]
pub struct DecodeError(serde_json::Error);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed message: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Descriptive fields of a stream. All are optional; unknown keys are kept
/// in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(
        rename = "system_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(
        rename = "talkgroup_id",
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub talkgroup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Hex identity of the announcing node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_addrs: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StreamMetadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Talkgroup ids are numeric in some catalogs and strings in others.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Exact-match filter over directory entries. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Compared against `system_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl StreamFilter {
    pub fn by_system(system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, publisher: &Identity, metadata: &StreamMetadata) -> bool {
        if let Some(p) = &self.publisher
            && !p.eq_ignore_ascii_case(&publisher.to_hex())
        {
            return false;
        }
        if let Some(system) = &self.system
            && metadata.system_name.as_deref() != Some(system.as_str())
        {
            return false;
        }
        if let Some(category) = &self.category
            && metadata.category.as_deref() != Some(category.as_str())
        {
            return false;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.system.is_none() && self.category.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedStream {
    pub stream_id: String,
    pub metadata: StreamMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum DirectoryMessage {
    Announce {
        stream_id: String,
        metadata: StreamMetadata,
    },
    Heartbeat {
        stream_id: String,
        publisher: String,
        timestamp: u64,
    },
    Deregister {
        stream_id: String,
        publisher: String,
        timestamp: u64,
    },
    Query {
        #[serde(default)]
        filter: StreamFilter,
        request_id: String,
        from: String,
        timestamp: u64,
    },
    Response {
        request_id: String,
        streams: Vec<AnnouncedStream>,
        from: String,
        timestamp: u64,
    },
}

impl DirectoryMessage {
    pub fn encode(&self) -> Vec<u8> {
        // Only plain data types: serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Deregister { .. } => "deregister",
            Self::Query { .. } => "query",
            Self::Response { .. } => "response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum StreamMessage {
    Metadata {
        stream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        metadata: StreamMetadata,
        timestamp: u64,
    },
    Audio {
        stream_id: String,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
        timestamp: u64,
    },
    IqData {
        stream_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        timestamp: u64,
    },
    End {
        stream_id: String,
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl StreamMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError)
    }

    pub fn stream_id(&self) -> &str {
        match self {
            Self::Metadata { stream_id, .. }
            | Self::Audio { stream_id, .. }
            | Self::IqData { stream_id, .. }
            | Self::End { stream_id, .. } => stream_id,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Base64 size of `n` raw bytes, padding included.
pub const fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use serde_json::json;

    #[test]
    fn topics_follow_namespace() {
        assert_eq!(directory_topic("argus-defense"), "argus-defense/stream-directory");
        assert_eq!(stream_topic("ns", "fire-1"), "ns/stream/fire-1");
    }

    #[test]
    fn announce_uses_wire_key_names() {
        let mut metadata = StreamMetadata::named("Fire Dispatch");
        metadata.system_name = Some("county".into());
        metadata.talkgroup_id = Some("1201".into());
        metadata.audio_url = Some("http://x/a.m4a".into());
        metadata.publisher_addrs = Some(vec!["127.0.0.1:9000".into()]);

        let msg = DirectoryMessage::Announce {
            stream_id: "fire-1".into(),
            metadata,
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();

        assert_eq!(value["type"], "announce");
        assert_eq!(value["streamId"], "fire-1");
        assert_eq!(value["metadata"]["name"], "Fire Dispatch");
        assert_eq!(value["metadata"]["system_name"], "county");
        assert_eq!(value["metadata"]["talkgroup_id"], "1201");
        assert_eq!(value["metadata"]["audioUrl"], "http://x/a.m4a");
        assert_eq!(value["metadata"]["publisherAddrs"][0], "127.0.0.1:9000");
        assert!(value["metadata"].get("category").is_none());
    }

    #[test]
    fn unknown_metadata_keys_are_preserved() {
        let raw = json!({
            "type": "announce",
            "streamId": "s1",
            "metadata": { "name": "n", "frequency": 460.125, "talkgroup_id": 42 }
        });
        let msg = DirectoryMessage::decode(raw.to_string().as_bytes()).unwrap();

        let DirectoryMessage::Announce { metadata, .. } = &msg else {
            panic!("expected announce, got {:?}", msg);
        };
        assert_eq!(metadata.talkgroup_id.as_deref(), Some("42"));
        assert_eq!(metadata.extra["frequency"], json!(460.125));

        let again: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(again["metadata"]["frequency"], json!(460.125));
    }

    #[test]
    fn query_without_filter_decodes() {
        let raw = json!({
            "type": "query",
            "requestId": "abc-1",
            "from": "abc",
            "timestamp": 1
        });
        match DirectoryMessage::decode(raw.to_string().as_bytes()).unwrap() {
            DirectoryMessage::Query { filter, request_id, .. } => {
                assert!(filter.is_empty());
                assert_eq!(request_id, "abc-1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn chunks_are_base64_under_their_own_keys() {
        let audio = StreamMessage::Audio {
            stream_id: "s1".into(),
            chunk: b"AAA".to_vec(),
            timestamp: 5,
        };
        let value: serde_json::Value = serde_json::from_slice(&audio.encode()).unwrap();
        assert_eq!(value["type"], "audio");
        assert_eq!(value["chunk"], "QUFB");

        let iq = StreamMessage::IqData {
            stream_id: "s1".into(),
            data: vec![0, 1, 2],
            timestamp: 5,
        };
        let value: serde_json::Value = serde_json::from_slice(&iq.encode()).unwrap();
        assert_eq!(value["type"], "iq_data");
        assert_eq!(value["data"], "AAEC");
        assert_eq!(StreamMessage::decode(&iq.encode()).unwrap(), iq);
    }

    #[test]
    fn end_totals_are_camel_case() {
        let end = StreamMessage::End {
            stream_id: "s1".into(),
            timestamp: 9,
            total_bytes: Some(6),
            total_chunks: Some(2),
            reason: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&end.encode()).unwrap();
        assert_eq!(value["totalBytes"], 6);
        assert_eq!(value["totalChunks"], 2);
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        assert!(StreamMessage::decode(b"not json").is_err());
        assert!(StreamMessage::decode(br#"{"type":"audio","streamId":"s","chunk":"%%%","timestamp":1}"#).is_err());
        assert!(DirectoryMessage::decode(br#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn filter_matches_exact_fields() {
        let publisher = Keypair::generate().identity();
        let other = Keypair::generate().identity();
        let metadata = StreamMetadata {
            system_name: Some("X".into()),
            category: Some("fire".into()),
            ..Default::default()
        };

        assert!(StreamFilter::default().matches(&publisher, &metadata));
        assert!(StreamFilter::by_system("X").matches(&publisher, &metadata));
        assert!(!StreamFilter::by_system("Y").matches(&publisher, &metadata));
        assert!(!StreamFilter::by_system("X").matches(&publisher, &StreamMetadata::default()));

        let by_publisher = StreamFilter {
            publisher: Some(publisher.to_hex()),
            category: Some("fire".into()),
            ..Default::default()
        };
        assert!(by_publisher.matches(&publisher, &metadata));
        assert!(!by_publisher.matches(&other, &metadata));
    }

    #[test]
    fn base64_len_accounts_for_padding() {
        assert_eq!(base64_len(3), 4);
        assert_eq!(base64_len(4), 8);
        assert_eq!(base64_len(32 * 1024), 43_692);
    }
}
