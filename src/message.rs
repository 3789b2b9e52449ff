//! Delivery messages
//!
//! The unit of work carried from the publisher to the relay over the broker.
//! On the wire a message is JSON with PascalCase fields and base64 content:
//!
//! ```json
//! { "FileContent": "aGVsbG8=", "FileExtension": ".pdf", "FileName": "report" }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::hash::ContentHash;

/// A file awaiting delivery to remote storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeliveryMessage {
    /// Raw file bytes
    #[serde(rename = "FileContent", with = "base64_bytes")]
    pub content: Vec<u8>,

    /// Extension including the leading dot, or empty
    #[serde(rename = "FileExtension", default)]
    pub extension: String,

    /// Original file name without directories or extension
    #[serde(rename = "FileName", default)]
    pub name: String,
}

impl DeliveryMessage {
    /// Build a message from content and the client-supplied file name
    pub fn new(content: Vec<u8>, original_file_name: &str) -> Self {
        let (name, extension) = split_file_name(original_file_name);
        Self {
            content,
            extension,
            name,
        }
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::compute(&self.content)
    }

    /// `<name><extension>`
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.extension)
    }

    /// Destination path under the remote root
    pub fn remote_path(&self, root: &str) -> String {
        let root = root.trim_end_matches('/');
        if root.is_empty() {
            self.file_name()
        } else {
            format!("{}/{}", root, self.file_name())
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a broker payload.
    ///
    /// Producers that omit `FileName` get the content hash as the name so the
    /// remote path is still unique and stable.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut message: DeliveryMessage = serde_json::from_slice(body)?;
        message.name = file_stem(&message.name).to_string();
        if message.name.is_empty() {
            message.name = message.content_hash().to_string();
        }
        Ok(message)
    }

    /// Best-effort hash recovery from a payload that failed to decode.
    ///
    /// Returns `None` unless the body is JSON carrying a valid base64
    /// `FileContent` string.
    pub fn salvage_hash(body: &[u8]) -> Option<ContentHash> {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        let encoded = value.get("FileContent")?.as_str()?;
        let content = base64_bytes::decode_str(encoded).ok()?;
        Some(ContentHash::compute(&content))
    }
}

/// Split a client file name into `(name, extension)`.
///
/// Directory components (either separator) are dropped. The extension is the
/// text from the last dot, dot included. A leading dot does not start an
/// extension and a trailing dot yields no extension.
pub fn split_file_name(original: &str) -> (String, String) {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    match base.rfind('.') {
        Some(0) | None => (base.to_string(), String::new()),
        Some(idx) if idx == base.len() - 1 => (base[..idx].to_string(), String::new()),
        Some(idx) => (base[..idx].to_string(), base[idx..].to_string()),
    }
}

fn file_stem(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or_default().trim()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        decode_str(&encoded).map_err(serde::de::Error::custom)
    }

    pub fn decode_str(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_file_name() {
        assert_eq!(split_file_name("report.pdf"), ("report".into(), ".pdf".into()));
        assert_eq!(
            split_file_name("archive.tar.gz"),
            ("archive.tar".into(), ".gz".into())
        );
        assert_eq!(split_file_name("README"), ("README".into(), String::new()));
        assert_eq!(split_file_name(".env"), (".env".into(), String::new()));
        assert_eq!(split_file_name("notes."), ("notes".into(), String::new()));
    }

    #[test]
    fn test_split_strips_directories() {
        assert_eq!(
            split_file_name("C:\\Users\\me\\scan.png"),
            ("scan".into(), ".png".into())
        );
        assert_eq!(
            split_file_name("../../etc/passwd"),
            ("passwd".into(), String::new())
        );
    }

    #[test]
    fn test_remote_path() {
        let message = DeliveryMessage::new(b"X".to_vec(), "report.pdf");
        assert_eq!(message.remote_path("/upload"), "/upload/report.pdf");
        assert_eq!(message.remote_path("/upload/"), "/upload/report.pdf");
        assert_eq!(message.remote_path(""), "report.pdf");
    }

    #[test]
    fn test_wire_format() {
        let message = DeliveryMessage::new(b"hello".to_vec(), "report.pdf");
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();

        assert_eq!(json["FileContent"], "aGVsbG8=");
        assert_eq!(json["FileExtension"], ".pdf");
        assert_eq!(json["FileName"], "report");

        let decoded = DeliveryMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_without_file_name_uses_hash() {
        let body = br#"{"FileContent":"aGVsbG8=","FileExtension":".txt"}"#;
        let decoded = DeliveryMessage::decode(body).unwrap();

        assert_eq!(decoded.content, b"hello");
        assert_eq!(decoded.name, ContentHash::compute(b"hello").to_string());
        assert_eq!(decoded.extension, ".txt");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(DeliveryMessage::decode(b"not json").is_err());
        assert!(DeliveryMessage::decode(br#"{"FileContent":"!!!"}"#).is_err());
        assert!(DeliveryMessage::decode(br#"{"FileExtension":".txt"}"#).is_err());
    }

    #[test]
    fn test_salvage_hash() {
        // FileExtension has the wrong type, but the content is intact
        let body = br#"{"FileContent":"aGVsbG8=","FileExtension":42}"#;
        assert!(DeliveryMessage::decode(body).is_err());
        assert_eq!(
            DeliveryMessage::salvage_hash(body),
            Some(ContentHash::compute(b"hello"))
        );

        assert_eq!(DeliveryMessage::salvage_hash(b"\x00\x01"), None);
        assert_eq!(DeliveryMessage::salvage_hash(br#"{"FileContent":"!!!"}"#), None);
    }
}
