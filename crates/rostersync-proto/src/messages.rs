//! Snapshot and delta payloads.

use serde::{Deserialize, Serialize};

/// One visitor in a roster snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Visitor identifier
    #[serde(rename = "n")]
    pub id: String,
    /// Role or status value
    #[serde(rename = "r")]
    pub role: String,
}

impl RosterEntry {
    /// Create a new roster entry.
    #[must_use]
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

/// One incremental change to the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Visitor identifier
    #[serde(rename = "n")]
    pub id: String,
    /// Role or status value
    #[serde(rename = "r")]
    pub role: String,
    /// State marker, carried verbatim from the wire
    #[serde(rename = "s")]
    pub state: String,
}

impl DeltaEntry {
    /// Create a new delta entry.
    #[must_use]
    pub fn new(id: impl Into<String>, role: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            state: state.into(),
        }
    }

    /// Classify the state marker.
    #[must_use]
    pub fn kind(&self) -> DeltaKind {
        DeltaKind::from_marker(&self.state)
    }
}

/// Semantics of a delta state marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Visitor joined
    Added,
    /// Visitor changed role or status
    Updated,
    /// Visitor left
    Removed,
    /// Marker not recognized
    Unknown,
}

impl DeltaKind {
    /// Parse a wire marker. Matching is case-insensitive.
    #[must_use]
    pub fn from_marker(marker: &str) -> Self {
        match marker.to_ascii_lowercase().as_str() {
            "add" | "added" | "a" => Self::Added,
            "update" | "updated" | "u" => Self::Updated,
            "remove" | "removed" | "r" | "delete" | "d" => Self::Removed,
            _ => Self::Unknown,
        }
    }
}

/// Parse a snapshot frame into the full roster.
///
/// # Errors
///
/// Returns error if the frame is not UTF-8 or not a JSON array of entries.
pub fn parse_snapshot(frame: &[u8]) -> Result<Vec<RosterEntry>, PayloadError> {
    serde_json::from_str(frame_text(frame)?).map_err(|e| PayloadError::Parse(e.to_string()))
}

/// Parse a delta frame into one ordered batch.
///
/// # Errors
///
/// Returns error if the frame is not UTF-8 or not a JSON array of entries.
pub fn parse_delta(frame: &[u8]) -> Result<Vec<DeltaEntry>, PayloadError> {
    serde_json::from_str(frame_text(frame)?).map_err(|e| PayloadError::Parse(e.to_string()))
}

/// Serialize a snapshot to its wire form.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_snapshot(entries: &[RosterEntry]) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(entries).map_err(|e| PayloadError::Serialize(e.to_string()))
}

/// Serialize a delta batch to its wire form.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_delta(batch: &[DeltaEntry]) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(batch).map_err(|e| PayloadError::Serialize(e.to_string()))
}

/// Decode a text frame, dropping one trailing NUL terminator if present.
fn frame_text(frame: &[u8]) -> Result<&str, PayloadError> {
    let body = frame.strip_suffix(&[0]).unwrap_or(frame);
    std::str::from_utf8(body).map_err(|e| PayloadError::Encoding(e.to_string()))
}

/// Errors for payload encoding and decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// Frame is not valid UTF-8
    #[error("frame is not valid UTF-8: {0}")]
    Encoding(String),
    /// Frame is not a valid payload
    #[error("payload parse error: {0}")]
    Parse(String),
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_snapshot_frame() {
        let frame = br#"[{"n":"u0","r":"v"},{"n":"u1","r":"m"}]"#;

        let roster = parse_snapshot(frame).unwrap();

        assert_eq!(
            roster,
            vec![RosterEntry::new("u0", "v"), RosterEntry::new("u1", "m")]
        );
    }

    #[test]
    fn parse_delta_keeps_order_and_marker() {
        let frame = br#"[{"n":"u1","r":"v","s":"add"},{"n":"u0","r":"v","s":"remove"}]"#;

        let batch = parse_delta(frame).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "u1");
        assert_eq!(batch[0].state, "add");
        assert_eq!(batch[1].kind(), DeltaKind::Removed);
    }

    #[test]
    fn parse_tolerates_nul_terminator() {
        let frame = b"[{\"n\":\"u0\",\"r\":\"v\"}]\0";

        let roster = parse_snapshot(frame).unwrap();

        assert_eq!(roster, vec![RosterEntry::new("u0", "v")]);
    }

    #[test]
    fn parse_empty_batch() {
        assert!(parse_delta(b"[]").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_json() {
        let result = parse_delta(b"[{\"n\":\"u1\"");
        assert!(matches!(result, Err(PayloadError::Parse(_))));
    }

    #[test]
    fn parse_rejects_missing_marker() {
        let result = parse_delta(br#"[{"n":"u1","r":"v"}]"#);
        assert!(matches!(result, Err(PayloadError::Parse(_))));
    }

    #[test]
    fn parse_rejects_invalid_utf8() {
        let result = parse_snapshot(&[0xff, 0xfe]);
        assert!(matches!(result, Err(PayloadError::Encoding(_))));
    }

    #[test]
    fn encoded_delta_uses_short_keys() {
        let bytes = encode_delta(&[DeltaEntry::new("u1", "v", "add")]).unwrap();
        assert_eq!(bytes, br#"[{"n":"u1","r":"v","s":"add"}]"#);
    }

    #[test]
    fn marker_classification() {
        assert_eq!(DeltaKind::from_marker("ADD"), DeltaKind::Added);
        assert_eq!(DeltaKind::from_marker("updated"), DeltaKind::Updated);
        assert_eq!(DeltaKind::from_marker("d"), DeltaKind::Removed);
        assert_eq!(DeltaKind::from_marker("promote"), DeltaKind::Unknown);
    }
}
