use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{StorageError, UnknownElementKindSnafu};
use super::ids::{SegmentId, SequenceId, UserId};

/// The three independently versioned parts of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Text,
    Image,
    Audio,
}

impl ElementKind {
    pub const ALL: [ElementKind; 3] = [ElementKind::Text, ElementKind::Image, ElementKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Text => "text",
            ElementKind::Image => "image",
            ElementKind::Audio => "audio",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ElementKind::Text),
            "image" => Ok(ElementKind::Image),
            "audio" => Ok(ElementKind::Audio),
            _ => UnknownElementKindSnafu {
                stage: "element-kind-parse",
                raw: raw.to_string(),
            }
            .fail(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    /// Username as originally cased; lookups are case-insensitive.
    pub username: String,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: SequenceId,
    pub owner_id: UserId,
    pub name: String,
    /// Compiled script cached at the last save, if any.
    pub script: Option<String>,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub id: SegmentId,
    pub sequence_id: SequenceId,
    pub position: u32,
    /// Stable asset-naming label, independent of the live position.
    pub label: Option<String>,
    pub text_version: Option<u32>,
    pub image_version: Option<u32>,
    pub audio_version: Option<u32>,
}

impl SegmentRecord {
    pub fn active_version(&self, kind: ElementKind) -> Option<u32> {
        match kind {
            ElementKind::Text => self.text_version,
            ElementKind::Image => self.image_version,
            ElementKind::Audio => self.audio_version,
        }
    }
}

/// Every version of one element and the active one, as written in a single batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementHistory {
    pub versions: Vec<String>,
    pub active: Option<u32>,
}

/// One segment of a sequence written whole; its position is its index in the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSegment {
    pub label: String,
    pub text: ElementHistory,
    pub image: ElementHistory,
    pub audio: ElementHistory,
}

impl NewSegment {
    pub fn element(&self, kind: ElementKind) -> &ElementHistory {
        match kind {
            ElementKind::Text => &self.text,
            ElementKind::Image => &self.image,
            ElementKind::Audio => &self.audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_kind_parses_case_insensitively() {
        assert_eq!("Image".parse::<ElementKind>().expect("kind"), ElementKind::Image);
        assert_eq!(ElementKind::Audio.to_string(), "audio");
        assert!(matches!(
            "video".parse::<ElementKind>(),
            Err(StorageError::UnknownElementKind { .. })
        ));
    }
}
