//! Wire types for the remote catalog API.

use serde::Deserialize;

use crate::ids::SourceId;

/// One node of an item's remote file tree.
///
/// The wire format tags each node with a `type` field; folders carry an
/// ordered `children` array, files carry `mediaUrl` and `remoteFileId`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileTreeEntry {
    /// A directory with an ordered list of children.
    Folder {
        /// Display name of the folder.
        title: String,
        /// Child entries, in catalog order.
        children: Vec<FileTreeEntry>,
    },
    /// A downloadable leaf file.
    File {
        /// Display name of the file, including extension.
        title: String,
        /// Media download URL.
        #[serde(rename = "mediaUrl")]
        media_url: String,
        /// Remote file id consumed by the hash verification endpoint.
        #[serde(rename = "remoteFileId")]
        remote_file_id: u64,
    },
}

impl FileTreeEntry {
    /// Returns the display name of this entry.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Folder { title, .. } | Self::File { title, .. } => title,
        }
    }
}

/// Item metadata as returned by the catalog.
///
/// Only the addressing fields are modeled; the full payload is retained
/// verbatim in `raw` so the on-disk snapshot reproduces the catalog's answer
/// byte-for-byte semantics-wise.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemMetadata {
    /// Remote numeric id.
    pub id: SourceId,
    /// Human-readable source name (`RJ...`), spelled `source_id` on the wire.
    #[serde(rename = "source_id")]
    pub source_name: String,
    /// Work title.
    #[serde(default)]
    pub title: Option<String>,
    /// The complete metadata object.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl ItemMetadata {
    /// Parses metadata from a raw catalog payload, keeping the payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error when the addressing fields are
    /// missing or malformed.
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut meta: Self = serde_json::from_value(raw.clone())?;
        meta.raw = raw;
        Ok(meta)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_deserializes_tagged_nodes() {
        let json = serde_json::json!([
            {
                "type": "folder",
                "title": "v1",
                "children": [
                    {"type": "file", "title": "a.mp3", "mediaUrl": "https://cdn/a", "remoteFileId": 11},
                ]
            },
            {"type": "file", "title": "readme.txt", "mediaUrl": "https://cdn/r", "remoteFileId": 12}
        ]);
        let tree: Vec<FileTreeEntry> = serde_json::from_value(json).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].title(), "v1");
        match &tree[0] {
            FileTreeEntry::Folder { children, .. } => assert_eq!(children.len(), 1),
            FileTreeEntry::File { .. } => panic!("expected folder"),
        }
    }

    #[test]
    fn test_metadata_keeps_raw_payload() {
        let raw = serde_json::json!({
            "id": 123456,
            "source_id": "RJ123456",
            "title": "sample",
            "tags": [{"name": "binaural"}]
        });
        let meta = ItemMetadata::from_raw(raw.clone()).unwrap();
        assert_eq!(meta.id, SourceId(123_456));
        assert_eq!(meta.source_name, "RJ123456");
        assert_eq!(meta.title.as_deref(), Some("sample"));
        assert_eq!(meta.raw, raw);
    }
}
