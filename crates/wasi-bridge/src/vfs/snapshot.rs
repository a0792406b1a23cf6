use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A JSON-seedable description of a filesystem tree.
///
/// Maps absolute paths to `null` for a directory, or to the file content as a
/// UTF-8 string or an array of bytes.
///
/// ```json
/// { "/": null, "/data/hello.txt": "hello", "/bin/blob": [0, 97, 115, 109] }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VfsSnapshot(BTreeMap<String, Option<FileContent>>);

impl Default for VfsSnapshot {
    fn default() -> Self {
        Self(BTreeMap::from([("/".to_string(), None)]))
    }
}

impl VfsSnapshot {
    pub fn new(entries: BTreeMap<String, Option<FileContent>>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &BTreeMap<String, Option<FileContent>> {
        &self.0
    }

    pub fn with_dir(mut self, path: impl Into<String>) -> Self {
        self.0.insert(path.into(), None);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<FileContent>) -> Self {
        self.0.insert(path.into(), Some(content.into()));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    Text(String),
    Bytes(Vec<u8>),
}

impl FileContent {
    /// Text when the bytes are valid UTF-8, raw bytes otherwise.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => FileContent::Text(text),
            Err(err) => FileContent::Bytes(err.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(text) => text.as_bytes(),
            FileContent::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        FileContent::Text(text.to_string())
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        FileContent::Text(text)
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        FileContent::Bytes(bytes)
    }
}
