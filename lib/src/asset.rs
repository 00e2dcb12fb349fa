use std::fmt;
use std::sync::Arc;
use std::path::Path;

use crate::meta::{Metadata, MetaKey};
use crate::transform::TransformError;

/// The bytes of an asset. Files that decode as UTF-8 are kept as text.
#[derive(Clone, PartialEq, Eq)]
pub enum Content {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Content {
    pub fn from_bytes(bytes: Vec<u8>) -> Content {
        match String::from_utf8(bytes) {
            Ok(string) => Content::Text(string.into()),
            Err(e) => Content::Binary(e.into_bytes().into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(s) => s.as_bytes(),
            Content::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            Content::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value.into())
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.into())
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Binary(value.into())
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Text(s) if s.len() <= 64 => write!(f, "Text({s:?})"),
            Content::Text(s) => write!(f, "Text({} bytes)", s.len()),
            Content::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
        }
    }
}

/// One unit of content flowing through a pipeline.
///
/// Assets are immutable: every `with_*` method returns a new asset that
/// shares unchanged parts with `self`.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    path: Arc<Path>,
    content: Content,
    metadata: Metadata,
}

impl Asset {
    pub fn new<P: AsRef<Path>, C: Into<Content>>(path: P, content: C) -> Self {
        Asset {
            path: Arc::from(path.as_ref()),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    /// Path relative to the source base before writing, and to the output
    /// directory after.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }

    pub fn file_stem(&self) -> &str {
        self.path.file_stem().and_then(|s| s.to_str()).unwrap_or_default()
    }

    /// The content as text, or an error attributed to `stage`.
    pub fn text(&self, stage: &'static str) -> Result<&str, TransformError> {
        self.content.as_text()
            .ok_or_else(|| TransformError::new(stage, self.path(), "expected text content, found binary"))
    }

    pub fn with_path<P: AsRef<Path>>(&self, path: P) -> Asset {
        Asset { path: Arc::from(path.as_ref()), ..self.clone() }
    }

    pub fn with_content<C: Into<Content>>(&self, content: C) -> Asset {
        Asset { content: content.into(), ..self.clone() }
    }

    pub fn with_metadata(&self, metadata: Metadata) -> Asset {
        Asset { metadata, ..self.clone() }
    }

    pub fn with_meta<K: MetaKey, V: Into<K::Value>>(&self, key: K, value: V) -> Asset {
        self.with_metadata(self.metadata.with(key, value))
    }
}
