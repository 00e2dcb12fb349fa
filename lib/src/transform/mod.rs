//! Transforms: pure functions from one asset to zero or more assets.
//!
//! A [`Transform`] never touches the file system. Transforms that need to
//! see other source files, such as partials pulled in by an `@import` or an
//! include directive, ask for a [`Context`] by returning `true` from
//! [`Transform::needs_sources()`]; the pipeline then loads a [`Snapshot`] of
//! the source base before running and hands it over read-only.
//!
//! A [`Merge`] is the one barrier: it receives every asset that survived the
//! stages before it and may combine them, as [`SvgStore`] does.

mod builtin;
mod style;
mod raster;
mod script;
mod sprite;

pub use builtin::*;
pub use style::*;
pub use raster::*;
pub use script::*;
pub use sprite::*;

use std::fmt;
use std::sync::Arc;
use std::path::{Path, PathBuf};

use crate::asset::Asset;
use crate::error::ErrorDetail;
use crate::source::Snapshot;
use crate::util::normalize;

pub trait Transform: Send + Sync {
    /// Short stage name used in errors, logs and the `stages` metadata.
    fn name(&self) -> &'static str;

    fn apply(&self, asset: &Asset, cx: &Context) -> Result<Vec<Asset>, TransformError>;

    fn needs_sources(&self) -> bool {
        false
    }
}

pub trait Merge: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, assets: Vec<Asset>, cx: &Context) -> Result<Vec<Asset>, TransformError>;

    fn needs_sources(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub enum Stage {
    Map(Arc<dyn Transform>),
    Merge(Arc<dyn Merge>),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Map(t) => t.name(),
            Stage::Merge(m) => m.name(),
        }
    }

    pub fn needs_sources(&self) -> bool {
        match self {
            Stage::Map(t) => t.needs_sources(),
            Stage::Merge(m) => m.needs_sources(),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Map(t) => write!(f, "Map({})", t.name()),
            Stage::Merge(m) => write!(f, "Merge({})", m.name()),
        }
    }
}

/// Read-only view of the pipeline's source base.
#[derive(Debug, Clone)]
pub struct Context {
    sources: Option<Snapshot>,
}

impl Context {
    /// A context without sources, for pipelines that do not need them.
    pub fn empty() -> Self {
        Context { sources: None }
    }

    pub fn with_sources(snapshot: Snapshot) -> Self {
        Context { sources: Some(snapshot) }
    }

    pub fn sources(&self) -> Option<&Snapshot> {
        self.sources.as_ref()
    }

    /// Reads `relative`, a path relative to the source base.
    pub fn read<P: AsRef<Path>>(&self, relative: P) -> Option<&[u8]> {
        self.sources.as_ref()?.get(relative)
    }

    /// Resolves `target` as referenced from the file `from`: first relative
    /// to `from`'s directory, then relative to the source base.
    pub fn resolve(&self, from: &Path, target: &str) -> Option<PathBuf> {
        let sources = self.sources.as_ref()?;
        let target = target.trim_start_matches('/');
        let sibling = normalize(from.parent().unwrap_or(Path::new("")).join(target));
        if sources.contains(&sibling) {
            return Some(sibling);
        }

        let rooted = normalize(target);
        sources.contains(&rooted).then_some(rooted)
    }
}

/// Bad input to one transform stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    pub stage: &'static str,
    pub source_path: PathBuf,
    pub cause: Arc<str>,
}

impl TransformError {
    pub fn new<P: AsRef<Path>, C: fmt::Display>(stage: &'static str, path: P, cause: C) -> Self {
        TransformError {
            stage,
            source_path: path.as_ref().to_path_buf(),
            cause: cause.to_string().into(),
        }
    }

    /// Reattributes the error to the file whose chain produced it.
    pub fn at<P: AsRef<Path>>(self, origin: P) -> Self {
        TransformError { source_path: origin.as_ref().to_path_buf(), ..self }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.source_path.display(), self.cause)
    }
}

impl std::error::Error for TransformError {}

impl ErrorDetail for TransformError {
    fn context(&self) -> Vec<(Option<String>, String)> {
        vec![
            (Some("stage".into()), self.stage.into()),
            (Some("source path".into()), self.source_path.display().to_string()),
        ]
    }
}
