use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::asset::{Asset, Content};
use crate::error::ErrorDetail;
use crate::events::{Completion, EventBus};
use crate::meta::{Origin, Stages};
use crate::source::SourcePattern;
use crate::transform::{Context, Merge, Stage, Transform, TransformError};

/// What a pipeline does with its output when a transform fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Write nothing. The run fails.
    #[default]
    Abort,
    /// Write every asset whose chain succeeded. Errors are reported but
    /// the run succeeds.
    Skip,
}

/// Reads files matching a [`SourcePattern`], runs them through a chain of
/// [`Stage`]s and writes the results under an output directory.
///
/// Pipelines are built once with the consuming builder methods and then
/// shared, usually as an `Arc<Pipeline>`:
///
/// ```rust,no_run
/// use sluice::pipeline::Pipeline;
/// use sluice::source::SourcePattern;
/// use sluice::transform::{Include, Rename};
///
/// let pages = SourcePattern::glob("src/pages", "*.html")?;
/// let markup = Pipeline::new("markup", pages, "build")
///     .map(Include::html())
///     .map(Rename::suffix(".min"));
///
/// let result = markup.run();
/// println!("{} files written", result.written);
/// # Ok::<(), sluice::error::Error>(())
/// ```
#[derive(Debug)]
pub struct Pipeline {
    name: Arc<str>,
    source: SourcePattern,
    watch: Option<SourcePattern>,
    stages: Vec<Stage>,
    output: PathBuf,
    reload: bool,
    on_error: OnError,
    events: Option<EventBus>,
}

impl Pipeline {
    pub fn new<N, O>(name: N, source: SourcePattern, output: O) -> Self
        where N: Into<Arc<str>>, O: Into<PathBuf>
    {
        Pipeline {
            name: name.into(),
            source,
            watch: None,
            stages: vec![],
            output: output.into(),
            reload: false,
            on_error: OnError::default(),
            events: None,
        }
    }

    /// Appends a per-asset stage.
    pub fn map<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.stages.push(Stage::Map(Arc::new(transform)));
        self
    }

    /// Appends a barrier stage over every asset that survived so far.
    pub fn merge<M: Merge + 'static>(mut self, merge: M) -> Self {
        self.stages.push(Stage::Merge(Arc::new(merge)));
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Files whose changes should rerun this pipeline, when broader than
    /// the files it reads.
    pub fn watch(mut self, pattern: SourcePattern) -> Self {
        self.watch = Some(pattern);
        self
    }

    /// Publish a [`Completion`] after runs that changed files.
    pub fn reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &SourcePattern {
        &self.source
    }

    pub fn watch_pattern(&self) -> &SourcePattern {
        self.watch.as_ref().unwrap_or(&self.source)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn reloads(&self) -> bool {
        self.reload
    }

    /// Selects, transforms and returns the assets this pipeline would
    /// write, with every error encountered on the way. Nothing is written.
    pub fn process(&self) -> Result<(Vec<Asset>, Vec<TransformError>), TransformError> {
        let selected = self.source.select()
            .map_err(|e| TransformError::new("select", self.source.base(), e.message()))?;

        let cx = match self.stages.iter().any(|s| s.needs_sources()) {
            true => Context::with_sources(self.source.snapshot()
                .map_err(|e| TransformError::new("read", self.source.base(), e.message()))?),
            false => Context::empty(),
        };

        let (mut assets, mut errors) = partition(selected.par_iter()
            .map(|relative| -> Result<Vec<Asset>, TransformError> {
                let path = self.source.base().join(relative);
                let bytes = std::fs::read(&path)
                    .map_err(|e| TransformError::new("read", relative, e))?;

                let origin: Arc<str> = relative.to_string_lossy().into();
                Ok(vec![Asset::new(relative, Content::from_bytes(bytes)).with_meta(Origin, origin)])
            })
            .collect());

        let mut stages = &self.stages[..];
        while !stages.is_empty() {
            let maps = stages.iter().take_while(|s| matches!(s, Stage::Map(_))).count();
            if maps > 0 {
                let (chain, rest) = stages.split_at(maps);
                let results = assets.into_par_iter()
                    .map(|asset| run_chain(asset, chain, &cx))
                    .collect();

                let (survivors, failed) = partition(results);
                assets = survivors;
                errors.extend(failed);
                stages = rest;
                continue;
            }

            if let Some((Stage::Merge(merge), rest)) = stages.split_first() {
                assets = match merge.merge(assets, &cx) {
                    Ok(merged) => merged.into_iter()
                        .map(|a| a.with_metadata(a.metadata().with_pushed(Stages, merge.name())))
                        .collect(),
                    Err(e) => {
                        errors.push(e);
                        vec![]
                    }
                };

                stages = rest;
            }
        }

        Ok((assets, errors))
    }

    /// Runs the pipeline once. Never panics on bad input: every problem is
    /// in the returned [`PipelineResult`].
    pub fn run(&self) -> PipelineResult {
        let start = Instant::now();
        let span = tracing::info_span!("pipeline", name = %self.name);
        let _span = span.enter();

        let mut result = PipelineResult {
            pipeline: self.name.clone(),
            written: 0,
            changed: vec![],
            errors: vec![],
            aborted: false,
            recovered: false,
        };

        let (assets, errors) = match self.process() {
            Ok(processed) => processed,
            Err(e) => {
                tracing::error!(error = %e, "pipeline could not start");
                result.errors.push(e);
                result.aborted = true;
                return result;
            }
        };

        result.errors = errors;
        let assets = self.dedup(assets, &mut result.errors);
        for error in &result.errors {
            tracing::warn!(%error, "transform failed");
        }

        if !result.errors.is_empty() && self.on_error == OnError::Abort {
            tracing::error!(errors = result.errors.len(), "pipeline aborted; nothing written");
            result.aborted = true;
            return result;
        }

        result.recovered = !result.errors.is_empty();
        let writes: Vec<_> = assets.par_iter().map(|asset| self.write(asset)).collect();
        for write in writes {
            match write {
                Ok(Some(changed)) => {
                    result.written += 1;
                    result.changed.push(changed);
                }
                Ok(None) => result.written += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "write failed");
                    result.errors.push(e);
                    result.recovered = false;
                }
            }
        }

        if let Some(bus) = self.events.as_ref().filter(|_| self.reload) {
            if !result.changed.is_empty() {
                let changed = result.changed.iter().map(|p| self.output.join(p)).collect();
                bus.emit(Completion { pipeline: self.name.clone(), changed });
            }
        }

        tracing::info!(
            written = result.written,
            changed = result.changed.len(),
            errors = result.errors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pipeline finished"
        );

        result
    }

    /// Drops every asset that targets an output path an earlier asset
    /// already claimed, recording a `write` error for it.
    fn dedup(&self, assets: Vec<Asset>, errors: &mut Vec<TransformError>) -> Vec<Asset> {
        let mut claimed: FxHashMap<PathBuf, Arc<str>> = FxHashMap::default();
        let mut unique = Vec::with_capacity(assets.len());
        for asset in assets {
            let origin = origin(&asset);
            if let Some(first) = claimed.get(asset.path()) {
                let cause = format!("output `{}` is also produced from `{first}`", asset.path().display());
                errors.push(TransformError::new("write", &*origin, cause));
                continue;
            }

            claimed.insert(asset.path().to_path_buf(), origin);
            unique.push(asset);
        }

        unique
    }

    /// Writes `asset` unless the file already holds the same bytes.
    /// Returns the asset's path when the file changed.
    fn write(&self, asset: &Asset) -> Result<Option<PathBuf>, TransformError> {
        let target = self.output.join(asset.path());
        let bytes = asset.content().as_bytes();
        if std::fs::read(&target).map_or(false, |existing| existing == bytes) {
            return Ok(None);
        }

        let error = |e: std::io::Error| TransformError::new("write", &*origin(asset), e);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(error)?;
        }

        std::fs::write(&target, bytes).map_err(error)?;
        tracing::debug!(path = %target.display(), bytes = bytes.len(), "wrote asset");
        Ok(Some(asset.path().to_path_buf()))
    }
}

fn origin(asset: &Asset) -> Arc<str> {
    match asset.metadata().get(Origin) {
        Some(Ok(origin)) => origin,
        _ => asset.path().to_string_lossy().into(),
    }
}

/// Runs one asset through consecutive map stages. The first failure ends
/// the chain for that asset and everything it fanned out into.
fn run_chain(asset: Asset, chain: &[Stage], cx: &Context) -> Result<Vec<Asset>, TransformError> {
    let origin = origin(&asset);
    let mut current = vec![asset];
    for stage in chain {
        let Stage::Map(transform) = stage else { continue };

        let mut next = Vec::with_capacity(current.len());
        for asset in &current {
            let out = transform.apply(asset, cx).map_err(|e| e.at(&*origin))?;
            next.extend(out.into_iter().map(|a| {
                a.with_metadata(a.metadata().with_pushed(Stages, transform.name()))
            }));
        }

        current = next;
    }

    Ok(current)
}

fn partition(results: Vec<Result<Vec<Asset>, TransformError>>) -> (Vec<Asset>, Vec<TransformError>) {
    let mut assets = vec![];
    let mut errors = vec![];
    for result in results {
        match result {
            Ok(out) => assets.extend(out),
            Err(e) => errors.push(e),
        }
    }

    (assets, errors)
}

/// The outcome of one [`Pipeline::run()`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub pipeline: Arc<str>,
    /// Assets written or found already up to date.
    pub written: usize,
    /// Output-relative paths whose bytes changed on disk.
    pub changed: Vec<PathBuf>,
    pub errors: Vec<TransformError>,
    /// Errors stopped the run before anything was written.
    pub aborted: bool,
    /// Every error in `errors` was tolerated under [`OnError::Skip`].
    pub recovered: bool,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty() || self.recovered
    }

    pub fn into_result(self) -> Result<PipelineResult, PipelineError> {
        match self.success() {
            true => Ok(self),
            false => Err(PipelineError { pipeline: self.pipeline, errors: self.errors }),
        }
    }
}

/// The unrecovered errors of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineError {
    pub pipeline: Arc<str>,
    pub errors: Vec<TransformError>,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            1 => write!(f, "pipeline `{}` failed with 1 error", self.pipeline),
            n => write!(f, "pipeline `{}` failed with {n} errors", self.pipeline),
        }
    }
}

impl std::error::Error for PipelineError {}

impl ErrorDetail for PipelineError {
    fn context(&self) -> Vec<(Option<String>, String)> {
        self.errors.iter().map(|e| (None, e.to_string())).collect()
    }
}
