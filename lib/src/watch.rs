//! File system watching: reruns pipelines when their sources change.
//!
//! Every [`WatchBinding`] gets its own worker thread running this state
//! machine:
//!
//! ```text
//!   Idle ──event──▶ Triggered ──quiet for `debounce`──▶ Running ──▶ Idle
//!                    ▲     │                              │
//!                    └─────┘ event: window restarts        │ event while running
//!                    ▲                                    │
//!                    └────────────────────────────────────┘
//! ```
//!
//! An event that arrives while a run is in flight is never lost: the binding
//! goes back to `Triggered` and runs again as soon as the current run ends.
//! Bindings share no locks, so a slow pipeline never delays another.
//!
//! Raw file system events are first coalesced per path by
//! `notify-debouncer-mini`, so one editor save reaches a binding as a single
//! change. The binding's own window then spans every path it watches.

use std::fmt;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use std::path::{Path, PathBuf};

use derive_more::Debug;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::{ErrorDetail, Result};
use crate::pipeline::Pipeline;
use crate::source::SourcePattern;

/// Reruns `pipeline` when a file matching `pattern` changes.
#[derive(Debug, Clone)]
pub struct WatchBinding {
    pattern: SourcePattern,
    pipeline: Arc<Pipeline>,
}

impl WatchBinding {
    /// Binds to the pipeline's own watch pattern.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        WatchBinding { pattern: pipeline.watch_pattern().clone(), pipeline }
    }

    pub fn with_pattern(pattern: SourcePattern, pipeline: Arc<Pipeline>) -> Self {
        WatchBinding { pattern, pipeline }
    }

    pub fn pattern(&self) -> &SourcePattern {
        &self.pattern
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Triggered,
    Running,
}

#[derive(Debug)]
struct Status {
    state: WatchState,
    runs: usize,
}

enum Signal {
    Changed(PathBuf),
    Shutdown,
}

/// The sending half of a binding, cheap to clone into the dispatcher.
#[derive(Clone)]
struct Trigger {
    name: Arc<str>,
    pattern: SourcePattern,
    tx: mpsc::Sender<Signal>,
    status: Arc<Mutex<Status>>,
}

impl Trigger {
    /// The send happens under the status lock so the worker never marks the
    /// binding idle with a change still queued.
    fn fire(&self, path: PathBuf) {
        let mut status = self.status.lock();
        status.state = WatchState::Triggered;
        if self.tx.send(Signal::Changed(path)).is_err() {
            tracing::debug!(pipeline = %self.name, "change arrived after shutdown");
        }
    }
}

/// A running binding: its worker thread and the means to feed it.
pub struct BindingHandle {
    trigger: Trigger,
    worker: Option<JoinHandle<()>>,
}

impl BindingHandle {
    /// Starts the worker thread for `binding`. Changes are fed to it with
    /// [`BindingHandle::trigger()`].
    pub fn spawn(binding: WatchBinding, debounce: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let status = Arc::new(Mutex::new(Status { state: WatchState::Idle, runs: 0 }));
        let name: Arc<str> = binding.pipeline.name().into();

        let worker = std::thread::Builder::new()
            .name(format!("watch-{name}"))
            .spawn({
                let status = status.clone();
                let pipeline = binding.pipeline.clone();
                move || work(&pipeline, &rx, &status, debounce)
            })?;

        let trigger = Trigger { name, pattern: binding.pattern, tx, status };
        Ok(BindingHandle { trigger, worker: Some(worker) })
    }

    pub fn name(&self) -> &str {
        &self.trigger.name
    }

    /// Reports a change to `path`, whether or not it matches the pattern.
    pub fn trigger<P: Into<PathBuf>>(&self, path: P) {
        self.trigger.fire(path.into());
    }

    pub fn state(&self) -> WatchState {
        self.trigger.status.lock().state
    }

    /// Completed pipeline runs so far.
    pub fn runs(&self) -> usize {
        self.trigger.status.lock().runs
    }

    /// Stops the worker after any run in flight, and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.trigger.tx.send(Signal::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(pipeline = %self.trigger.name, "watch worker panicked");
            }
        }
    }
}

impl Drop for BindingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for BindingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingHandle")
            .field("pipeline", &self.trigger.name)
            .field("pattern", &self.trigger.pattern)
            .field("status", &*self.trigger.status.lock())
            .finish()
    }
}

fn set_state(status: &Mutex<Status>, state: WatchState) {
    status.lock().state = state;
}

fn work(pipeline: &Pipeline, rx: &mpsc::Receiver<Signal>, status: &Mutex<Status>, debounce: Duration) {
    loop {
        match rx.recv() {
            Ok(Signal::Changed(path)) => {
                tracing::debug!(pipeline = pipeline.name(), path = %path.display(), "change detected");
            }
            Ok(Signal::Shutdown) | Err(_) => return,
        }

        loop {
            match rx.recv_timeout(debounce) {
                Ok(Signal::Changed(_)) => continue,
                Ok(Signal::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => break,
            }
        }

        loop {
            set_state(status, WatchState::Running);
            let result = pipeline.run();
            if !result.success() {
                tracing::warn!(pipeline = pipeline.name(), errors = result.errors.len(),
                    "rebuild failed; waiting for the next change");
            }

            let mut again = false;
            let mut shutdown = false;
            let mut guard = status.lock();
            loop {
                match rx.try_recv() {
                    Ok(Signal::Changed(_)) => again = true,
                    Ok(Signal::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => shutdown = true,
                    Err(mpsc::TryRecvError::Empty) => break,
                }

                if shutdown {
                    break;
                }
            }

            guard.runs += 1;
            if shutdown {
                guard.state = WatchState::Idle;
                return;
            }

            if !again {
                guard.state = WatchState::Idle;
                break;
            }

            guard.state = WatchState::Triggered;
            tracing::debug!(pipeline = pipeline.name(), "changed during run; rerunning");
        }
    }
}

/// A binding whose directory could not be watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchIoError {
    pub pipeline: Arc<str>,
    pub path: PathBuf,
    pub cause: String,
}

impl fmt::Display for WatchIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot watch `{}` for pipeline `{}`: {}", self.path.display(), self.pipeline, self.cause)
    }
}

impl std::error::Error for WatchIoError {}

impl ErrorDetail for WatchIoError {
    fn context(&self) -> Vec<(Option<String>, String)> {
        vec![
            (Some("pipeline".into()), self.pipeline.to_string()),
            (Some("path".into()), self.path.display().to_string()),
        ]
    }
}

impl WatchIoError {
    fn new<C: fmt::Display>(binding: &WatchBinding, path: &Path, cause: C) -> Self {
        WatchIoError {
            pipeline: binding.pipeline.name().into(),
            path: path.to_path_buf(),
            cause: cause.to_string(),
        }
    }
}

/// Starts watch sessions.
#[derive(Debug, Clone, Copy)]
pub struct WatchEngine {
    debounce: Duration,
}

impl WatchEngine {
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

    pub fn new(debounce: Duration) -> Self {
        WatchEngine { debounce }
    }

    /// Watches every binding's base directory. A binding that cannot be
    /// watched is reported in [`WatchSession::errors()`] and left out; the
    /// others run regardless.
    pub fn start<I>(&self, bindings: I) -> Result<WatchSession>
        where I: IntoIterator<Item = WatchBinding>
    {
        let (tx, rx) = mpsc::channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(self.debounce, tx)?;

        let mut errors = vec![];
        let mut watched: FxHashMap<PathBuf, std::result::Result<(), String>> = FxHashMap::default();
        let mut handles = vec![];
        for binding in bindings {
            let base = binding.pattern.base().to_path_buf();
            let canonical = match binding.pattern.canonicalize() {
                Ok(pattern) => pattern,
                Err(e) => {
                    errors.push(WatchIoError::new(&binding, &base, e));
                    continue;
                }
            };

            let outcome = watched.entry(canonical.base().to_path_buf()).or_insert_with(|| {
                debouncer.watcher()
                    .watch(canonical.base(), RecursiveMode::Recursive)
                    .map_err(|e| e.to_string())
            });

            if let Err(cause) = outcome {
                errors.push(WatchIoError::new(&binding, &base, cause));
                continue;
            }

            let binding = WatchBinding::with_pattern(canonical, binding.pipeline);
            match BindingHandle::spawn(binding.clone(), self.debounce) {
                Ok(handle) => handles.push(handle),
                Err(e) => errors.push(WatchIoError::new(&binding, &base, e)),
            }
        }

        for error in &errors {
            tracing::error!(%error, "watch binding disabled");
        }

        let triggers: Vec<Trigger> = handles.iter().map(|h| h.trigger.clone()).collect();
        let dispatcher = std::thread::Builder::new()
            .name("watch-dispatch".into())
            .spawn(move || dispatch(rx, triggers))?;

        tracing::info!(bindings = handles.len(), debounce_ms = self.debounce.as_millis() as u64, "watching for changes");
        Ok(WatchSession { debouncer: Some(debouncer), dispatcher: Some(dispatcher), handles, errors })
    }
}

impl Default for WatchEngine {
    fn default() -> Self {
        WatchEngine::new(Self::DEFAULT_DEBOUNCE)
    }
}

fn dispatch(rx: mpsc::Receiver<DebounceEventResult>, triggers: Vec<Trigger>) {
    for batch in rx {
        let events = match batch {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = ?e, "file system watch error");
                continue;
            }
        };

        for trigger in &triggers {
            if let Some(event) = events.iter().find(|e| trigger.pattern.matches(&e.path)) {
                trigger.fire(event.path.clone());
            }
        }
    }
}

/// A live watch session. Dropping it stops watching and waits for the
/// bindings to finish any run in flight.
#[derive(Debug)]
pub struct WatchSession {
    #[debug(ignore)]
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    dispatcher: Option<JoinHandle<()>>,
    handles: Vec<BindingHandle>,
    errors: Vec<WatchIoError>,
}

impl WatchSession {
    pub fn bindings(&self) -> &[BindingHandle] {
        &self.handles
    }

    pub fn binding(&self, pipeline: &str) -> Option<&BindingHandle> {
        self.handles.iter().find(|h| h.name() == pipeline)
    }

    pub fn errors(&self) -> &[WatchIoError] {
        &self.errors
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        // The debouncer's thread owns the sender; it exits within one tick.
        self.debouncer.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }

        self.handles.clear();
        tracing::info!("watch session stopped");
    }
}
