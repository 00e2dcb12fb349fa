#![doc = svgbobdoc::transform!(
//! A declarative asset-pipeline engine for static front-ends.
//!
//! # Overview
//!
//! Sluice builds a site's output directory from its sources by running
//! named **pipelines**. A pipeline selects files with a glob, streams each
//! one through an ordered list of transform stages, and writes what comes
//! out under an output directory:
//!
//! ```svgbob
//!  +----------------+    +--------+    +---------+    +--------+
//!  | SourcePattern  |--->| Asset  |--->| Stage 1 |--->|  ...   |---+
//!  | "img/**/*.png" |    | Asset  |    +---------+    +--------+   |
//!  +----------------+    +--------+                                |
//!                                                                  v
//!  +-----------+   Completion   +-----------+     +-------------------+
//!  | DevServer |<---------------| EventBus  |<----| output directory  |
//!  +-----+-----+                +-----------+     +-------------------+
//!        |  Reload (SSE)
//!        v
//!   browsers
//! ```
//!
//! Pipelines are grouped into a [`TaskGraph`](graph::TaskGraph) of named
//! tasks that run their pipelines in parallel or in sequence and may depend
//! on other tasks. The [`watch`] module re-runs pipelines when their inputs
//! change, the [`devserver`] serves the output and pushes reloads to
//! browsers, and [`deploy`] copies a finished build to a remote.
//!
//! ## Processing
//!
//! 1. A pipeline's source pattern selects files under its base directory.
//! 2. Each file is read into an [`Asset`](asset::Asset) whose path is
//!    relative to the base.
//! 3. Map stages transform assets one by one and in parallel. A failure
//!    stops that asset's chain only.
//! 4. Merge stages wait for every asset and fold them into new ones.
//! 5. Results are written under the output directory. Files whose bytes
//!    did not change are left alone.
)]

#[macro_use]
pub mod error;
pub mod util;
pub mod meta;
pub mod asset;
pub mod source;
pub mod transform;
pub mod events;
pub mod pipeline;
pub mod graph;
pub mod watch;
pub mod devserver;
pub mod deploy;

pub use rayon;
