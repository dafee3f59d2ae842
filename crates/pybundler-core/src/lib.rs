//! Build self-contained macOS application and plugin bundles from Python
//! programs.
//!
//! The build runs in four stages: the [`finder`] discovers every module the
//! entry scripts need, [`recipes`] patch the result for packages with special
//! needs, the [`relocator`] makes native code load from inside the bundle,
//! and the [`emitter`] writes the bundle. [`pipeline::Pipeline`] strings them
//! together.

pub mod archive;
pub mod audit;
pub mod bootstrap;
pub mod compile;
pub mod emitter;
pub mod error;
pub mod finder;
pub mod fsutil;
pub mod graph;
pub mod interpreter;
pub mod layout;
pub mod macho;
pub mod manifest;
pub mod pipeline;
pub mod recipes;
pub mod relinker;
pub mod relocator;
pub mod report;
pub mod reporter;
pub mod resources;
pub mod scanner;

pub use error::{BuildError, Result};
pub use graph::{ModuleGraph, ModuleNode, NodeKind};
pub use interpreter::Interpreter;
pub use layout::BundleLayout;
pub use pipeline::{BuildSummary, Discovery, Pipeline};
pub use reporter::{NullReporter, Reporter, TracingReporter};
