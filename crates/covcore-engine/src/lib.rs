//! Instrumentation driver, probe runtime, bytecode editor, branch
//! pre-instrumenter, monitoring backend, and code-object replacer for
//! covcore's near-zero-overhead coverage engine.
//!
//! [`driver::Driver`] is the entry point a host integration holds; every
//! other module is a collaborator it orchestrates.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod driver;
pub mod editor;
pub mod error;
pub mod monitoring;
pub mod pre_instrument;
pub mod probe;
pub mod replacer;

pub use config::{Config, ConfigBuilder, SourceFilter};
pub use driver::{Backend, CoverageMeta, CoverageReport, Driver, FileCoverage, FileStats};
pub use editor::{deinstrument, instrument, ProbeDescriptor, SIGNAL_CONSTANT_HANDLE};
pub use error::{BytecodeError, ConfigError, PreInstrumentError, ProbeRuntimeError, ReplacerError};
pub use monitoring::{
    FullMonitoringApi, HostCapabilities, MonitoringDisposition, MonitoringEvent, MonitoringHandler,
    NoMonitoringApi,
};
pub use pre_instrument::{pre_instrument_module, PreInstrumented};
pub use probe::{DriverCapability, ProbeKey, ProbeSite, ProbeState};
pub use replacer::{
    replace_everywhere, ClassDict, CodeSlot, FunctionObject, GeneratorFrame, ModuleNamespace,
    NestedCodeHolder, ReplaceOutcome, ReplacerGraph,
};
