//! Error taxonomy for the instrumentation driver and its collaborators.

use covcore_bytecode::VerifyError;
use thiserror::Error;

/// Invalid configuration, detected at `Driver::new`. Fatal: construction
/// fails and the caller never obtains a driver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `d_miss_threshold` was less than `-2` (only `-2`, `-1`, and
    /// non-negative thresholds are meaningful).
    #[error("d_miss_threshold {0} is out of range (must be >= -2)")]
    InvalidThreshold(i64),

    /// Branch mode was requested but neither the bytecode backend nor a
    /// host monitoring backend can support it.
    #[error("branch coverage requested but no backend on this host supports it")]
    BranchUnsupported,
}

/// A `CodeUnit`-scoped failure. Non-fatal: the affected unit is passed
/// through uninstrumented and the run continues (see propagation policy).
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// The original instruction stream did not decode cleanly.
    #[error("malformed bytecode in {qualified_name}: {reason}")]
    Malformed {
        /// Name of the offending code unit, for logging.
        qualified_name: String,
        /// What went wrong during decode.
        reason: String,
    },

    /// The rewritten unit failed verification (jump integrity, stack
    /// depth) after the editor ran.
    #[error("instrumented bytecode in {qualified_name} failed verification: {source}")]
    FailedVerification {
        /// Name of the offending code unit, for logging.
        qualified_name: String,
        /// The underlying verification failure.
        #[source]
        source: VerifyError,
    },

    /// The probe signal callable or capsule could not be added to the
    /// constant pool (e.g. a pool index limit was reached).
    #[error("cannot pool probe constant for {qualified_name}: {reason}")]
    ConstantPoolExhausted {
        /// Name of the offending code unit.
        qualified_name: String,
        /// Why the pool rejected the entry.
        reason: String,
    },

    /// The line table could not be rebuilt after an edit (e.g. an
    /// instruction offset has no covering entry in the original table).
    #[error("line table for {qualified_name} is irreparable: {reason}")]
    LineTableIrreparable {
        /// Name of the offending code unit.
        qualified_name: String,
        /// What went wrong.
        reason: String,
    },
}

/// Internal failure inside `ProbeSite::signal`. Propagated to the host as
/// a host-level error; coverage for subsequent executions in this process
/// is undefined.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeRuntimeError {
    /// The probe's capability back-reference to the driver was already
    /// torn down (the driver was dropped while a dormant frame still
    /// referenced this probe).
    #[error("probe for key {0:?} fired after its driver capability was dropped")]
    DriverGone(crate::probe::ProbeKey),

    /// `set_immediate` was asked to patch an offset outside the code
    /// buffer it was given.
    #[error("immediate-removal offset {offset} is out of bounds for a {len}-byte buffer")]
    ImmediateOffsetOutOfBounds {
        /// Requested patch offset.
        offset: usize,
        /// Length of the buffer that was supplied.
        len: usize,
    },

    /// The jump needed to skip past the rest of this site's insert would
    /// not fit inside the insert itself.
    #[error("immediate-removal jump to {target} needs {needed} bytes, insert at {offset} is only {available}")]
    ImmediateInsertTooNarrow {
        /// Offset of the insert being patched.
        offset: usize,
        /// The jump's target offset.
        target: usize,
        /// Bytes the jump instruction needs.
        needed: usize,
        /// Bytes actually reserved for the insert.
        available: usize,
    },
}

/// Failure found while scanning a module before branch pre-instrumentation
/// runs. Non-fatal to the host: the affected module is passed through
/// un-rewritten and branch coverage is simply unavailable for it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PreInstrumentError {
    /// The incoming source already binds the reserved branch-marker
    /// sentinel name, which would collide with the synthetic assignments
    /// pre-instrumentation writes under that name (§4.C).
    #[error("{filename}:{line} already binds the reserved branch sentinel name {name:?}")]
    SentinelNameShadowed {
        /// File the shadowing binding was found in.
        filename: String,
        /// The colliding name (always `BRANCH_SENTINEL_NAME`).
        name: String,
        /// Line the shadowing binding occurs on.
        line: u32,
    },
}

/// Failure while rewriting a live reference during a replacement walk. The
/// replacement is rolled back for the affected root only; the old
/// `CodeUnit` stays in place and the owning probe remains
/// `DeinstrumentPending`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplacerError {
    /// The root passed to the replacer references neither the old nor the
    /// new code unit anywhere in its transitive graph.
    #[error("root {root} does not reference the code unit being replaced")]
    RootNotFound {
        /// Diagnostic name of the root that was walked.
        root: String,
    },

    /// The walk would have touched the top frame of a live thread, which
    /// is never permitted (I6).
    #[error("refused to replace the top frame of a live thread (root {root})")]
    LiveTopFrame {
        /// Diagnostic name of the root that was walked.
        root: String,
    },
}
