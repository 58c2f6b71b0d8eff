//! Monitoring backend (§4.E): on hosts that expose a structured,
//! versioned callback API, the engine registers callbacks instead of
//! rewriting bytecode. Both backends feed the same `newly_seen` data
//! model through [`crate::probe::DriverCapability`]; this module differs
//! from the bytecode path only in who decides when to stop being
//! notified — the host, rather than a probe's own D-miss counter.
//!
//! Grounded on the [`crate::probe`] module's capability-object design
//! note (§9: "replace the probe's dynamic attribute lookup on the driver
//! with an explicit capability object") — the monitoring handler is given
//! the exact same capability trait a bytecode probe holds, just invoked
//! from a different call site.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::probe::{DriverCapability, ProbeKey};

/// One event a host's monitoring API can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringEvent {
    /// A line executed.
    Line {
        /// Source file the line belongs to.
        filename: String,
        /// The executed line.
        line: u32,
    },
    /// A branch's "taken" edge executed.
    BranchTaken {
        /// Source file the branch belongs to.
        filename: String,
        /// The branch's source line.
        src_line: u32,
        /// The branch's destination line.
        dst_line: u32,
    },
    /// A branch's "not taken" edge was evaluated and rejected. Reported
    /// for symmetry with the host API but never recorded — only taken
    /// edges appear in `executed_branches` (P7 only constrains taken
    /// branches).
    BranchNotTaken {
        /// Source file the branch belongs to.
        filename: String,
        /// The branch's source line.
        src_line: u32,
        /// The branch's destination line.
        dst_line: u32,
    },
    /// Emitted once when the host begins executing a code unit, used only
    /// to let the handler initialize per-unit bookkeeping; never disables
    /// notifications.
    Start {
        /// Source file of the code unit that started executing.
        filename: String,
    },
}

/// What a callback tells the host to do about future notifications for
/// the site that just fired. Returning `DisableForSite` is this backend's
/// analogue of a bytecode probe's deinstrument request: the amortization
/// is identical, but the host pays for it instead of the engine rewriting
/// bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringDisposition {
    /// Keep delivering notifications for this site.
    KeepNotifying,
    /// Stop delivering notifications for this exact site (this line, or
    /// this branch edge, of this code unit).
    DisableForSite,
}

/// Registered once per process when the driver selects the monitoring
/// backend. The host's registration mechanism (a versioned, event-keyed
/// callback table) is external to this crate (§1 scope); this handler is
/// the callback object a host integration would register against it.
pub struct MonitoringHandler {
    capability: Weak<dyn DriverCapability>,
    hits: AtomicU64,
}

impl MonitoringHandler {
    /// Construct a handler that feeds `capability`'s `newly_seen` set.
    pub fn new(capability: Weak<dyn DriverCapability>) -> Self {
        Self { capability, hits: AtomicU64::new(0) }
    }

    /// Total events delivered to this handler, regardless of kind.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Handle one event from the host, recording it into the driver's
    /// `newly_seen` set (via the capability back-reference) and deciding
    /// whether the host should keep notifying this site.
    ///
    /// Mirrors [`crate::probe::ProbeSite::signal`]'s contract: never
    /// panics. If the driver has been dropped, the event is silently
    /// absorbed (there is nowhere left to record it) and notifications
    /// are told to stop, since nothing will ever consume them again.
    pub fn on_event(&self, event: MonitoringEvent) -> MonitoringDisposition {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let Some(capability) = self.capability.upgrade() else {
            return MonitoringDisposition::DisableForSite;
        };

        match event {
            MonitoringEvent::Line { filename, line } => {
                capability.record_key(&filename, ProbeKey::Line(line));
                MonitoringDisposition::DisableForSite
            }
            MonitoringEvent::BranchTaken { filename, src_line, dst_line } => {
                capability.record_key(&filename, ProbeKey::Branch(src_line, dst_line));
                MonitoringDisposition::DisableForSite
            }
            MonitoringEvent::BranchNotTaken { .. } => MonitoringDisposition::DisableForSite,
            MonitoringEvent::Start { .. } => MonitoringDisposition::KeepNotifying,
        }
    }
}

/// Capability probe the driver queries once, at construction, to decide
/// between the bytecode and monitoring backends (§4.E, §9: "a runtime
/// strategy selection, not a compile-time split").
pub trait HostCapabilities: Send + Sync {
    /// Whether the host exposes a structured monitoring API at all.
    fn has_monitoring_api(&self) -> bool;

    /// Whether that monitoring API can report `BRANCH_TAKEN`/
    /// `BRANCH_NOT_TAKEN` events natively. Irrelevant if
    /// `has_monitoring_api` is `false`.
    fn monitoring_supports_branch(&self) -> bool;
}

/// A host with no structured monitoring API — the common case, and the
/// one that selects the bytecode backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMonitoringApi;

impl HostCapabilities for NoMonitoringApi {
    fn has_monitoring_api(&self) -> bool {
        false
    }

    fn monitoring_supports_branch(&self) -> bool {
        false
    }
}

/// A host whose monitoring API supports everything, for tests that need
/// to exercise the monitoring backend without a real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullMonitoringApi;

impl HostCapabilities for FullMonitoringApi {
    fn has_monitoring_api(&self) -> bool {
        true
    }

    fn monitoring_supports_branch(&self) -> bool {
        true
    }
}
