//! Probe runtime: the hot-path object that records one line or branch hit.
//!
//! Grounded on the concurrency idiom of `raya-core`'s VM objects (small,
//! atomics-only state, no allocation on the hot path) and on the spec's
//! §4.A contract and §9 design note on replacing the probe's dynamic
//! back-reference to the driver with an explicit capability object.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Weak;

use covcore_bytecode::CodeUnitId;

use crate::error::ProbeRuntimeError;

/// What a probe records: a line number, or a `(src_line, dst_line)` branch
/// edge. A sum type so set membership downstream (`newly_seen`/`all_seen`)
/// is uniform structural equality regardless of which kind fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProbeKey {
    /// A line coverage event.
    Line(u32),
    /// A branch coverage event: source line taken to destination line.
    Branch(u32, u32),
}

/// The operations a probe needs from its owning driver, and nothing else.
/// A probe holds only a non-owning [`Weak`] reference to one of these
/// (design note: "probes have a non-owning back-reference to the driver"),
/// so a driver can be torn down while dormant frames still reference its
/// probes without creating a cycle.
pub trait DriverCapability: Send + Sync {
    /// Record that `key` was observed for `filename`.
    fn record_key(&self, filename: &str, key: ProbeKey);

    /// Ask the driver to schedule (or run, depending on policy) a
    /// deinstrument round. Called at most once per probe, when its D-miss
    /// counter first reaches the configured threshold.
    fn request_deinstrument(&self);
}

/// Lifecycle of a [`ProbeSite`] (§4.D state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    /// Inserted, never fired.
    Instrumented = 0,
    /// Fired at least once; still present in the bytecode.
    SeenInstrumented = 1,
    /// Threshold crossed; a deinstrument round has been requested but the
    /// Replacer has not yet installed the de-instrumented `CodeUnit`.
    DeinstrumentPending = 2,
    /// The Replacer has installed the de-instrumented unit; this probe's
    /// insert is a dead jump and further firings are U-misses.
    Removed = 3,
}

impl ProbeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Instrumented,
            1 => Self::SeenInstrumented,
            2 => Self::DeinstrumentPending,
            _ => Self::Removed,
        }
    }
}

/// An insertion point inside a `CodeUnit`: the runtime companion to the
/// bytes the editor wrote. Deliberately small and allocation-free after
/// construction — the only hot path is `signal()`.
pub struct ProbeSite {
    owning_unit: CodeUnitId,
    local_index: u32,
    filename: Box<str>,
    key: ProbeKey,
    state: AtomicU8,
    /// D-misses: fires while instrumented, excluding the one that first
    /// transitioned `Instrumented -> SeenInstrumented`.
    d_miss: AtomicU32,
    /// U-misses: fires from a dormant frame after this site was retired.
    u_miss: AtomicU32,
    /// Every fire, regardless of state.
    hits: AtomicU32,
    threshold: i64,
    /// Offset of the insert's leading reserved `NOP` in the owning unit's
    /// code, and the insert's total length — used only by the immediate
    /// self-disable path.
    insert_offset: usize,
    insert_len: usize,
    immediate_enabled: bool,
    capability: Weak<dyn DriverCapability>,
}

impl ProbeSite {
    /// Construct a new, unfired probe site.
    ///
    /// `threshold` follows §6's sentinels: `-2` never removes or requests
    /// a deinstrument round (diagnostic mode); `-1` marks the site removed
    /// on its first D-miss without asking the driver for a host-wide
    /// round; any `n >= 0` requests a round once `n` D-misses have been
    /// observed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owning_unit: CodeUnitId,
        local_index: u32,
        filename: impl Into<Box<str>>,
        key: ProbeKey,
        threshold: i64,
        insert_offset: usize,
        insert_len: usize,
        immediate_enabled: bool,
        capability: Weak<dyn DriverCapability>,
    ) -> Self {
        Self {
            owning_unit,
            local_index,
            filename: filename.into(),
            key,
            state: AtomicU8::new(ProbeState::Instrumented as u8),
            d_miss: AtomicU32::new(0),
            u_miss: AtomicU32::new(0),
            hits: AtomicU32::new(0),
            threshold,
            insert_offset,
            insert_len,
            immediate_enabled,
            capability,
        }
    }

    /// The `CodeUnit` this site was inserted into.
    pub fn owning_unit(&self) -> CodeUnitId {
        self.owning_unit
    }

    /// This site's index among the probes inserted into its owning unit,
    /// matching the `Constant::ProbeHandle` the editor wrote for it.
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// This site's key.
    pub fn key(&self) -> ProbeKey {
        self.key
    }

    /// The file this site belongs to.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Offset of this site's insert in its owning unit's code.
    pub fn insert_offset(&self) -> usize {
        self.insert_offset
    }

    /// Length in bytes of this site's insert.
    pub fn insert_len(&self) -> usize {
        self.insert_len
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProbeState {
        ProbeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// D-miss count (excludes the first-ever fire).
    pub fn d_misses(&self) -> u32 {
        self.d_miss.load(Ordering::Relaxed)
    }

    /// U-miss count (fires after removal).
    pub fn u_misses(&self) -> u32 {
        self.u_miss.load(Ordering::Relaxed)
    }

    /// Total fire count.
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Whether this site has been marked removed (state `Removed`).
    pub fn was_removed(&self) -> bool {
        self.state() == ProbeState::Removed
    }

    /// Invoked by the inserted call sequence. Never panics or returns a
    /// `Result` to the caller: on an internal error it reports a
    /// `ProbeRuntimeError` via `tracing` and returns, matching the
    /// "`signal()` never raises" contract (§4.A, §7 ProbeRuntimeError).
    pub fn signal(&self, code: Option<&mut [u8]>) {
        if let Err(err) = self.try_signal(code) {
            tracing::error!(target: "engine.probe", key = ?self.key, error = %err, "probe runtime error");
        }
    }

    fn try_signal(&self, code: Option<&mut [u8]>) -> Result<(), ProbeRuntimeError> {
        self.hits.fetch_add(1, Ordering::Relaxed);

        let prior = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            match ProbeState::from_u8(raw) {
                ProbeState::Instrumented => Some(ProbeState::SeenInstrumented as u8),
                other => Some(other as u8),
            }
        });
        let prior_state = ProbeState::from_u8(prior.unwrap_or(ProbeState::Instrumented as u8));

        match prior_state {
            ProbeState::Removed => {
                self.u_miss.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            ProbeState::Instrumented => {
                let capability = self
                    .capability
                    .upgrade()
                    .ok_or(ProbeRuntimeError::DriverGone(self.key))?;
                capability.record_key(&self.filename, self.key);
                return Ok(());
            }
            ProbeState::SeenInstrumented | ProbeState::DeinstrumentPending => {}
        }

        let d_miss = self.d_miss.fetch_add(1, Ordering::Relaxed) + 1;

        if self.threshold == -2 {
            return Ok(());
        }

        if self.threshold == -1 {
            self.disable_locally(code)?;
            return Ok(());
        }

        if i64::from(d_miss) == self.threshold {
            self.state.store(ProbeState::DeinstrumentPending as u8, Ordering::Release);
            self.disable_locally(code)?;
            let capability = self
                .capability
                .upgrade()
                .ok_or(ProbeRuntimeError::DriverGone(self.key))?;
            capability.request_deinstrument();
        }

        Ok(())
    }

    /// Patch this site's insert into an unconditional forward jump over the
    /// rest of the insert, if immediate mode is wired up and the caller
    /// handed us the live code buffer. The publish ordering relies on the
    /// calling thread being the only one executing this code path (§5): no
    /// fence is needed beyond the store itself.
    fn disable_locally(&self, code: Option<&mut [u8]>) -> Result<(), ProbeRuntimeError> {
        if !self.immediate_enabled {
            return Ok(());
        }
        let Some(code) = code else {
            return Ok(());
        };
        let insert_end = self.insert_offset + self.insert_len;
        if insert_end > code.len() {
            return Err(ProbeRuntimeError::ImmediateOffsetOutOfBounds {
                offset: self.insert_offset,
                len: code.len(),
            });
        }
        let target = insert_end as u32;
        let mut writer = covcore_bytecode::BytecodeWriter::with_capacity(self.insert_len);
        writer.emit_instruction(covcore_bytecode::Opcode::JumpAbsolute, target);
        let jump_bytes = writer.into_bytes();
        if jump_bytes.len() > self.insert_len {
            return Err(ProbeRuntimeError::ImmediateInsertTooNarrow {
                offset: self.insert_offset,
                target: insert_end,
                needed: jump_bytes.len(),
                available: self.insert_len,
            });
        }
        let insert = &mut code[self.insert_offset..insert_end];
        insert[..jump_bytes.len()].copy_from_slice(&jump_bytes);
        for b in &mut insert[jump_bytes.len()..] {
            *b = covcore_bytecode::Opcode::Nop.to_u8();
        }
        self.state.store(ProbeState::Removed as u8, Ordering::Release);
        Ok(())
    }

    /// Called by the driver once the Replacer has installed this site's
    /// owning `CodeUnit`'s de-instrumented successor everywhere it is
    /// reachable. Future fires from dormant frames still running the old
    /// unit are now counted as U-misses.
    pub fn mark_removed(&self) {
        self.state.store(ProbeState::Removed as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for ProbeSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSite")
            .field("filename", &self.filename)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("d_misses", &self.d_misses())
            .field("u_misses", &self.u_misses())
            .field("hits", &self.hits())
            .finish()
    }
}
