//! Instrumentation driver (§4.D): owns the registry of instrumented code,
//! the process-wide `newly_seen`/`all_seen` coverage sets, and orchestrates
//! the editor, pre-instrumenter, probe runtime, and replacer into the
//! external API a host integration actually calls.
//!
//! Grounded on `raya-core`'s `vm/context.rs` ownership style: one
//! `Arc`-wrapped inner struct behind a cheap-to-clone handle, `parking_lot`
//! locks around the mutable registries, `rustc-hash` maps for the
//! high-churn lookups.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use covcore_ast::Module;
use covcore_bytecode::{verify_code_unit, CodeUnit, CodeUnitId};

use crate::config::Config;
use crate::editor;
use crate::error::BytecodeError;
use crate::monitoring::HostCapabilities;
use crate::pre_instrument;
use crate::probe::{DriverCapability, ProbeKey, ProbeSite, ProbeState};
use crate::replacer::{self, ReplacerGraph};

/// Which backend a [`Driver`] selected at construction (§4.E: mutually
/// exclusive, chosen once from host capabilities).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Coverage is collected by rewriting bytecode (§4.A-C).
    Bytecode,
    /// Coverage is collected via the host's structured monitoring API
    /// (§4.E).
    Monitoring,
}

struct CodeEntry {
    unit: CodeUnit,
}

struct DriverInner {
    config: Config,
    backend: Backend,
    code_registry: RwLock<FxHashMap<CodeUnitId, CodeEntry>>,
    probes: RwLock<FxHashMap<CodeUnitId, Vec<Arc<ProbeSite>>>>,
    newly_seen: Mutex<FxHashSet<(String, ProbeKey)>>,
    all_seen: Mutex<FxHashSet<(String, ProbeKey)>>,
    instrumented_lines: Mutex<FxHashMap<String, BTreeSet<u32>>>,
    branch_sites_by_file: Mutex<HashMap<String, HashMap<u32, (u32, u32)>>>,
    pending_deinstrument: AtomicBool,
    graph: RwLock<ReplacerGraph>,
}

impl DriverCapability for DriverInner {
    fn record_key(&self, filename: &str, key: ProbeKey) {
        self.newly_seen.lock().insert((filename.to_string(), key));
    }

    fn request_deinstrument(&self) {
        self.pending_deinstrument.store(true, Ordering::Release);
    }
}

/// Entry point for a host integration: construct once per process, call
/// [`Driver::instrument_code`]/[`Driver::pre_instrument_source`] as code is
/// loaded, periodically call [`Driver::deinstrument_seen`], and read
/// [`Driver::get_coverage`] at report time.
///
/// Cheap to clone: internally an `Arc`, so the same driver can be handed to
/// every thread/worker that loads or executes code.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Construct a driver, selecting the bytecode or monitoring backend
    /// from `caps` (§4.E). Fails if branch coverage was requested and
    /// neither backend on this host can provide it.
    pub fn new(config: Config, caps: Arc<dyn HostCapabilities>) -> Result<Self, crate::error::ConfigError> {
        let backend = if caps.has_monitoring_api() { Backend::Monitoring } else { Backend::Bytecode };
        if config.branch && backend == Backend::Monitoring && !caps.monitoring_supports_branch() {
            return Err(crate::error::ConfigError::BranchUnsupported);
        }
        let inner = Arc::new(DriverInner {
            config,
            backend,
            code_registry: RwLock::new(FxHashMap::default()),
            probes: RwLock::new(FxHashMap::default()),
            newly_seen: Mutex::new(FxHashSet::default()),
            all_seen: Mutex::new(FxHashSet::default()),
            instrumented_lines: Mutex::new(FxHashMap::default()),
            branch_sites_by_file: Mutex::new(HashMap::new()),
            pending_deinstrument: AtomicBool::new(false),
            graph: RwLock::new(ReplacerGraph::new()),
        });
        Ok(Self { inner })
    }

    /// The backend this driver selected at construction.
    pub fn backend(&self) -> Backend {
        self.inner.backend
    }

    /// A non-owning handle to this driver's coverage-recording capability,
    /// for wiring a [`crate::monitoring::MonitoringHandler`] on hosts that
    /// selected the monitoring backend.
    pub fn capability(&self) -> Weak<dyn DriverCapability> {
        Arc::downgrade(&self.inner) as Weak<dyn DriverCapability>
    }

    /// The live object graph a host integration registers modules,
    /// classes, functions, and frames into, so [`Driver::deinstrument_seen`]
    /// can walk it when repointing references to a de-instrumented
    /// `CodeUnit`.
    pub fn replacer_graph(&self) -> &RwLock<ReplacerGraph> {
        &self.inner.graph
    }

    /// Pre-instrument `module`'s AST for branch coverage (§4.C), if branch
    /// mode is enabled. A no-op (returns `module` unchanged) otherwise, and
    /// on the monitoring backend when it natively reports branch events —
    /// callers only need to invoke this once, before compiling `filename`.
    ///
    /// If `module` already binds the reserved branch-sentinel name
    /// somewhere, the rewrite is skipped (logged, not propagated as a
    /// `Result`, matching this method's existing "always returns a usable
    /// module" contract) and `filename` simply gets no branch coverage.
    pub fn pre_instrument_source(&self, module: Module, filename: &str) -> Module {
        if !self.inner.config.branch {
            return module;
        }
        if self.inner.backend == Backend::Monitoring {
            return module;
        }
        let fallback = module.clone();
        match pre_instrument::pre_instrument_module(module) {
            Ok(result) => {
                self.inner.branch_sites_by_file.lock().insert(filename.to_string(), result.branch_sites);
                result.module
            }
            Err(err) => {
                tracing::warn!(target: "engine.driver", filename, error = %err, "skipping branch pre-instrumentation");
                fallback
            }
        }
    }

    /// Instrument `unit` (already compiled from `filename`) for coverage,
    /// returning the rewritten unit the host should install in place of
    /// `unit`. A no-op on a filtered-out filename (§6 `source_filter`, S4)
    /// or on the monitoring backend, which needs no bytecode rewrite.
    pub fn instrument_code(&self, unit: &CodeUnit, filename: &str) -> Result<CodeUnit, BytecodeError> {
        if !(self.inner.config.source_filter)(filename) {
            return Ok(unit.clone());
        }
        if self.inner.backend != Backend::Bytecode {
            return Ok(unit.clone());
        }

        let branch_sites = self.inner.branch_sites_by_file.lock().get(filename).cloned();
        let keys_for_line = move |line: u32| -> Vec<ProbeKey> {
            if let Some(sites) = &branch_sites {
                if let Some(&(src, dst)) = sites.get(&line) {
                    return vec![ProbeKey::Branch(src, dst)];
                }
            }
            vec![ProbeKey::Line(line)]
        };

        let (new_unit, descriptors) = editor::instrument(unit, None, keys_for_line)?;
        verify_code_unit(&new_unit).map_err(|source| BytecodeError::FailedVerification {
            qualified_name: new_unit.qualified_name.clone(),
            source,
        })?;

        let capability: Weak<dyn DriverCapability> = Arc::downgrade(&self.inner) as Weak<dyn DriverCapability>;
        let mut lines = BTreeSet::new();
        let mut sites = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            if let ProbeKey::Line(line) = descriptor.key {
                lines.insert(line);
            }
            sites.push(Arc::new(ProbeSite::new(
                new_unit.id(),
                descriptor.local_index,
                filename.to_string(),
                descriptor.key,
                self.inner.config.d_miss_threshold,
                descriptor.insert_offset,
                descriptor.insert_len,
                self.inner.config.immediate,
                capability.clone(),
            )));
        }

        self.inner.instrumented_lines.lock().entry(filename.to_string()).or_default().extend(lines);
        self.inner.probes.write().insert(new_unit.id(), sites);
        self.inner.code_registry.write().insert(new_unit.id(), CodeEntry { unit: new_unit.clone() });

        Ok(new_unit)
    }

    /// Merge this round's fresh observations into the cumulative set (I4:
    /// `all_seen` only ever grows), then — if any probe requested it since
    /// the last call — deinstrument every code unit with a
    /// `DeinstrumentPending` probe and repoint live references via the
    /// Replacer. Idempotent: calling this with nothing pending is a no-op
    /// that still performs the merge. Returns the number of code units
    /// deinstrumented.
    pub fn deinstrument_seen(&self) -> usize {
        {
            let mut newly = self.inner.newly_seen.lock();
            let mut all = self.inner.all_seen.lock();
            all.extend(newly.drain());
        }

        let was_pending = self.inner.pending_deinstrument.swap(false, Ordering::AcqRel);
        if !was_pending {
            return 0;
        }

        let pending_units: Vec<CodeUnitId> = {
            let probes = self.inner.probes.read();
            probes
                .iter()
                .filter(|(_, sites)| sites.iter().any(|s| s.state() == ProbeState::DeinstrumentPending))
                .map(|(id, _)| *id)
                .collect()
        };

        let mut deinstrumented = 0usize;
        for old_id in pending_units {
            deinstrumented += self.deinstrument_one(old_id);
        }
        deinstrumented
    }

    fn deinstrument_one(&self, old_id: CodeUnitId) -> usize {
        let Some(entry) = self.inner.code_registry.write().remove(&old_id) else {
            return 0;
        };
        let sites = self.inner.probes.read().get(&old_id).cloned().unwrap_or_default();
        let ranges: Vec<(usize, usize)> = sites.iter().map(|s| (s.insert_offset(), s.insert_len())).collect();

        let new_unit = match editor::deinstrument(&entry.unit, &ranges) {
            Ok(unit) => unit,
            Err(err) => {
                tracing::error!(target: "engine.driver", unit = ?old_id, error = %err, "deinstrument failed, leaving unit instrumented");
                self.inner.code_registry.write().insert(old_id, entry);
                return 0;
            }
        };
        let new_id = new_unit.id();

        let outcome = {
            let graph = self.inner.graph.read();
            replacer::replace_everywhere(&graph, old_id, new_id)
        };
        if !outcome.errors.is_empty() {
            tracing::warn!(
                target: "engine.driver",
                old = ?old_id, new = ?new_id, errors = ?outcome.errors,
                "replacement incomplete: some references still hold the instrumented unit"
            );
        }

        // Any site the Replacer legitimately could not reach (a dormant
        // frame, say) now classifies its future fires as U-misses rather
        // than D-misses: that is the point of mark_removed, independent of
        // whether every root was swapped.
        for site in &sites {
            site.mark_removed();
        }

        let mut probes = self.inner.probes.write();
        probes.remove(&old_id);
        probes.insert(new_id, sites);
        drop(probes);
        self.inner.code_registry.write().insert(new_id, CodeEntry { unit: new_unit });

        1
    }

    /// Snapshot the coverage observed so far. Includes observations from
    /// the current round that have not yet passed through
    /// [`Driver::deinstrument_seen`] (P6's monotonicity guarantee only
    /// requires `all_seen` itself to never shrink; a snapshot is always
    /// `all_seen ∪ newly_seen` at the instant it is taken).
    pub fn get_coverage(&self) -> CoverageReport {
        let mut by_file: BTreeMap<String, FileCoverage> = BTreeMap::new();

        {
            let all_seen = self.inner.all_seen.lock();
            let newly_seen = self.inner.newly_seen.lock();
            for (filename, key) in all_seen.iter().chain(newly_seen.iter()) {
                let entry = by_file.entry(filename.clone()).or_insert_with(FileCoverage::empty);
                match key {
                    ProbeKey::Line(line) => {
                        entry.executed_lines.insert(*line);
                    }
                    ProbeKey::Branch(src, dst) => {
                        entry.executed_branches.insert((*src, *dst));
                    }
                }
            }
        }

        if self.inner.backend == Backend::Bytecode {
            let instrumented = self.inner.instrumented_lines.lock();
            for (filename, lines) in instrumented.iter() {
                let entry = by_file.entry(filename.clone()).or_insert_with(FileCoverage::empty);
                let missing: BTreeSet<u32> = lines.difference(&entry.executed_lines).copied().collect();
                entry.missing_lines = Some(missing);
            }
        }

        if self.inner.config.collect_stats {
            let probes = self.inner.probes.read();
            for sites in probes.values() {
                for site in sites {
                    let entry = by_file.entry(site.filename().to_string()).or_insert_with(FileCoverage::empty);
                    let stats = entry.stats.get_or_insert_with(FileStats::default);
                    stats.hits += u64::from(site.hits());
                    stats.d_misses += u64::from(site.d_misses());
                    stats.u_misses += u64::from(site.u_misses());
                }
            }
        }

        CoverageReport { files: by_file, meta: CoverageMeta { backend: self.inner.backend } }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("backend", &self.inner.backend).finish()
    }
}

/// A full coverage snapshot (§6 `get_coverage` return value), keyed by
/// source filename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Per-file coverage data.
    pub files: BTreeMap<String, FileCoverage>,
    /// Information about how this report was produced.
    pub meta: CoverageMeta,
}

/// Coverage data for one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Every source line observed to execute.
    pub executed_lines: BTreeSet<u32>,
    /// Every `(src_line, dst_line)` branch edge observed taken.
    pub executed_branches: BTreeSet<(u32, u32)>,
    /// Lines this file had probes on that never fired. `None` on the
    /// monitoring backend, which has no line-table visibility here.
    pub missing_lines: Option<BTreeSet<u32>>,
    /// Per-probe hit/D-miss/U-miss totals, if `collect_stats` was enabled.
    pub stats: Option<FileStats>,
}

impl FileCoverage {
    fn empty() -> Self {
        Self {
            executed_lines: BTreeSet::new(),
            executed_branches: BTreeSet::new(),
            missing_lines: None,
            stats: None,
        }
    }
}

/// Aggregated probe counters for one file (§4.D diagnostics accessors,
/// surfaced per-file rather than per-probe).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FileStats {
    /// Total probe fires, of any kind.
    pub hits: u64,
    /// Total D-misses (fires while instrumented but already seen).
    pub d_misses: u64,
    /// Total U-misses (fires after a probe's site was retired).
    pub u_misses: u64,
}

/// Metadata describing how a [`CoverageReport`] was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageMeta {
    /// Which backend produced this report.
    pub backend: Backend,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::monitoring::{FullMonitoringApi, NoMonitoringApi};
    use crate::replacer::{CodeSlot, FunctionObject, GeneratorFrame};
    use covcore_bytecode::{BytecodeWriter, Constant, LineTableEntry, Opcode};

    /// `def f(n): x=0; while n>0: x+=n; n-=1; return x`, lines 1-6, matching
    /// the spec's S1/S2 literal example. Every line gets its own
    /// instruction so line-level firing can stand in for "this line ran".
    fn loop_unit() -> CodeUnit {
        let mut unit = CodeUnit::new("f", "loop.src");
        let mut w = BytecodeWriter::new();
        let mut line_table = Vec::new();
        for line in 1..=6u32 {
            line_table.push(LineTableEntry { start_offset: w.offset(), line });
            w.emit_instruction(Opcode::LoadConst, 0);
        }
        w.emit_raw(Opcode::ReturnValue, 0);
        unit.code = w.into_bytes();
        unit.constants.push(Constant::Int(1));
        unit.line_table = line_table;
        unit
    }

    fn two_line_unit() -> CodeUnit {
        let mut unit = CodeUnit::new("f", "a.src");
        let mut w = BytecodeWriter::new();
        w.emit_instruction(Opcode::LoadConst, 0);
        w.emit_raw(Opcode::ReturnValue, 0);
        unit.code = w.into_bytes();
        unit.constants.push(Constant::Int(1));
        unit.line_table =
            vec![LineTableEntry { start_offset: 0, line: 1 }, LineTableEntry { start_offset: 2, line: 2 }];
        unit
    }

    #[test]
    fn bytecode_backend_is_selected_without_a_monitoring_api() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        assert_eq!(driver.backend(), Backend::Bytecode);
    }

    #[test]
    fn monitoring_backend_is_selected_when_the_host_offers_one() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(FullMonitoringApi)).unwrap();
        assert_eq!(driver.backend(), Backend::Monitoring);
    }

    #[test]
    fn instrument_code_skips_filtered_out_files() {
        let config = Config::builder().source_filter(|f| f != "vendor.src").build().unwrap();
        let driver = Driver::new(config, Arc::new(NoMonitoringApi)).unwrap();
        let unit = two_line_unit();
        let result = driver.instrument_code(&unit, "vendor.src").unwrap();
        assert_eq!(result.id(), unit.id(), "filtered file must pass through untouched");
    }

    #[test]
    fn instrument_then_fire_then_report_shows_executed_lines() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        let unit = two_line_unit();
        driver.instrument_code(&unit, "a.src").unwrap();

        let sites = driver.inner.probes.read().values().next().unwrap().clone();
        for site in &sites {
            site.signal(None);
        }

        let report = driver.get_coverage();
        let file = report.files.get("a.src").unwrap();
        assert_eq!(file.executed_lines, BTreeSet::from([1, 2]));
        assert_eq!(file.missing_lines, Some(BTreeSet::new()));
    }

    #[test]
    fn deinstrument_seen_is_a_no_op_merge_when_nothing_is_pending() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        let unit = two_line_unit();
        driver.instrument_code(&unit, "a.src").unwrap();
        assert_eq!(driver.deinstrument_seen(), 0);
    }

    #[test]
    fn threshold_crossing_triggers_deinstrument_and_replacement() {
        let config = Config::builder().d_miss_threshold(1).build().unwrap();
        let driver = Driver::new(config, Arc::new(NoMonitoringApi)).unwrap();
        let unit = two_line_unit();
        let instrumented = driver.instrument_code(&unit, "a.src").unwrap();

        let function_slot = CodeSlot::new(instrumented.id());
        driver.replacer_graph().write().functions.push(FunctionObject {
            name: "f".into(),
            code: function_slot.clone(),
            closure_defaults: vec![],
        });

        let sites = driver.inner.probes.read().get(&instrumented.id()).unwrap().clone();
        for site in &sites {
            site.signal(None);
            site.signal(None);
        }

        let changed = driver.deinstrument_seen();
        assert_eq!(changed, 1);
        assert_ne!(function_slot.get(), instrumented.id(), "replacer must repoint the live reference");
    }

    #[test]
    fn missing_lines_reflects_lines_never_fired() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        let unit = two_line_unit();
        driver.instrument_code(&unit, "a.src").unwrap();

        let sites = driver.inner.probes.read().values().next().unwrap().clone();
        sites[0].signal(None);

        let report = driver.get_coverage();
        let file = report.files.get("a.src").unwrap();
        assert_eq!(file.missing_lines.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn branch_mode_keys_sentinel_lines_as_branches() {
        use covcore_ast::{
            BinaryExpression, BinaryOperator, BlockStatement, Expression, ExpressionStatement, Identifier,
            IfStatement, Literal, LiteralValue, Span, Statement,
        };

        let config = Config::builder().branch(true).build().unwrap();
        let driver = Driver::new(config, Arc::new(NoMonitoringApi)).unwrap();

        let span_at = |line: u32| Span::new(line, 0, line, 1);
        let then_branch = Statement::Expression(ExpressionStatement {
            expression: Expression::Identifier(Identifier { name: "y".into(), span: span_at(2) }),
            span: span_at(2),
        });
        let condition = Expression::Binary(BinaryExpression {
            operator: BinaryOperator::GreaterThan,
            left: Box::new(Expression::Identifier(Identifier { name: "n".into(), span: span_at(1) })),
            right: Box::new(Expression::Literal(Literal { value: LiteralValue::Int(0), span: span_at(1) })),
            span: span_at(1),
        });
        let if_stmt = Statement::If(IfStatement {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: None,
            span: Span::new(1, 0, 2, 1),
        });
        let module = covcore_ast::Module {
            filename: "b.src".into(),
            statements: vec![if_stmt, Statement::Block(BlockStatement { statements: vec![], span: span_at(3) })],
        };

        let rewritten = driver.pre_instrument_source(module, "b.src");
        assert!(rewritten.statements.len() >= 2, "pre-instrumentation must have inserted a sentinel");

        // The sentinel line the pre-instrumenter allocated is higher than
        // any real source line (3); build a synthetic unit whose line
        // table names it, as a real compiler would after emitting the
        // sentinel assignment's bytecode.
        let mut unit = CodeUnit::new("f", "b.src");
        let mut w = BytecodeWriter::new();
        w.emit_instruction(Opcode::LoadConst, 0);
        w.emit_raw(Opcode::ReturnValue, 0);
        unit.code = w.into_bytes();
        unit.constants.push(Constant::Int(1));
        unit.line_table = vec![LineTableEntry { start_offset: 0, line: 4 }];

        let instrumented = driver.instrument_code(&unit, "b.src").unwrap();
        let sites = driver.inner.probes.read().get(&instrumented.id()).unwrap().clone();
        assert_eq!(sites.len(), 1);
        assert!(matches!(sites[0].key(), ProbeKey::Branch(1, 2)));
    }

    /// S1: `f(3)` runs the loop body, so every line fires.
    #[test]
    fn s1_loop_with_truthy_condition_reports_every_line() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        let instrumented = driver.instrument_code(&loop_unit(), "loop.src").unwrap();
        let sites = driver.inner.probes.read().get(&instrumented.id()).unwrap().clone();
        for site in &sites {
            site.signal(None);
        }
        let report = driver.get_coverage();
        let file = report.files.get("loop.src").unwrap();
        assert_eq!(file.executed_lines, BTreeSet::from([1, 2, 3, 4, 5, 6]));
    }

    /// S2: `f(0)` never enters the loop body, so lines 4-5 never fire.
    #[test]
    fn s2_loop_with_falsy_condition_skips_the_body() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        let instrumented = driver.instrument_code(&loop_unit(), "loop.src").unwrap();
        let sites = driver.inner.probes.read().get(&instrumented.id()).unwrap().clone();
        for site in &sites {
            let line = match site.key() {
                ProbeKey::Line(l) => l,
                ProbeKey::Branch(..) => unreachable!("line-mode config never produces branch keys"),
            };
            if line != 4 && line != 5 {
                site.signal(None);
            }
        }
        let report = driver.get_coverage();
        let file = report.files.get("loop.src").unwrap();
        assert_eq!(file.executed_lines, BTreeSet::from([1, 2, 3, 6]));
        assert_eq!(file.missing_lines, Some(BTreeSet::from([4, 5])));
    }

    /// S5: a deinstrument round fires while a reference is reachable only
    /// through a dormant (suspended generator) frame, never through any
    /// live-thread top frame. The frame's slot still gets repointed (it is
    /// not the one kind of root I6 forbids touching), and once the round
    /// completes, any further signal the old bytecode would still produce
    /// is accounted as a U-miss rather than re-triggering a deinstrument
    /// request.
    #[test]
    fn s5_deinstrument_while_a_generator_frame_is_suspended() {
        let config = Config::builder().d_miss_threshold(1).build().unwrap();
        let driver = Driver::new(config, Arc::new(NoMonitoringApi)).unwrap();
        let instrumented = driver.instrument_code(&two_line_unit(), "a.src").unwrap();

        driver.replacer_graph().write().frames.push(GeneratorFrame {
            name: "gen-0".into(),
            code: CodeSlot::new(instrumented.id()),
            is_top_of_live_thread: false,
        });

        let sites = driver.inner.probes.read().get(&instrumented.id()).unwrap().clone();
        let line_one_site = sites.iter().find(|s| s.key() == ProbeKey::Line(1)).unwrap().clone();
        line_one_site.signal(None);
        line_one_site.signal(None);

        let changed = driver.deinstrument_seen();
        assert_eq!(changed, 1);

        let frame_code = driver.replacer_graph().read().frames[0].code.get();
        assert_ne!(frame_code, instrumented.id(), "the suspended frame's slot must be repointed");

        // The old probe objects are retained (they are what a dormant
        // frame would still call into); firing one now must count as a
        // U-miss, not request a second round.
        line_one_site.signal(None);
        assert!(line_one_site.was_removed());
        assert_eq!(line_one_site.u_misses(), 1);
    }

    /// S6: two threads race to be first to fire the same line's probe.
    /// Exactly one entry reaches `newly_seen`/`all_seen`; the other firing
    /// is absorbed by the state machine's `Instrumented -> SeenInstrumented`
    /// compare-and-swap.
    #[test]
    fn s6_concurrent_first_fires_collapse_to_one_seen_entry() {
        let driver = Driver::new(Config::builder().build().unwrap(), Arc::new(NoMonitoringApi)).unwrap();
        let instrumented = driver.instrument_code(&two_line_unit(), "a.src").unwrap();
        let site = driver
            .inner
            .probes
            .read()
            .get(&instrumented.id())
            .unwrap()
            .iter()
            .find(|s| s.key() == ProbeKey::Line(1))
            .unwrap()
            .clone();

        let site_a = site.clone();
        let site_b = site.clone();
        let handle_a = std::thread::spawn(move || site_a.signal(None));
        let handle_b = std::thread::spawn(move || site_b.signal(None));
        handle_a.join().unwrap();
        handle_b.join().unwrap();

        assert_eq!(site.hits(), 2, "both fires are counted");

        let report = driver.get_coverage();
        let file = report.files.get("a.src").unwrap();
        assert!(file.executed_lines.contains(&1), "line 1 must be recorded exactly once, however many threads raced");
    }
}
