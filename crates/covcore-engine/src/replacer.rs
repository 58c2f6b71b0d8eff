//! Code-object replacer (§4.F): walks the live object graph and swaps a
//! superseded `CodeUnit`'s identity for its de-instrumented successor
//! everywhere it is reachable.
//!
//! Grounded on `raya-core`'s mark-sweep collector (`gc/collector.rs`): a
//! fixed set of root kinds, a single pass over each, a visited set keyed
//! by identity to break cycles (the collector's `RootSet`/mark-bit pair
//! becomes this module's `visited` set over slot addresses). The object
//! model itself — module namespaces, class attribute dictionaries,
//! function objects, generator frames — has no stand-in in a bytecode
//! model that never runs on a real host, so each root kind is represented
//! here as a small owning struct holding one or more [`CodeSlot`]s, the
//! mutable reference cell a real host's object graph would expose at that
//! edge. A host integration (out of scope per spec §1) is the thing that
//! would populate a [`ReplacerGraph`] from its own modules/classes/frames;
//! this crate only needs the walk to be correct once it is.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use covcore_bytecode::CodeUnitId;

use crate::error::ReplacerError;

/// One mutable edge in the live object graph that can hold a reference to
/// a `CodeUnit` — a function's code pointer, a module namespace entry, a
/// closure's captured code, a frame's resumption point. Swapping the
/// `CodeUnitId` inside is the entire replacement operation (I6: identity
/// is reference-based, so "replace" means "repoint", never "mutate in
/// place").
#[derive(Clone)]
pub struct CodeSlot(Arc<Mutex<CodeUnitId>>);

impl CodeSlot {
    /// Wrap a reference to `id`.
    pub fn new(id: CodeUnitId) -> Self {
        Self(Arc::new(Mutex::new(id)))
    }

    /// Current value of this edge.
    pub fn get(&self) -> CodeUnitId {
        *self.0.lock().unwrap()
    }

    /// Identity of this slot's storage cell, used by the walk's
    /// visited-set to avoid repeating a swap when two roots alias the
    /// same underlying slot (e.g. a function object and the module entry
    /// that names it).
    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn swap_if(&self, old: CodeUnitId, new: CodeUnitId) -> bool {
        let mut guard = self.0.lock().unwrap();
        if *guard == old {
            *guard = new;
            true
        } else {
            false
        }
    }
}

/// A loaded module's namespace: every top-level binding that might hold a
/// code reference (the module body itself, and any function values bound
/// at module scope).
pub struct ModuleNamespace {
    /// Diagnostic name (the module's filename), used in error messages.
    pub name: String,
    /// Every code-holding slot in this namespace.
    pub slots: Vec<CodeSlot>,
}

/// A class's attribute dictionary: method bodies are code references
/// reachable the same way a module's top-level functions are.
pub struct ClassDict {
    /// Diagnostic name (qualified class name).
    pub name: String,
    /// Every code-holding slot in this dictionary.
    pub slots: Vec<CodeSlot>,
}

/// A function object: its own code pointer, plus any default-argument
/// closures that themselves capture code.
pub struct FunctionObject {
    /// Diagnostic name (qualified function name).
    pub name: String,
    /// The function's code pointer.
    pub code: CodeSlot,
    /// Code references held by this function's default-argument closures.
    pub closure_defaults: Vec<CodeSlot>,
}

/// A suspended generator/coroutine frame, or the top frame of a live
/// thread. `is_top_of_live_thread` distinguishes the one case the
/// Replacer must never touch (I6).
pub struct GeneratorFrame {
    /// Diagnostic name, for error messages.
    pub name: String,
    /// The frame's code pointer.
    pub code: CodeSlot,
    /// Whether this frame is the top frame of a currently-running thread.
    /// The Replacer never swaps this frame's code pointer; a suspended
    /// generator or coroutine reports `false` here even while its code is
    /// otherwise live, since its execution position is not on any thread's
    /// call stack right now.
    pub is_top_of_live_thread: bool,
}

/// Another `CodeUnit`'s reference to a nested code object (e.g. a closure
/// or comprehension defined inside it), reachable through that unit's
/// constant pool. Kept as its own root kind per §4.F's enumeration of walk
/// targets ("other `CodeUnit`s' constant pools").
pub struct NestedCodeHolder {
    /// Diagnostic name (the owning unit's qualified name).
    pub name: String,
    /// Every code-holding slot this unit's constant pool exposes.
    pub slots: Vec<CodeSlot>,
}

/// The full set of roots the Replacer walks for one process: loaded
/// modules, classes, function objects, nested code references, and
/// generator/coroutine frames. Cycles (a function's code slot also
/// reachable through its owning module, say) are broken by the walk's
/// visited set, not by structure here — this stays a flat registry a host
/// integration appends to as it loads modules, defines classes, and
/// suspends frames.
#[derive(Default)]
pub struct ReplacerGraph {
    /// Loaded module namespaces.
    pub modules: Vec<ModuleNamespace>,
    /// Loaded class attribute dictionaries.
    pub classes: Vec<ClassDict>,
    /// Function objects (their code pointer, and default-argument
    /// closures).
    pub functions: Vec<FunctionObject>,
    /// Other code units' references to nested code objects.
    pub nested_code: Vec<NestedCodeHolder>,
    /// Suspended generator/coroutine frames, plus any live thread's top
    /// frame (so the walk can recognize and refuse it per I6).
    pub frames: Vec<GeneratorFrame>,
}

impl ReplacerGraph {
    /// An empty graph, for hosts or tests that register roots as they go.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of one [`replace_everywhere`] call: how many slots were swapped,
/// and any per-root failures. A non-empty `errors` list is not itself a
/// failure of the whole walk (§7: "the replacement is rolled back for the
/// affected root only") — every slot not mentioned in `errors` was
/// swapped.
#[derive(Debug, Default)]
pub struct ReplaceOutcome {
    /// Number of slots that were repointed from `old` to `new`.
    pub replaced: usize,
    /// Roots the walk could not (or must not) touch.
    pub errors: Vec<ReplacerError>,
}

/// Breadth-first walk of `graph`'s roots, repointing every slot that holds
/// `old` to `new`. A live thread's top frame is never touched (I6); if it
/// happens to hold `old`, that is reported as a [`ReplacerError::LiveTopFrame`]
/// for that root but does not stop the rest of the walk. A visited set
/// keyed by slot identity ensures a slot aliased from two roots is only
/// swapped once.
pub fn replace_everywhere(graph: &ReplacerGraph, old: CodeUnitId, new: CodeUnitId) -> ReplaceOutcome {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut outcome = ReplaceOutcome::default();

    let mut visit_slot = |slot: &CodeSlot, outcome: &mut ReplaceOutcome| {
        if !visited.insert(slot.identity()) {
            return;
        }
        if slot.swap_if(old, new) {
            outcome.replaced += 1;
        }
    };

    for module in &graph.modules {
        for slot in &module.slots {
            visit_slot(slot, &mut outcome);
        }
    }
    for class in &graph.classes {
        for slot in &class.slots {
            visit_slot(slot, &mut outcome);
        }
    }
    for function in &graph.functions {
        visit_slot(&function.code, &mut outcome);
        for slot in &function.closure_defaults {
            visit_slot(slot, &mut outcome);
        }
    }
    for holder in &graph.nested_code {
        for slot in &holder.slots {
            visit_slot(slot, &mut outcome);
        }
    }
    for frame in &graph.frames {
        if frame.is_top_of_live_thread {
            if frame.code.get() == old {
                outcome.errors.push(ReplacerError::LiveTopFrame { root: frame.name.clone() });
            }
            continue;
        }
        visit_slot(&frame.code, &mut outcome);
    }

    if outcome.replaced == 0 && outcome.errors.is_empty() {
        outcome.errors.push(ReplacerError::RootNotFound { root: format!("{old:?}") });
    }

    outcome
}
