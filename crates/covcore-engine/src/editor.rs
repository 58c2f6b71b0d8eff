//! Bytecode editor: inserts and removes probe call sequences.
//!
//! A pure function of an input `CodeUnit` plus probe metadata — no global
//! state, no reference to a [`crate::driver::Driver`]. Grounded on
//! `raya-bytecode`'s encoder/verify pair: decode into a mutable
//! instruction list, resolve jump operands against list positions rather
//! than byte offsets, then re-emit once a fixpoint is reached.

use std::collections::{BTreeSet, HashMap};

use covcore_bytecode::{BytecodeWriter, CodeUnit, Constant, ExceptionRegion, LineTableEntry, Opcode};

use crate::error::BytecodeError;
use crate::probe::ProbeKey;

/// Sentinel constant-pool payload identifying "the probe signal callable",
/// as opposed to a per-site capsule handle (which is a small index into
/// the descriptors this call returns).
pub const SIGNAL_CONSTANT_HANDLE: u32 = u32::MAX;

/// One probe the editor inserted, for the driver to wrap in a real
/// [`crate::probe::ProbeSite`].
#[derive(Debug, Clone)]
pub struct ProbeDescriptor {
    /// Index matching the `Constant::ProbeHandle` this site's capsule
    /// constant carries.
    pub local_index: u32,
    /// The line or branch this site records.
    pub key: ProbeKey,
    /// Offset of the insert's leading (reserved) `NOP`.
    pub insert_offset: usize,
    /// Total length of the insert, in bytes.
    pub insert_len: usize,
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    /// An immediate value known up front; its encoded width never changes.
    Literal(u32),
    /// A jump target, named by the index of the target item in the
    /// working list. Resolved to a byte offset only once a fixpoint over
    /// all items' widths is reached.
    Jump(usize),
    /// A probe-prelude constant-pool index. Unlike `Literal`, this is
    /// always emitted at `BytecodeWriter::FIXED_INSTRUCTION_WIDTH` bytes:
    /// `capsule_const` grows by one for every probe in this `CodeUnit`, so
    /// an index that fits in one byte for an early site may need an
    /// `EXTENDED_ARG` prefix once enough later sites have pushed more
    /// constants — encoding it at a width keyed to its own magnitude would
    /// violate the fixed-insert-length invariant (I1, P2).
    ProbeConst(u32),
}

#[derive(Debug, Clone)]
struct Item {
    opcode: Opcode,
    operand: Operand,
    line: u32,
    /// Position of the corresponding instruction in the original decode,
    /// used to remap exception regions. `None` for instructions the
    /// editor synthesized (the probe prelude).
    orig_index: Option<usize>,
}

/// Insert a fixed-shape probe call before the first instruction of every
/// line in `line_set` (every reachable line, if `None`).
///
/// Returns the rewritten unit and the probe descriptors the driver should
/// wrap as [`crate::probe::ProbeSite`]s.
pub fn instrument(
    unit: &CodeUnit,
    line_set: Option<&BTreeSet<u32>>,
    keys_for_line: impl Fn(u32) -> Vec<ProbeKey>,
) -> Result<(CodeUnit, Vec<ProbeDescriptor>), BytecodeError> {
    let decoded = covcore_bytecode::decode_instructions(&unit.code).map_err(|err| {
        BytecodeError::Malformed { qualified_name: unit.qualified_name.clone(), reason: err.to_string() }
    })?;

    let targeted_lines: BTreeSet<u32> = match line_set {
        Some(set) => set.clone(),
        None => unit.reachable_lines().into_iter().collect(),
    };

    // orig_offset -> index in `decoded`, used below to find "first
    // instruction of a line" and to remap exception regions later.
    let offset_to_orig_index: HashMap<usize, usize> =
        decoded.iter().enumerate().map(|(i, d)| (d.offset, i)).collect();

    // first instruction index on each targeted line, in source order.
    let mut insertion_points: Vec<(usize, u32)> = Vec::new();
    let mut seen_lines: BTreeSet<u32> = BTreeSet::new();
    for (idx, instr) in decoded.iter().enumerate() {
        let line = unit.line_for_offset(instr.offset).unwrap_or(0);
        if targeted_lines.contains(&line) && seen_lines.insert(line) {
            insertion_points.push((idx, line));
        }
    }
    insertion_points.sort_by_key(|(idx, _)| *idx);

    let mut new_unit = unit.derive_empty();
    new_unit.constants = unit.constants.clone();
    new_unit.freevars = unit.freevars.clone();
    new_unit.cellvars = unit.cellvars.clone();
    new_unit.local_count = unit.local_count;
    new_unit.param_count = unit.param_count;

    let signal_const = match new_unit.constants.iter().find(|(_, c)| {
        matches!(c, Constant::ProbeHandle(h) if *h == SIGNAL_CONSTANT_HANDLE)
    }) {
        Some((idx, _)) => idx,
        None => new_unit.constants.push(Constant::ProbeHandle(SIGNAL_CONSTANT_HANDLE)),
    };

    // Build the working item list, splicing in a probe prelude ahead of
    // each insertion point.
    let mut items: Vec<Item> = Vec::with_capacity(decoded.len() + insertion_points.len() * 5);
    let mut descriptors = Vec::with_capacity(insertion_points.len());
    let mut insertion_iter = insertion_points.into_iter().peekable();
    let mut next_local_index: u32 = 0;

    for (idx, instr) in decoded.iter().enumerate() {
        if let Some((target_idx, line)) = insertion_iter.peek().copied() {
            if target_idx == idx {
                insertion_iter.next();
                for key in keys_for_line(line) {
                    let capsule_const = new_unit.constants.push(Constant::ProbeHandle(next_local_index));
                    let prelude_start = items.len();
                    items.push(Item { opcode: Opcode::Nop, operand: Operand::Literal(0), line, orig_index: None });
                    items.push(Item {
                        opcode: Opcode::LoadConst,
                        operand: Operand::ProbeConst(signal_const),
                        line,
                        orig_index: None,
                    });
                    items.push(Item {
                        opcode: Opcode::LoadConst,
                        operand: Operand::ProbeConst(capsule_const),
                        line,
                        orig_index: None,
                    });
                    items.push(Item {
                        opcode: Opcode::CallFunction,
                        operand: Operand::Literal(1),
                        line,
                        orig_index: None,
                    });
                    items.push(Item { opcode: Opcode::PopTop, operand: Operand::Literal(0), line, orig_index: None });
                    descriptors.push(ProbeDescriptor {
                        local_index: next_local_index,
                        key,
                        // filled in after the fixpoint below
                        insert_offset: prelude_start,
                        insert_len: 5,
                    });
                    next_local_index += 1;
                }
            }
        }

        let line = unit.line_for_offset(instr.offset).unwrap_or(0);
        let operand = if instr.opcode.is_jump() {
            let target_orig_index = *offset_to_orig_index.get(&(instr.oparg as usize)).ok_or_else(|| {
                BytecodeError::Malformed {
                    qualified_name: unit.qualified_name.clone(),
                    reason: format!("jump targets offset {} which is not an instruction boundary", instr.oparg),
                }
            })?;
            Operand::Jump(target_orig_index)
        } else {
            Operand::Literal(instr.oparg)
        };
        items.push(Item { opcode: instr.opcode, operand, line, orig_index: Some(idx) });
    }

    // Jump operands above name target items by *original* index; remap to
    // positions in `items` now that prelude splices are known.
    let orig_index_to_item_pos: HashMap<usize, usize> = items
        .iter()
        .enumerate()
        .filter_map(|(pos, item)| item.orig_index.map(|oi| (oi, pos)))
        .collect();
    for item in &mut items {
        if let Operand::Jump(target_orig_index) = item.operand {
            let pos = *orig_index_to_item_pos.get(&target_orig_index).ok_or_else(|| {
                BytecodeError::Malformed {
                    qualified_name: unit.qualified_name.clone(),
                    reason: "jump target instruction vanished during rewrite".to_string(),
                }
            })?;
            item.operand = Operand::Jump(pos);
        }
    }

    let widths = fixpoint_widths(&items);
    let offsets = prefix_offsets(&widths);
    let total_len = offsets.last().copied().unwrap_or(0) + widths.last().copied().unwrap_or(0);

    // Patch descriptor offsets (they were recorded as item positions above).
    for descriptor in &mut descriptors {
        let pos = descriptor.insert_offset;
        descriptor.insert_offset = offsets[pos];
        let nop_width = widths[pos];
        let last_width = widths[pos + 4];
        descriptor.insert_len = (offsets[pos + 4] + last_width) - offsets[pos];
        debug_assert!(nop_width > 0);
    }

    let mut writer = BytecodeWriter::with_capacity(total_len);
    for item in &items {
        match item.operand {
            Operand::Literal(v) => writer.emit_instruction(item.opcode, v),
            Operand::Jump(target_pos) => writer.emit_instruction(item.opcode, offsets[target_pos] as u32),
            Operand::ProbeConst(v) => writer.emit_instruction_fixed_width(item.opcode, v),
        }
    }
    new_unit.code = writer.into_bytes();

    new_unit.line_table = rebuild_line_table(&items, &offsets);
    new_unit.exception_table =
        remap_exception_table(&unit.exception_table, &offset_to_orig_index, &orig_index_to_item_pos, &offsets, total_len)
            .map_err(|reason| BytecodeError::LineTableIrreparable {
                qualified_name: unit.qualified_name.clone(),
                reason,
            })?;
    new_unit.max_stack = recompute_max_stack(&items);

    Ok((new_unit, descriptors))
}

/// Replace each listed probe's insert with an unconditional forward jump
/// spanning the whole insert. No bytes are added or removed; `new_code`
/// is the same length as `code.code`.
pub fn deinstrument(
    code: &CodeUnit,
    sites: &[(usize, usize)], // (insert_offset, insert_len)
) -> Result<CodeUnit, BytecodeError> {
    let mut bytes = code.code.clone();
    for &(offset, len) in sites {
        if offset + len > bytes.len() || len < 2 {
            return Err(BytecodeError::LineTableIrreparable {
                qualified_name: code.qualified_name.clone(),
                reason: format!("insert at {offset} (len {len}) is out of bounds"),
            });
        }
        // A forward JumpAbsolute needs the target's byte offset; the
        // insert is `len` bytes so the instruction immediately after it
        // starts at offset + len. The jump overwrites the insert's leading
        // bytes; anything left over stays NOP so no other offsets move
        // (P5, P2).
        let target = (offset + len) as u32;
        let mut prefix_writer = BytecodeWriter::with_capacity(len);
        prefix_writer.emit_instruction(Opcode::JumpAbsolute, target);
        let jump_bytes = prefix_writer.into_bytes();
        if jump_bytes.len() > len {
            return Err(BytecodeError::LineTableIrreparable {
                qualified_name: code.qualified_name.clone(),
                reason: format!(
                    "jump to {target} needs {} bytes, insert is only {len}",
                    jump_bytes.len()
                ),
            });
        }
        bytes[offset..offset + jump_bytes.len()].copy_from_slice(&jump_bytes);
        for b in &mut bytes[offset + jump_bytes.len()..offset + len] {
            *b = Opcode::Nop.to_u8();
        }
    }

    let mut new_unit = code.derive_empty();
    new_unit.code = bytes;
    new_unit.line_table = code.line_table.clone();
    new_unit.exception_table = code.exception_table.clone();
    new_unit.constants = code.constants.clone();
    new_unit.freevars = code.freevars.clone();
    new_unit.cellvars = code.cellvars.clone();
    new_unit.max_stack = code.max_stack;
    new_unit.local_count = code.local_count;
    new_unit.param_count = code.param_count;
    Ok(new_unit)
}

fn fixpoint_widths(items: &[Item]) -> Vec<usize> {
    let mut widths: Vec<usize> = items
        .iter()
        .map(|item| match item.operand {
            Operand::Literal(v) => BytecodeWriter::instruction_width(v),
            Operand::Jump(_) => 2,
            Operand::ProbeConst(_) => BytecodeWriter::FIXED_INSTRUCTION_WIDTH,
        })
        .collect();

    loop {
        let offsets = prefix_offsets(&widths);
        let mut changed = false;
        for (i, item) in items.iter().enumerate() {
            if let Operand::Jump(target_pos) = item.operand {
                let needed = BytecodeWriter::instruction_width(offsets[target_pos] as u32);
                if needed != widths[i] {
                    widths[i] = needed;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    widths
}

fn prefix_offsets(widths: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(widths.len());
    let mut running = 0usize;
    for &w in widths {
        offsets.push(running);
        running += w;
    }
    offsets
}

fn rebuild_line_table(items: &[Item], offsets: &[usize]) -> Vec<LineTableEntry> {
    let mut table = Vec::new();
    let mut last_line: Option<u32> = None;
    for (item, &offset) in items.iter().zip(offsets) {
        if last_line != Some(item.line) {
            table.push(LineTableEntry { start_offset: offset, line: item.line });
            last_line = Some(item.line);
        }
    }
    table
}

fn remap_exception_table(
    original: &[ExceptionRegion],
    offset_to_orig_index: &HashMap<usize, usize>,
    orig_index_to_item_pos: &HashMap<usize, usize>,
    offsets: &[usize],
    total_len: usize,
) -> Result<Vec<ExceptionRegion>, String> {
    let remap = |byte_offset: usize| -> Result<usize, String> {
        if let Some(&orig_idx) = offset_to_orig_index.get(&byte_offset) {
            let pos = *orig_index_to_item_pos
                .get(&orig_idx)
                .ok_or_else(|| format!("original instruction at {byte_offset} vanished from the rewrite"))?;
            return Ok(offsets[pos]);
        }
        // An end_offset may legitimately equal the original code length
        // (one-past-the-end); map that to the new total length.
        Ok(total_len)
    };

    original
        .iter()
        .map(|region| {
            Ok(ExceptionRegion {
                start_offset: remap(region.start_offset)?,
                end_offset: remap(region.end_offset)?,
                handler_offset: remap(region.handler_offset)?,
            })
        })
        .collect()
}

fn recompute_max_stack(items: &[Item]) -> u32 {
    let mut depth: i32 = 0;
    let mut peak: i32 = 0;
    for item in items {
        let oparg = match item.operand {
            Operand::Literal(v) => v,
            Operand::Jump(_) => 0,
            Operand::ProbeConst(v) => v,
        };
        depth += item.opcode.stack_effect(oparg);
        peak = peak.max(depth);
    }
    peak.max(0) as u32
}
