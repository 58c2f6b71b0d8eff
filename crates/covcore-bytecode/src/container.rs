//! Checksummed binary container for persisting a [`CodeUnit`] across a
//! process boundary — e.g. a host's bytecode cache written between two runs
//! of the same file.
//!
//! Format, grounded on `raya-bytecode`'s own `Module::encode`/`decode`:
//! `magic(4) + version(u32) + flags(u32) + checksum(u32)` header, followed
//! by a payload whose integrity the checksum covers. Unlike the teacher's
//! module format, the payload here is a `serde_json` document rather than
//! a hand-rolled field-by-field encoding — `CodeUnit`'s shape is already a
//! plain serializable tree once its identity field is set aside, so a
//! second bespoke binary encoder would just be `encoder.rs` rewritten by
//! hand. The header stays wordcode-native (`BytecodeWriter`/`BytecodeReader`,
//! the same tool the instruction stream itself is built with) because that
//! part — a fixed-width, checksum-verified prefix — is exactly what those
//! two types are for.
//!
//! A decoded `CodeUnit` is given a *fresh* [`CodeUnitId`]; identity is
//! never round-tripped through the container, since two processes loading
//! the same bytes are not the same reference the spec's identity model
//! talks about (I1/I5 only ever compare ids minted within one process).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codeunit::{CodeUnit, Constant, ConstantPool, ExceptionRegion, LineTableEntry};
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};

/// Magic bytes identifying a covcore code-unit container.
pub const MAGIC: [u8; 4] = *b"CVCU";

/// Current container format version.
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 4 + 4;

/// Errors from encoding or decoding a [`CodeUnit`] container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The header or length-prefixed fields ran past the end of the buffer.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The leading four bytes were not [`MAGIC`].
    #[error("invalid magic number: expected {MAGIC:?}, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// The header named a version this crate does not know how to read.
    #[error("unsupported container version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// The payload's CRC32 did not match the header's stored checksum.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum recorded in the header.
        expected: u32,
        /// Checksum actually computed over the payload.
        actual: u32,
    },

    /// The payload was not a valid encoding of a code unit.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct WireLineEntry {
    start_offset: usize,
    line: u32,
}

#[derive(Serialize, Deserialize)]
struct WireExceptionRegion {
    start_offset: usize,
    end_offset: usize,
    handler_offset: usize,
}

#[derive(Serialize, Deserialize)]
enum WireConstant {
    Int(i64),
    Float(f64),
    Str(String),
    Code(Box<WireCodeUnit>),
    ProbeHandle(u32),
}

#[derive(Serialize, Deserialize)]
struct WireCodeUnit {
    qualified_name: String,
    filename: String,
    code: Vec<u8>,
    line_table: Vec<WireLineEntry>,
    exception_table: Vec<WireExceptionRegion>,
    constants: Vec<WireConstant>,
    freevars: Vec<String>,
    cellvars: Vec<String>,
    max_stack: u32,
    local_count: u32,
    param_count: u32,
}

impl From<&CodeUnit> for WireCodeUnit {
    fn from(unit: &CodeUnit) -> Self {
        Self {
            qualified_name: unit.qualified_name.clone(),
            filename: unit.filename.clone(),
            code: unit.code.clone(),
            line_table: unit
                .line_table
                .iter()
                .map(|e| WireLineEntry { start_offset: e.start_offset, line: e.line })
                .collect(),
            exception_table: unit
                .exception_table
                .iter()
                .map(|r| WireExceptionRegion {
                    start_offset: r.start_offset,
                    end_offset: r.end_offset,
                    handler_offset: r.handler_offset,
                })
                .collect(),
            constants: unit.constants.iter().map(|(_, c)| WireConstant::from(c)).collect(),
            freevars: unit.freevars.clone(),
            cellvars: unit.cellvars.clone(),
            max_stack: unit.max_stack,
            local_count: unit.local_count,
            param_count: unit.param_count,
        }
    }
}

impl From<&Constant> for WireConstant {
    fn from(value: &Constant) -> Self {
        match value {
            Constant::Int(v) => WireConstant::Int(*v),
            Constant::Float(v) => WireConstant::Float(*v),
            Constant::Str(v) => WireConstant::Str(v.clone()),
            Constant::Code(unit) => WireConstant::Code(Box::new(WireCodeUnit::from(unit.as_ref()))),
            Constant::ProbeHandle(v) => WireConstant::ProbeHandle(*v),
        }
    }
}

impl WireCodeUnit {
    fn into_code_unit(self) -> CodeUnit {
        let mut unit = CodeUnit::new(self.qualified_name, self.filename);
        unit.code = self.code;
        unit.line_table = self
            .line_table
            .into_iter()
            .map(|e| LineTableEntry { start_offset: e.start_offset, line: e.line })
            .collect();
        unit.exception_table = self
            .exception_table
            .into_iter()
            .map(|r| ExceptionRegion {
                start_offset: r.start_offset,
                end_offset: r.end_offset,
                handler_offset: r.handler_offset,
            })
            .collect();
        unit.constants = self.constants.into_iter().fold(ConstantPool::new(), |mut pool, wire| {
            pool.push(wire.into_constant());
            pool
        });
        unit.freevars = self.freevars;
        unit.cellvars = self.cellvars;
        unit.max_stack = self.max_stack;
        unit.local_count = self.local_count;
        unit.param_count = self.param_count;
        unit
    }
}

impl WireConstant {
    fn into_constant(self) -> Constant {
        match self {
            WireConstant::Int(v) => Constant::Int(v),
            WireConstant::Float(v) => Constant::Float(v),
            WireConstant::Str(v) => Constant::Str(v),
            WireConstant::Code(wire) => Constant::Code(Box::new(wire.into_code_unit())),
            WireConstant::ProbeHandle(v) => Constant::ProbeHandle(v),
        }
    }
}

/// Encode `unit` (and, recursively, any nested code objects in its constant
/// pool) into a checksummed container.
pub fn encode_code_unit(unit: &CodeUnit) -> Vec<u8> {
    let payload = serde_json::to_vec(&WireCodeUnit::from(unit))
        .expect("WireCodeUnit has no non-serializable fields");

    let mut writer = BytecodeWriter::with_capacity(HEADER_LEN + payload.len());
    writer.buffer.extend_from_slice(&MAGIC);
    writer.emit_u32(VERSION);
    writer.emit_u32(0);
    let checksum_offset = writer.offset();
    writer.emit_u32(0);
    writer.buffer.extend_from_slice(&payload);

    let checksum = crc32fast::hash(&payload);
    writer.patch_u32(checksum_offset, checksum);
    writer.into_bytes()
}

/// Decode a container produced by [`encode_code_unit`]. The returned
/// `CodeUnit` has a freshly minted identity, never the encoding process's.
pub fn decode_code_unit(data: &[u8]) -> Result<CodeUnit, ContainerError> {
    let mut reader = BytecodeReader::new(data);

    let magic_bytes = reader.read_bytes(4)?;
    let magic: [u8; 4] = magic_bytes.try_into().unwrap();
    if magic != MAGIC {
        return Err(ContainerError::InvalidMagic(magic));
    }

    let version = reader.read_u32()?;
    if version != VERSION {
        return Err(ContainerError::UnsupportedVersion(version));
    }

    let _flags = reader.read_u32()?;
    let expected_checksum = reader.read_u32()?;

    let payload = &data[HEADER_LEN..];
    let actual_checksum = crc32fast::hash(payload);
    if actual_checksum != expected_checksum {
        return Err(ContainerError::ChecksumMismatch { expected: expected_checksum, actual: actual_checksum });
    }

    let wire: WireCodeUnit = serde_json::from_slice(payload)?;
    Ok(wire.into_code_unit())
}
