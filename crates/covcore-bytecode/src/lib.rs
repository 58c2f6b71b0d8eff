//! Wordcode instruction model for the covcore instrumentation engine
//!
//! This crate defines the host bytecode shape the editor and verifier
//! operate on: the opcode table, the extended-argument encoding convention,
//! the `CodeUnit` data model (raw instructions, line table, exception
//! table, constant pool, stack depth), and a verifier that checks jump
//! integrity and stack-depth consistency.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod codeunit;
pub mod container;
pub mod encoder;
pub mod opcode;
pub mod verify;

pub use codeunit::{CodeUnit, CodeUnitId, Constant, ConstantPool, ExceptionRegion, LineTableEntry};
pub use container::{decode_code_unit, encode_code_unit, ContainerError, MAGIC, VERSION};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use opcode::Opcode;
pub use verify::{decode_instructions, verify_code_unit, DecodedInstruction, VerifyError};
