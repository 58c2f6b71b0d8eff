//! Wordcode reading/writing with the extended-argument convention
//!
//! Instructions are always two bytes (opcode, low 8 bits of the operand).
//! An operand that does not fit in a byte is prefixed by one or more
//! `ExtendedArg` instructions, each carrying 8 more high bits; a reader
//! accumulates them and resets to zero after consuming the instruction
//! they apply to.

use crate::opcode::Opcode;
use thiserror::Error;

/// Errors that can occur while decoding a wordcode stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The stream ended in the middle of an instruction.
    #[error("unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// A byte did not name a known opcode.
    #[error("invalid opcode {0:#04x} at offset {1}")]
    InvalidOpcode(u8, usize),

    /// A dangling `ExtendedArg` prefix with nothing to extend.
    #[error("trailing EXTENDED_ARG with no following instruction at offset {0}")]
    DanglingExtendedArg(usize),
}

/// Writes a wordcode stream, one two-byte instruction at a time.
#[derive(Debug, Default)]
pub struct BytecodeWriter {
    pub(crate) buffer: Vec<u8>,
}

impl BytecodeWriter {
    /// Create a new, empty writer.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a writer pre-sized for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Borrow the bytes written so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer, returning the bytes written.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Current write offset.
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    /// Emit a raw byte.
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 32-bit little-endian integer.
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a previously-emitted `u32` at `offset` (used to patch a
    /// placeholder checksum or length field after the fact).
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Emit a single two-byte instruction with a plain byte-sized operand.
    /// Callers needing a wider operand should use [`emit_instruction`].
    pub fn emit_raw(&mut self, opcode: Opcode, oparg: u8) {
        self.buffer.push(opcode.to_u8());
        self.buffer.push(oparg);
    }

    /// Emit an instruction, prefixing as many `ExtendedArg` instructions as
    /// needed to carry an operand wider than one byte. Every instruction
    /// this emits is exactly two bytes, so the total length is always
    /// `2 * ceil(bits_needed / 8)`, at minimum 2.
    pub fn emit_instruction(&mut self, opcode: Opcode, oparg: u32) {
        let bytes = oparg.to_be_bytes();
        // Only the three high bytes can turn into EXTENDED_ARG prefixes; the
        // low byte always rides along on the instruction itself.
        let first_significant = bytes[..3].iter().position(|&b| b != 0).unwrap_or(3);
        for &hi in &bytes[first_significant..3] {
            self.emit_raw(Opcode::ExtendedArg, hi);
        }
        self.emit_raw(opcode, bytes[3]);
    }

    /// Number of two-byte instructions (including `ExtendedArg` prefixes)
    /// required to encode `oparg`.
    pub fn instruction_width(oparg: u32) -> usize {
        let bytes = oparg.to_be_bytes();
        let first_significant = bytes[..3].iter().position(|&b| b != 0).unwrap_or(3);
        (3 - first_significant + 1) * 2
    }

    /// Emit an instruction at the canonical maximum width: all three
    /// `ExtendedArg` prefixes, even when their byte is zero. A reader
    /// folds zero-valued prefixes exactly like any other, so this decodes
    /// to the same `oparg` as [`emit_instruction`] while always taking
    /// [`FIXED_INSTRUCTION_WIDTH`] bytes. Sites whose operand can grow
    /// across the lifetime of the buffer (a constant-pool index that gets
    /// more entries appended after this instruction was emitted) need this
    /// to keep a fixed byte length regardless of how large the operand
    /// eventually becomes.
    pub fn emit_instruction_fixed_width(&mut self, opcode: Opcode, oparg: u32) {
        let bytes = oparg.to_be_bytes();
        for &hi in &bytes[..3] {
            self.emit_raw(Opcode::ExtendedArg, hi);
        }
        self.emit_raw(opcode, bytes[3]);
    }

    /// The width every [`emit_instruction_fixed_width`] call produces,
    /// regardless of `oparg`.
    pub const FIXED_INSTRUCTION_WIDTH: usize = 8;
}

/// Reads a wordcode stream, accumulating `ExtendedArg` prefixes.
pub struct BytecodeReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BytecodeReader<'a> {
    /// Wrap `buffer` for reading from offset zero.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether there are more bytes to read.
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to an absolute offset.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Read a single raw byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.position >= self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Read a 32-bit little-endian integer.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        if self.position + 4 > self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let bytes: [u8; 4] = self.buffer[self.position..self.position + 4]
            .try_into()
            .unwrap();
        self.position += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        if self.position + len > self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let bytes = self.buffer[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(bytes)
    }

    /// Read a length-prefixed UTF-8 string (u32 byte length, then bytes).
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::UnexpectedEnd(start))
    }

    /// Decode one logical instruction, folding in any `ExtendedArg`
    /// prefixes that precede it. Returns `(offset_of_first_byte, opcode,
    /// resolved_oparg, total_width_in_bytes)`.
    pub fn read_instruction(&mut self) -> Result<(usize, Opcode, u32, usize), DecodeError> {
        let start = self.position;
        let mut oparg: u32 = 0;

        loop {
            let offset = self.position;
            let byte = self.read_u8()?;
            let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;
            let low = self.read_u8()?;

            if opcode == Opcode::ExtendedArg {
                oparg = (oparg << 8) | u32::from(low);
                if !self.has_more() {
                    return Err(DecodeError::DanglingExtendedArg(offset));
                }
                continue;
            }

            oparg = (oparg << 8) | u32::from(low);
            return Ok((start, opcode, oparg, self.position - start));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_oparg_is_two_bytes() {
        let mut w = BytecodeWriter::new();
        w.emit_instruction(Opcode::LoadFast, 3);
        assert_eq!(w.into_bytes(), vec![Opcode::LoadFast.to_u8(), 3]);
    }

    #[test]
    fn wide_oparg_gets_extended_arg_prefix() {
        let mut w = BytecodeWriter::new();
        w.emit_instruction(Opcode::LoadConst, 0x1234);
        let bytes = w.into_bytes();
        assert_eq!(
            bytes,
            vec![Opcode::ExtendedArg.to_u8(), 0x12, Opcode::LoadConst.to_u8(), 0x34]
        );
    }

    #[test]
    fn roundtrip_through_reader() {
        for &oparg in &[0u32, 1, 255, 256, 65535, 65536, 0xDEAD_BEEF] {
            let mut w = BytecodeWriter::new();
            w.emit_instruction(Opcode::LoadConst, oparg);
            let bytes = w.into_bytes();
            let mut r = BytecodeReader::new(&bytes);
            let (offset, opcode, decoded, width) = r.read_instruction().unwrap();
            assert_eq!(offset, 0);
            assert_eq!(opcode, Opcode::LoadConst);
            assert_eq!(decoded, oparg);
            assert_eq!(width, bytes.len());
            assert!(!r.has_more());
        }
    }

    #[test]
    fn instruction_width_matches_emitted_length() {
        for &oparg in &[0u32, 10, 1000, 100_000, u32::MAX] {
            let mut w = BytecodeWriter::new();
            w.emit_instruction(Opcode::LoadConst, oparg);
            assert_eq!(BytecodeWriter::instruction_width(oparg), w.into_bytes().len());
        }
    }

    #[test]
    fn fixed_width_is_constant_regardless_of_oparg() {
        for &oparg in &[0u32, 1, 255, 65536, u32::MAX] {
            let mut w = BytecodeWriter::new();
            w.emit_instruction_fixed_width(Opcode::LoadConst, oparg);
            assert_eq!(w.into_bytes().len(), BytecodeWriter::FIXED_INSTRUCTION_WIDTH);
        }
    }

    #[test]
    fn fixed_width_roundtrips_through_reader() {
        for &oparg in &[0u32, 3, 0xABCD, u32::MAX] {
            let mut w = BytecodeWriter::new();
            w.emit_instruction_fixed_width(Opcode::LoadConst, oparg);
            let bytes = w.into_bytes();
            assert_eq!(bytes.len(), BytecodeWriter::FIXED_INSTRUCTION_WIDTH);
            let mut r = BytecodeReader::new(&bytes);
            let (offset, opcode, decoded, width) = r.read_instruction().unwrap();
            assert_eq!(offset, 0);
            assert_eq!(opcode, Opcode::LoadConst);
            assert_eq!(decoded, oparg);
            assert_eq!(width, bytes.len());
        }
    }

    #[test]
    fn dangling_extended_arg_is_an_error() {
        let bytes = vec![Opcode::ExtendedArg.to_u8(), 0x01];
        let mut r = BytecodeReader::new(&bytes);
        assert!(matches!(
            r.read_instruction(),
            Err(DecodeError::DanglingExtendedArg(0))
        ));
    }

    #[test]
    fn invalid_opcode_is_rejected() {
        let bytes = vec![0x7A, 0x00];
        let mut r = BytecodeReader::new(&bytes);
        assert_eq!(r.read_instruction(), Err(DecodeError::InvalidOpcode(0x7A, 0)));
    }
}
