use crate::{CodeBlockError, Constant, Result};

/// An in-process bytecode container: append-only while a producer assembles
/// it, read-only once execution begins.
///
/// Four parallel buffers back a `CodeBlock`: the bytecode bytes themselves,
/// the constant pool, a per-byte source-line side table (same length as
/// `code`), and a `(byte index -> label)` side table used only for
/// disassembly/diagnostics. There is no on-disk format: a `CodeBlock` is
/// built directly by a producer in the same process that will execute it.
#[derive(Debug, Default, Clone)]
pub struct CodeBlock {
    code: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Constant>,
    label_indices: Vec<usize>,
    label_names: Vec<String>,
}

impl CodeBlock {
    /// Creates an empty code block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one bytecode byte, recording the source line it came from.
    pub fn write_chunk(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Appends a multi-byte operand (big-endian) at the current write position.
    pub fn write_operand(&mut self, bytes: &[u8], line: u32) {
        for &byte in bytes {
            self.write_chunk(byte, line);
        }
    }

    /// Interns a constant, returning its pool index.
    ///
    /// # Errors
    /// Returns [`CodeBlockError::ConstantPoolFull`] once 256 constants have
    /// been added (Invariant 7: a constant index must fit in one byte).
    pub fn add_constant(&mut self, value: impl Into<Constant>) -> Result<u8> {
        if self.constants.len() >= 256 {
            return Err(CodeBlockError::ConstantPoolFull);
        }
        self.constants.push(value.into());
        Ok((self.constants.len() - 1) as u8)
    }

    /// Records a `(byte index -> label)` association for disassembly.
    pub fn write_label(&mut self, byte_index: usize, text: impl Into<String>) {
        self.label_indices.push(byte_index);
        self.label_names.push(text.into());
    }

    /// The raw bytecode bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// The number of bytes of bytecode currently written.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether no bytecode has been written yet.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The constant pool.
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Looks up a constant by its pool index.
    pub fn constant(&self, index: u8) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// The source line recorded for a given bytecode offset, if any.
    pub fn line_for(&self, byte_index: usize) -> Option<u32> {
        self.lines.get(byte_index).copied()
    }

    /// The label recorded at a given bytecode offset, if any.
    pub fn label_at(&self, byte_index: usize) -> Option<&str> {
        self.label_indices
            .iter()
            .position(|&idx| idx == byte_index)
            .map(|pos| self.label_names[pos].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_chunk_grows_code_and_lines_in_lockstep() {
        let mut block = CodeBlock::new();
        block.write_chunk(0x06, 1);
        block.write_chunk(0x00, 1);
        assert_eq!(block.code(), &[0x06, 0x00]);
        assert_eq!(block.line_for(0), Some(1));
        assert_eq!(block.line_for(1), Some(1));
    }

    #[test]
    fn add_constant_returns_sequential_indices() {
        let mut block = CodeBlock::new();
        assert_eq!(block.add_constant(1.5).unwrap(), 0);
        assert_eq!(block.add_constant("hi").unwrap(), 1);
        assert_eq!(block.constant(0), Some(&Constant::Double(1.5)));
        assert_eq!(block.constant(1), Some(&Constant::Str("hi".to_owned())));
    }

    #[test]
    fn constant_pool_rejects_a_257th_entry() {
        let mut block = CodeBlock::new();
        for i in 0..256 {
            block.add_constant(i as f64).unwrap();
        }
        assert_eq!(
            block.add_constant(0.0).unwrap_err(),
            CodeBlockError::ConstantPoolFull
        );
    }

    #[test]
    fn labels_are_queryable_by_byte_index() {
        let mut block = CodeBlock::new();
        block.write_chunk(0x00, 1);
        block.write_label(0, "entry");
        assert_eq!(block.label_at(0), Some("entry"));
        assert_eq!(block.label_at(1), None);
    }

    #[test]
    fn write_operand_appends_bytes_in_order() {
        let mut block = CodeBlock::new();
        block.write_operand(&[0x00, 0x01, 0x02, 0x03], 4);
        assert_eq!(block.code(), &[0x00, 0x01, 0x02, 0x03]);
        assert!(block.line_for(3).is_some());
    }
}
