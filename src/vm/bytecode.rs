//! Bytecode container serialization/deserialization.
//!
//! Binary format:
//! - Magic: "OPAL" (4 bytes)
//! - Version: u32 (little-endian)
//! - Code: varint length + raw bytes
//! - Constant pool: varint count + zigzag-varint i64 entries
//! - String table: varint count + (varint length + UTF-8 bytes) entries
//! - Name table: same layout as the string table
//! - Line table: varint count + varint u32 entries
//!
//! All counts and lengths are LEB128 varints. Round-tripping a chunk
//! reproduces byte-identical code, constants, and strings.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use super::Chunk;

/// Magic bytes for opal bytecode files.
pub const MAGIC: &[u8; 4] = b"OPAL";

/// Current bytecode format version.
pub const VERSION: u32 = 1;

/// Error type for bytecode container operations.
#[derive(Debug)]
pub enum BytecodeError {
    /// Invalid magic number
    InvalidMagic,
    /// Unsupported version
    UnsupportedVersion(u32),
    /// Truncated data
    UnexpectedEof,
    /// Varint wider than its target type
    VarintOverflow,
    /// Invalid UTF-8 in a string entry
    InvalidUtf8,
    /// I/O error
    Io(io::Error),
}

impl From<io::Error> for BytecodeError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BytecodeError::UnexpectedEof
        } else {
            BytecodeError::Io(e)
        }
    }
}

impl std::fmt::Display for BytecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BytecodeError::InvalidMagic => write!(f, "invalid magic number"),
            BytecodeError::UnsupportedVersion(v) => write!(f, "unsupported version: {}", v),
            BytecodeError::UnexpectedEof => write!(f, "unexpected end of file"),
            BytecodeError::VarintOverflow => write!(f, "varint out of range"),
            BytecodeError::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            BytecodeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for BytecodeError {}

/// Serialize a chunk to bytes.
pub fn serialize(chunk: &Chunk) -> Vec<u8> {
    let mut buf = Vec::new();
    write_chunk(&mut buf, chunk).expect("writing to Vec cannot fail");
    buf
}

/// Deserialize a chunk from bytes.
pub fn deserialize(data: &[u8]) -> Result<Chunk, BytecodeError> {
    let mut cursor = io::Cursor::new(data);
    read_chunk(&mut cursor)
}

/// Write a `.opalb` file.
pub fn write_file(path: &Path, chunk: &Chunk) -> Result<(), BytecodeError> {
    fs::write(path, serialize(chunk)).map_err(BytecodeError::from)
}

/// Read a `.opalb` file.
pub fn read_file(path: &Path) -> Result<Chunk, BytecodeError> {
    let data = fs::read(path)?;
    deserialize(&data)
}

/// Write a chunk to a writer.
pub fn write_chunk<W: Write>(w: &mut W, chunk: &Chunk) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;

    write_varint(w, chunk.code.len() as u64)?;
    w.write_all(&chunk.code)?;

    write_varint(w, chunk.consts.len() as u64)?;
    for &value in &chunk.consts {
        write_varint(w, zigzag_encode(value))?;
    }

    write_varint(w, chunk.strings.len() as u64)?;
    for s in &chunk.strings {
        write_string(w, s)?;
    }

    write_varint(w, chunk.names.len() as u64)?;
    for n in &chunk.names {
        write_string(w, n)?;
    }

    write_varint(w, chunk.lines.len() as u64)?;
    for &line in &chunk.lines {
        write_varint(w, line as u64)?;
    }

    Ok(())
}

/// Read a chunk from a reader.
pub fn read_chunk<R: Read>(r: &mut R) -> Result<Chunk, BytecodeError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    let mut version_bytes = [0u8; 4];
    r.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let code_len = read_varint(r)? as usize;
    let mut code = vec![0u8; code_len];
    r.read_exact(&mut code)?;

    let const_count = read_varint(r)? as usize;
    let mut consts = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        consts.push(zigzag_decode(read_varint(r)?));
    }

    let string_count = read_varint(r)? as usize;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        strings.push(read_string(r)?);
    }

    let name_count = read_varint(r)? as usize;
    let mut names = Vec::with_capacity(name_count);
    for _ in 0..name_count {
        names.push(read_string(r)?);
    }

    let line_count = read_varint(r)? as usize;
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        let line = read_varint(r)?;
        if line > u32::MAX as u64 {
            return Err(BytecodeError::VarintOverflow);
        }
        lines.push(line as u32);
    }

    Ok(Chunk {
        code,
        lines,
        consts,
        strings,
        names,
    })
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_varint(w, s.len() as u64)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    let len = read_varint(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| BytecodeError::InvalidUtf8)
}

/// LEB128 unsigned varint.
fn write_varint<W: Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            return w.write_all(&[byte]);
        }
        w.write_all(&[byte | 0x80])?;
    }
}

fn read_varint<R: Read>(r: &mut R) -> Result<u64, BytecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        if shift >= 64 {
            return Err(BytecodeError::VarintOverflow);
        }
        value |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Map signed to unsigned so small negative constants stay small.
fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            let mut cursor = io::Cursor::new(buf);
            assert_eq!(read_varint(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn test_zigzag_round_trip() {
        for value in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn test_chunk_round_trip_is_bit_identical() {
        let chunk = compile_source(
            "class A { init() { this.x = -42; } m() { return \"hi\"; } } \
             fun f(n) { if (n < 10) { return f(n + 1); } return n; } \
             var a = A(); var r = f(0);",
        )
        .unwrap();

        let bytes = serialize(&chunk);
        let back = deserialize(&bytes).unwrap();

        assert_eq!(back.code, chunk.code);
        assert_eq!(back.consts, chunk.consts);
        assert_eq!(back.strings, chunk.strings);
        assert_eq!(back.names, chunk.names);
        assert_eq!(back.lines, chunk.lines);

        // And the serialized form itself is stable.
        assert_eq!(serialize(&back), bytes);
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let chunk = compile_source("1;").unwrap();
        let mut bytes = serialize(&chunk);
        bytes[0] = b'X';
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let chunk = compile_source("1;").unwrap();
        let mut bytes = serialize(&chunk);
        bytes[4] = 99;
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let chunk = compile_source("var x = 1;").unwrap();
        let bytes = serialize(&chunk);
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            deserialize(truncated),
            Err(BytecodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_deserialized_chunk_runs() {
        use crate::config::RuntimeConfig;
        use crate::vm::VM;

        let chunk = compile_source("var x = (2 + 3) * 4;").unwrap();
        let back = deserialize(&serialize(&chunk)).unwrap();
        let mut vm = VM::new(&RuntimeConfig::default());
        vm.run(&back).unwrap();
    }
}
