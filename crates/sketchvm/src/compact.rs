//! CompactAST: the fixed little-endian binary interchange format for ASTs.
//!
//! Layout:
//!
//! ```text
//! header (16 bytes):
//!   magic    : u32 = 0x41535450 ('ASTP')
//!   version  : u16 = 0x0100
//!   flags    : u16 = 0
//!   nodeCount: u32
//!   stringTableSize: u32
//! string table: stringTableSize bytes of (u16 length, UTF-8) entries,
//!   deduplicated, referenced by 16-bit index
//! node table: nodeCount entries in pre-order:
//!   kind u8, flags u8, dataType u8, childCount u8, nameIndex u16,
//!   value (per dataType), childIndices [u16; childCount]
//! ```
//!
//! Child indices are relative (`child - self`), so subtrees relocate
//! cleanly. Value fields of 4 or 8 bytes are aligned to a 4-byte boundary
//! from the start of the buffer; padding bytes are zero.

use std::fmt;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::ast::{Ast, Literal, Node, NodeId, NodeKind};

pub const MAGIC: u32 = 0x4153_5450;
pub const VERSION: u16 = 0x0100;

/// Index value meaning "no name".
const NO_NAME: u16 = 0xFFFF;

/// Closed value-type enumeration for node payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum ValueType {
    Void = 0,
    Bool = 1,
    Int8 = 2,
    UInt8 = 3,
    Int16 = 4,
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Int64 = 8,
    UInt64 = 9,
    Float32 = 10,
    Float64 = 11,
    Str = 12,
    Array = 13,
    Null = 14,
    /// Operator symbol, stored as a string-table index.
    Operator = 15,
}

/// Errors the encoder can produce. All of them are structural limits of the
/// 16-bit index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    TooManyStrings(usize),
    StringTooLong(usize),
    ChildTooFar { parent: usize, child: usize },
    TooManyChildren { node: usize, count: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyStrings(count) => write!(f, "string table overflow: {count} entries"),
            Self::StringTooLong(len) => write!(f, "string of {len} bytes exceeds u16 length"),
            Self::ChildTooFar { parent, child } => {
                write!(f, "child {child} more than u16 away from parent {parent}")
            }
            Self::TooManyChildren { node, count } => {
                write!(f, "node {node} has {count} children, exceeding u8")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors the decoder can produce; all map to `ErrorKind::BadFormat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    BadMagic(u32),
    BadVersion(u16),
    Truncated,
    TrailingBytes { consumed: usize, total: usize },
    BadStringTable,
    BadNodeKind(u8),
    BadValueType(u8),
    BadStringIndex(u16),
    /// A child reference that is zero or points before the parent.
    BadChildRef { parent: usize, offset: u16 },
    ChildOutOfRange { parent: usize, child: usize },
    NonZeroPadding,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(magic) => write!(f, "invalid magic number: 0x{magic:08x}"),
            Self::BadVersion(version) => write!(f, "unsupported version: 0x{version:04x}"),
            Self::Truncated => f.write_str("buffer truncated"),
            Self::TrailingBytes { consumed, total } => {
                write!(f, "decoded {consumed} bytes of {total}; trailing bytes remain")
            }
            Self::BadStringTable => f.write_str("malformed string table"),
            Self::BadNodeKind(kind) => write!(f, "unknown node kind 0x{kind:02x}"),
            Self::BadValueType(vt) => write!(f, "unknown value type {vt}"),
            Self::BadStringIndex(idx) => write!(f, "string index {idx} out of range"),
            Self::BadChildRef { parent, offset } => {
                write!(f, "node {parent} has non-forward child offset {offset}")
            }
            Self::ChildOutOfRange { parent, child } => {
                write!(f, "node {parent} references child {child} past the node table")
            }
            Self::NonZeroPadding => f.write_str("alignment padding is not zero"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl DecodeError {
    #[must_use]
    pub fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::BadFormat
    }
}

// ----------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------

/// Encodes an AST into CompactAST bytes.
pub fn encode(ast: &Ast) -> Result<Vec<u8>, EncodeError> {
    let mut strings = StringTable::default();

    // Intern all names first so the table is complete before nodes are laid
    // out.
    for (_, node) in ast.iter() {
        if let Some(name) = &node.name {
            strings.intern(name)?;
        }
        if let Some(Literal::Str(s)) = &node.value {
            strings.intern(s)?;
        }
    }

    let mut out = Vec::with_capacity(64 + ast.len() * 12);
    push_u32(&mut out, MAGIC);
    push_u16(&mut out, VERSION);
    push_u16(&mut out, 0); // flags
    push_u32(&mut out, u32::try_from(ast.len()).expect("node count fits u32"));
    push_u32(&mut out, u32::try_from(strings.bytes.len()).expect("string table fits u32"));
    out.extend_from_slice(&strings.bytes);

    for (id, node) in ast.iter() {
        encode_node(&mut out, id, node, &strings)?;
    }
    Ok(out)
}

fn encode_node(out: &mut Vec<u8>, id: NodeId, node: &Node, strings: &StringTable) -> Result<(), EncodeError> {
    let index = id.index();
    let child_count =
        u8::try_from(node.children.len()).map_err(|_| EncodeError::TooManyChildren {
            node: index,
            count: node.children.len(),
        })?;

    let (data_type, payload) = node_payload(node, strings);

    out.push(node.kind as u8);
    out.push(node.flags);
    out.push(data_type as u8);
    out.push(child_count);

    let name_index = match (&node.name, data_type) {
        // Operator nodes carry their symbol in the value slot instead.
        (_, ValueType::Operator) => NO_NAME,
        (Some(name), _) => strings.index_of(name),
        (None, _) => NO_NAME,
    };
    push_u16(out, name_index);

    match payload {
        Payload::None => {}
        Payload::Byte(b) => out.push(b),
        Payload::Word(w) => push_u16(out, w),
        Payload::DWord(w) => {
            align4(out);
            push_u32(out, w);
        }
        Payload::QWord(w) => {
            align4(out);
            push_u64(out, w);
        }
    }

    for child in &node.children {
        let offset = child
            .index()
            .checked_sub(index)
            .and_then(|diff| u16::try_from(diff).ok())
            .ok_or(EncodeError::ChildTooFar {
                parent: index,
                child: child.index(),
            })?;
        debug_assert!(offset > 0, "arena is pre-order");
        push_u16(out, offset);
    }
    Ok(())
}

enum Payload {
    None,
    Byte(u8),
    Word(u16),
    DWord(u32),
    QWord(u64),
}

/// Picks the value type and payload for one node. Integers are stored in
/// the narrowest lane that fits; decoders widen them back.
fn node_payload(node: &Node, strings: &StringTable) -> (ValueType, Payload) {
    if node.kind.is_operator() {
        let symbol = node.name.as_deref().unwrap_or("");
        return (ValueType::Operator, Payload::Word(strings.index_of(symbol)));
    }
    if node.kind == NodeKind::InitializerList {
        return (ValueType::Array, Payload::Word(node.children.len() as u16));
    }
    match &node.value {
        None => (ValueType::Void, Payload::None),
        Some(Literal::Null) => (ValueType::Null, Payload::None),
        Some(Literal::Bool(b)) => (ValueType::Bool, Payload::Byte(u8::from(*b))),
        Some(Literal::Char(code)) => (ValueType::UInt32, Payload::DWord(*code)),
        Some(Literal::Str(s)) => (ValueType::Str, Payload::Word(strings.index_of(s))),
        Some(Literal::Float32(v)) => (ValueType::Float32, Payload::DWord(v.to_bits())),
        Some(Literal::Float64(v)) => (ValueType::Float64, Payload::QWord(v.to_bits())),
        Some(Literal::Int { value, unsigned: false }) => {
            let v = *value;
            if let Ok(b) = i8::try_from(v) {
                (ValueType::Int8, Payload::Byte(b as u8))
            } else if let Ok(w) = i16::try_from(v) {
                (ValueType::Int16, Payload::Word(w as u16))
            } else if let Ok(d) = i32::try_from(v) {
                (ValueType::Int32, Payload::DWord(d as u32))
            } else {
                (ValueType::Int64, Payload::QWord(v as u64))
            }
        }
        Some(Literal::Int { value, unsigned: true }) => {
            let v = *value as u64;
            if let Ok(b) = u8::try_from(v) {
                (ValueType::UInt8, Payload::Byte(b))
            } else if let Ok(w) = u16::try_from(v) {
                (ValueType::UInt16, Payload::Word(w))
            } else if let Ok(d) = u32::try_from(v) {
                (ValueType::UInt32, Payload::DWord(d))
            } else {
                (ValueType::UInt64, Payload::QWord(v))
            }
        }
    }
}

#[derive(Default)]
struct StringTable {
    bytes: Vec<u8>,
    indices: AHashMap<String, u16>,
    entries: Vec<String>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> Result<u16, EncodeError> {
        if let Some(idx) = self.indices.get(s) {
            return Ok(*idx);
        }
        let idx = u16::try_from(self.entries.len()).map_err(|_| EncodeError::TooManyStrings(self.entries.len()))?;
        if idx == NO_NAME {
            return Err(EncodeError::TooManyStrings(self.entries.len()));
        }
        let len = u16::try_from(s.len()).map_err(|_| EncodeError::StringTooLong(s.len()))?;
        push_u16(&mut self.bytes, len);
        self.bytes.extend_from_slice(s.as_bytes());
        self.indices.insert(s.to_owned(), idx);
        self.entries.push(s.to_owned());
        Ok(idx)
    }

    fn index_of(&self, s: &str) -> u16 {
        *self.indices.get(s).expect("string interned during pre-pass")
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn align4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

// ----------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------

/// Decodes CompactAST bytes back into an [`Ast`].
///
/// Magic and version are checked first. Every child index must point
/// strictly later in pre-order than its parent, and the whole buffer must be
/// consumed.
pub fn decode(bytes: &[u8]) -> Result<Ast, DecodeError> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.read_u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = cursor.read_u16()?;
    // Accept higher minor versions; refuse a different major version.
    if version >> 8 != VERSION >> 8 || version < VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let _flags = cursor.read_u16()?; // unknown flag bits are ignored
    let node_count = cursor.read_u32()? as usize;
    let string_table_size = cursor.read_u32()? as usize;

    let strings = read_string_table(&mut cursor, string_table_size)?;

    let mut ast = Ast::new();
    for index in 0..node_count {
        let node = decode_node(&mut cursor, index, node_count, &strings)?;
        ast.push_node(node);
    }

    if cursor.pos != bytes.len() {
        return Err(DecodeError::TrailingBytes {
            consumed: cursor.pos,
            total: bytes.len(),
        });
    }
    Ok(ast)
}

fn read_string_table(cursor: &mut Cursor<'_>, size: usize) -> Result<Vec<String>, DecodeError> {
    let end = cursor
        .pos
        .checked_add(size)
        .filter(|end| *end <= cursor.bytes.len())
        .ok_or(DecodeError::Truncated)?;
    let mut strings = Vec::new();
    while cursor.pos < end {
        let len = cursor.read_u16()? as usize;
        if cursor.pos + len > end {
            return Err(DecodeError::BadStringTable);
        }
        let slice = &cursor.bytes[cursor.pos..cursor.pos + len];
        let s = std::str::from_utf8(slice).map_err(|_| DecodeError::BadStringTable)?;
        strings.push(s.to_owned());
        cursor.pos += len;
    }
    if cursor.pos != end {
        return Err(DecodeError::BadStringTable);
    }
    Ok(strings)
}

fn decode_node(cursor: &mut Cursor<'_>, index: usize, node_count: usize, strings: &[String]) -> Result<Node, DecodeError> {
    let kind_byte = cursor.read_u8()?;
    let kind = NodeKind::from_repr(kind_byte).ok_or(DecodeError::BadNodeKind(kind_byte))?;
    let flags = cursor.read_u8()?;
    let data_type_byte = cursor.read_u8()?;
    let data_type = ValueType::from_repr(data_type_byte).ok_or(DecodeError::BadValueType(data_type_byte))?;
    let child_count = cursor.read_u8()? as usize;
    let name_index = cursor.read_u16()?;

    let lookup = |idx: u16| -> Result<String, DecodeError> {
        strings
            .get(idx as usize)
            .cloned()
            .ok_or(DecodeError::BadStringIndex(idx))
    };

    let mut name = if name_index == NO_NAME { None } else { Some(lookup(name_index)?) };
    let mut value = None;

    match data_type {
        ValueType::Void => {}
        ValueType::Null => value = Some(Literal::Null),
        ValueType::Bool => value = Some(Literal::Bool(cursor.read_u8()? != 0)),
        ValueType::Int8 => {
            let v = cursor.read_u8()? as i8;
            value = Some(Literal::Int {
                value: i64::from(v),
                unsigned: false,
            });
        }
        ValueType::UInt8 => {
            let v = cursor.read_u8()?;
            value = Some(Literal::Int {
                value: i64::from(v),
                unsigned: true,
            });
        }
        ValueType::Int16 => {
            let v = cursor.read_u16()? as i16;
            value = Some(Literal::Int {
                value: i64::from(v),
                unsigned: false,
            });
        }
        ValueType::UInt16 => {
            let v = cursor.read_u16()?;
            value = Some(Literal::Int {
                value: i64::from(v),
                unsigned: true,
            });
        }
        ValueType::Int32 => {
            cursor.align4()?;
            let v = cursor.read_u32()? as i32;
            value = Some(Literal::Int {
                value: i64::from(v),
                unsigned: false,
            });
        }
        ValueType::UInt32 => {
            cursor.align4()?;
            let v = cursor.read_u32()?;
            if matches!(kind, NodeKind::CharLiteral | NodeKind::WideCharLiteral) {
                value = Some(Literal::Char(v));
            } else {
                value = Some(Literal::Int {
                    value: i64::from(v),
                    unsigned: true,
                });
            }
        }
        ValueType::Int64 => {
            cursor.align4()?;
            let v = cursor.read_u64()? as i64;
            value = Some(Literal::Int { value: v, unsigned: false });
        }
        ValueType::UInt64 => {
            cursor.align4()?;
            let v = cursor.read_u64()?;
            value = Some(Literal::Int {
                value: v as i64,
                unsigned: true,
            });
        }
        ValueType::Float32 => {
            cursor.align4()?;
            value = Some(Literal::Float32(f32::from_bits(cursor.read_u32()?)));
        }
        ValueType::Float64 => {
            cursor.align4()?;
            value = Some(Literal::Float64(f64::from_bits(cursor.read_u64()?)));
        }
        ValueType::Str => {
            let idx = cursor.read_u16()?;
            value = Some(Literal::Str(lookup(idx)?));
        }
        ValueType::Array => {
            // Element count duplicates childCount for arrays; carry no value.
            let _count = cursor.read_u16()?;
        }
        ValueType::Operator => {
            let idx = cursor.read_u16()?;
            name = Some(lookup(idx)?);
        }
    }

    let mut children = SmallVec::new();
    for _ in 0..child_count {
        let offset = cursor.read_u16()?;
        if offset == 0 {
            return Err(DecodeError::BadChildRef { parent: index, offset });
        }
        let child = index + offset as usize;
        if child >= node_count {
            return Err(DecodeError::ChildOutOfRange { parent: index, child });
        }
        children.push(NodeId::new(child));
    }

    Ok(Node {
        kind,
        flags,
        // CompactAST does not carry source lines; consumers needing
        // diagnostics keep the original tree.
        line: 1,
        name,
        value,
        children,
    })
}

struct Cursor<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn new(bytes: &'b [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let end = self.pos + 2;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(u16::from_le_bytes([slice[0], slice[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let end = self.pos + 4;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let end = self.pos + 8;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        Ok(u64::from_le_bytes(buf))
    }

    fn align4(&mut self) -> Result<(), DecodeError> {
        while self.pos % 4 != 0 {
            let b = self.read_u8()?;
            if b != 0 {
                return Err(DecodeError::NonZeroPadding);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    fn round_trip(source: &str) -> (Ast, Ast) {
        let outcome = parse(source);
        assert!(!outcome.has_errors(), "diagnostics: {:?}", outcome.diagnostics);
        let bytes = encode(&outcome.ast).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        (outcome.ast, decoded)
    }

    #[test]
    fn header_layout() {
        let outcome = parse("int x = 1;");
        let bytes = encode(&outcome.ast).unwrap();
        assert_eq!(&bytes[0..4], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..6], &VERSION.to_le_bytes());
        let node_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(node_count as usize, outcome.ast.len());
    }

    #[test]
    fn round_trip_preserves_structure() {
        let (original, decoded) = round_trip("int add(int a, int b) { if (a > b) { return a; } return a + b; }");
        assert!(original.structural_eq(&decoded));
    }

    #[test]
    fn round_trip_literals() {
        let (original, decoded) =
            round_trip("unsigned x = 0xFFu; long long y = 5000000000; float f = 1.5f; double d = 2.5; char c = 'A';");
        assert!(original.structural_eq(&decoded));
    }

    #[test]
    fn bad_magic_rejected() {
        let outcome = parse("int x;");
        let mut bytes = encode(&outcome.ast).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic(_))));
    }

    #[test]
    fn major_version_mismatch_rejected() {
        let outcome = parse("int x;");
        let mut bytes = encode(&outcome.ast).unwrap();
        bytes[5] = 0x02; // version 0x0200
        assert!(matches!(decode(&bytes), Err(DecodeError::BadVersion(_))));
    }

    #[test]
    fn truncated_buffer_rejected() {
        let outcome = parse("int x = 42;");
        let bytes = encode(&outcome.ast).unwrap();
        assert!(matches!(decode(&bytes[..bytes.len() - 2]), Err(DecodeError::Truncated)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let outcome = parse("int x = 42;");
        let mut bytes = encode(&outcome.ast).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(DecodeError::TrailingBytes { .. })));
    }

    #[test]
    fn strings_are_deduplicated() {
        let once = parse("int aLongerName = 1;");
        let twice = parse("int aLongerName = 1; int other = aLongerName;");
        let bytes_once = encode(&once.ast).unwrap();
        let bytes_twice = encode(&twice.ast).unwrap();
        let table_size = |b: &[u8]| u32::from_le_bytes(b[12..16].try_into().unwrap());
        // The second use of the name adds only a short entry for `other`.
        assert!(table_size(&bytes_twice) < table_size(&bytes_once) * 2);
    }
}
