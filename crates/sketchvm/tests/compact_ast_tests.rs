//! CompactAST interchange tests: header validation, strict decoding, and
//! deep round-trip equality.

use sketchvm::{DecodeError, MAGIC, NodeKind, VERSION, decode, encode, parse};

#[test]
fn round_trip_representative_sketch() {
    // A function with two parameters, an if statement, and a string
    // literal; comfortably more than 20 nodes.
    let source = "int pick(int a, int b) { if (a > b) { Serial.println(\"left\"); return a; } return b; }";
    let outcome = parse(source);
    assert!(!outcome.has_errors());
    assert!(outcome.ast.len() >= 20, "fixture has {} nodes", outcome.ast.len());

    let bytes = encode(&outcome.ast).expect("encode");
    let decoded = decode(&bytes).expect("decode");

    // Deep comparison: kinds, names, values, and shape all survive.
    assert_eq!(outcome.ast.len(), decoded.len());
    assert!(outcome.ast.structural_eq(&decoded));
    for (id, node) in outcome.ast.iter() {
        let twin = decoded.node(id);
        assert_eq!(node.kind, twin.kind);
        assert_eq!(node.name, twin.name);
        assert_eq!(node.value, twin.value);
        assert_eq!(node.children, twin.children);
    }
}

#[test]
fn header_fields() {
    let outcome = parse("void setup() {} void loop() {}");
    let bytes = encode(&outcome.ast).unwrap();

    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), MAGIC);
    assert_eq!(u16::from_le_bytes(bytes[4..6].try_into().unwrap()), VERSION);
    assert_eq!(u16::from_le_bytes(bytes[6..8].try_into().unwrap()), 0, "flags");
    let node_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    assert_eq!(node_count as usize, outcome.ast.len());
    let string_table_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    assert!(16 + string_table_size < bytes.len());
}

#[test]
fn declared_sizes_match_consumed_bytes() {
    let outcome = parse("int x = 1; void setup() { x = x + 1; } void loop() {}");
    let bytes = encode(&outcome.ast).unwrap();
    // Exact consumption is part of the decode contract: any trailing byte
    // fails, any truncation fails.
    assert!(decode(&bytes).is_ok());
    let mut extended = bytes.clone();
    extended.push(0);
    assert!(matches!(decode(&extended), Err(DecodeError::TrailingBytes { .. })));
    assert!(decode(&bytes[..bytes.len() - 1]).is_err());
}

#[test]
fn rejects_bad_magic_before_anything_else() {
    let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    assert!(matches!(decode(&bytes), Err(DecodeError::BadMagic(_))));
}

#[test]
fn rejects_major_version_change_accepts_minor() {
    let outcome = parse("int x;");
    let bytes = encode(&outcome.ast).unwrap();

    let mut major_bump = bytes.clone();
    major_bump[5] = 0x02;
    assert!(matches!(decode(&major_bump), Err(DecodeError::BadVersion(_))));

    // A higher minor version decodes; unknown flag bits are ignored.
    let mut minor_bump = bytes.clone();
    minor_bump[4] = 0x07; // version 0x0107
    minor_bump[6] = 0xFF; // flags
    assert!(decode(&minor_bump).is_ok());
}

#[test]
fn rejects_non_forward_child_references() {
    let outcome = parse("int x = 1;");
    let bytes = encode(&outcome.ast).unwrap();
    // The Program node is the first node-table entry: kind, flags,
    // dataType, childCount, nameIndex, then its first relative child
    // offset. Zeroing that offset makes it non-forward.
    let string_table_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let first_child_offset = 16 + string_table_size + 6;
    let mut corrupted = bytes.clone();
    corrupted[first_child_offset] = 0;
    corrupted[first_child_offset + 1] = 0;
    let result = decode(&corrupted);
    assert!(matches!(result, Err(DecodeError::BadChildRef { .. })), "got {result:?}");
}

#[test]
fn empty_program_round_trips() {
    let outcome = parse("");
    let bytes = encode(&outcome.ast).unwrap();
    let decoded = decode(&bytes).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded.kind(decoded.root()), NodeKind::Program);
}

#[test]
fn integers_widen_on_decode() {
    // Small literals encode in narrow lanes but decode to the same values.
    let outcome = parse("int a = 5; int b = -5; int c = 300; unsigned d = 70000u; long long e = 5000000000;");
    let bytes = encode(&outcome.ast).unwrap();
    let decoded = decode(&bytes).unwrap();
    assert!(outcome.ast.structural_eq(&decoded));
}

#[test]
fn compact_is_much_smaller_than_json() {
    let source = "void setup() { pinMode(13, 1); Serial.begin(9600); } void loop() { digitalWrite(13, 1); delay(1000); digitalWrite(13, 0); delay(1000); Serial.println(\"tick\"); }";
    let outcome = parse(source);
    let compact = encode(&outcome.ast).unwrap();
    let json = serde_json::to_vec(&outcome.ast).unwrap();
    // A measurable property rather than a contract: the binary form should
    // be far smaller than a naive JSON rendering.
    assert!(
        compact.len() * 4 < json.len(),
        "compact {} bytes vs json {} bytes",
        compact.len(),
        json.len()
    );
}
