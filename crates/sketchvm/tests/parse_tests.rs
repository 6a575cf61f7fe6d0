//! Parser coverage: declaration forms, disambiguation rules, recovery, and
//! the canonical-printer reparse invariant.

use pretty_assertions::assert_eq;
use sketchvm::{NodeKind, parse, parse_with_libraries};

/// Parsing the canonical rendering of a tree must reproduce the tree.
fn assert_reparse_idempotent(source: &str) {
    let first = parse(source);
    assert!(!first.has_errors(), "initial parse of {source:?}: {:?}", first.diagnostics);
    let rendered = first.ast.render();
    let second = parse(&rendered);
    assert!(
        !second.has_errors(),
        "reparse of rendered source failed: {:?}\nrendered:\n{rendered}",
        second.diagnostics
    );
    assert!(
        first.ast.structural_eq(&second.ast),
        "structural mismatch after reparse.\nrendered:\n{rendered}\nfirst: {:#?}\nsecond: {:#?}",
        first.ast,
        second.ast
    );
    // Idempotence: rendering the reparsed tree gives identical text.
    assert_eq!(rendered, second.ast.render());
}

#[test]
fn reparse_blink() {
    assert_reparse_idempotent(
        "void setup() { pinMode(13, 1); } void loop() { digitalWrite(13, 1); delay(1000); digitalWrite(13, 0); delay(1000); }",
    );
}

#[test]
fn reparse_declarations() {
    assert_reparse_idempotent(
        "typedef unsigned long ulong;\n\
         const int threshold = 100;\n\
         static float history[4] = {1.5f, 2.5f, 0.0f, 0.0f};\n\
         char greeting[6] = \"hello\";\n\
         int table[2][2] = {{1, 2}, {3, 4}};\n\
         ulong counter = 0;",
    );
}

#[test]
fn reparse_struct_enum() {
    assert_reparse_idempotent(
        "struct Reading { int pin; float volts; };\n\
         enum Mode { IDLE, ACTIVE = 5, DONE };\n\
         Reading latest = {.pin = 3, .volts = 1.5f};\n\
         int f(Reading r) { return r.pin; }",
    );
}

#[test]
fn reparse_control_flow() {
    assert_reparse_idempotent(
        "int classify(int v) {\n\
           switch (v) { case 0: return 0; case 1: break; default: return 2; }\n\
           while (v > 10) { v = v - 1; }\n\
           do { v = v + 1; } while (v < 0);\n\
           for (int i = 0; i < 3; i++) { v = v + i; }\n\
           for (char c : \"abc\") { v = v + c; }\n\
           if (v > 0) return v; else return 0 - v;\n\
         }",
    );
}

#[test]
fn reparse_expressions() {
    assert_reparse_idempotent(
        "int f(int a, int b) {\n\
           int c = a > b ? a - b : b - a;\n\
           c += (a << 2) | (b & 0xF);\n\
           c = c % 7 == 0 && a != b ? ~c : c ^ b;\n\
           bool d = !(a >= b) || c <= 0;\n\
           c = (int)(1.5 * a);\n\
           c = a, b, c;\n\
           return c;\n\
         }",
    );
}

#[test]
fn reparse_pointers_and_references() {
    assert_reparse_idempotent(
        "int deref(int* p) { return *p; }\n\
         void bump(int &x) { x++; }\n\
         int pick(int* base, int i) { return base[i]; }",
    );
}

#[test]
fn reparse_function_pointer() {
    assert_reparse_idempotent("int apply(int x) { return x; } int (*handler)(int x) = apply;");
}

#[test]
fn reparse_sizeof_and_casts() {
    assert_reparse_idempotent(
        "unsigned total = sizeof(long) + sizeof(1 + 2);\n\
         int f(float v) { return static_cast<int>(v) + int(v); }",
    );
}

// =============================================================================
// Disambiguation
// =============================================================================

#[test]
fn paren_identifier_is_not_a_cast() {
    let outcome = parse("int f(int x) { return (x) * 2; }");
    assert!(!outcome.has_errors());
    assert!(outcome.ast.iter().all(|(_, n)| n.kind != NodeKind::CastExpr));
}

#[test]
fn known_type_name_in_parens_is_a_cast() {
    let outcome = parse("typedef int fixed; int f(int x) { return (fixed)x; }");
    assert!(!outcome.has_errors());
    assert!(outcome.ast.iter().any(|(_, n)| n.kind == NodeKind::CastExpr));
}

#[test]
fn library_class_declarations_parse() {
    let libraries = vec!["Servo".to_owned(), "LiquidCrystal".to_owned()];
    let outcome = parse_with_libraries(
        "Servo myservo;\nLiquidCrystal lcd(12, 11, 5, 4, 3, 2);\nvoid setup() { myservo.attach(9); }",
        &libraries,
    );
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    assert!(outcome.ast.iter().any(|(_, n)| n.kind == NodeKind::CtorInit));
}

#[test]
fn empty_parens_declare_a_function() {
    let outcome = parse("int f();");
    assert!(!outcome.has_errors());
    let first = outcome.ast.children(outcome.ast.root())[0];
    assert_eq!(outcome.ast.kind(first), NodeKind::FuncDecl);
}

#[test]
fn local_typedef_shadows_in_scope() {
    let source = "void f() { typedef int local_t; local_t x = 1; } int local_t = 5;";
    let outcome = parse(source);
    assert!(!outcome.has_errors(), "{:?}", outcome.diagnostics);
    // After the function, `local_t` is an ordinary identifier again.
    assert!(
        outcome
            .ast
            .iter()
            .any(|(_, n)| n.kind == NodeKind::VarDecl && n.name.as_deref() == Some("local_t"))
    );
}

// =============================================================================
// Error recovery
// =============================================================================

#[test]
fn recovery_produces_complete_program() {
    let source = "int ok1 = 1;\nint bad = * / ;\nint ok2 = 2;\nvoid setup() { int x = ; digitalWrite(13, 1); }\nvoid loop() {}";
    let outcome = parse(source);
    assert!(outcome.has_errors());
    // The error regions become flagged subtrees...
    assert!(outcome.ast.iter().any(|(_, n)| n.kind == NodeKind::ErrorStmt));
    // ...while surrounding declarations survive.
    let names: Vec<&str> = outcome
        .ast
        .iter()
        .filter(|(_, n)| n.kind == NodeKind::VarDecl || n.kind == NodeKind::FuncDef)
        .filter_map(|(_, n)| n.name.as_deref())
        .collect();
    assert!(names.contains(&"ok1"));
    assert!(names.contains(&"ok2"));
    assert!(names.contains(&"setup"));
    assert!(names.contains(&"loop"));
}

#[test]
fn diagnostics_carry_source_lines() {
    let source = "int good = 1;\nint bad = ;\n";
    let outcome = parse(source);
    let diagnostic = outcome.diagnostics.first().expect("one diagnostic");
    assert_eq!(diagnostic.line, 2);
}

#[test]
fn every_node_has_a_plausible_line() {
    let outcome = parse("int a = 1;\n\nvoid setup() {\n  int b = 2;\n}\n");
    assert!(!outcome.has_errors());
    for (_, node) in outcome.ast.iter() {
        assert!(node.line >= 1);
    }
    let b_decl = outcome
        .ast
        .iter()
        .find(|(_, n)| n.name.as_deref() == Some("b"))
        .expect("b declared");
    assert_eq!(b_decl.1.line, 4);
}
