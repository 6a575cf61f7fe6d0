//! Platform-aware preprocessor: directive handling, token-level macro
//! expansion, and conditional-compilation evaluation.
//!
//! The output is rewritten source with all directives stripped. The rewritten
//! text has exactly as many lines as the input, so surviving tokens keep
//! their original line numbers for diagnostics.

use ahash::AHashMap;

use crate::{
    error::{Diagnostic, ErrorKind},
    platform::PlatformProfile,
};

/// Result of running the preprocessor over one translation unit.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Preprocessed {
    /// Rewritten source: directives stripped, macros expanded, line count
    /// identical to the input.
    pub source: String,
    /// Libraries activated by the profile plus `#include`s encountered, in
    /// first-seen order.
    pub libraries: Vec<String>,
    /// `#pragma` lines, recorded verbatim for the host.
    pub pragmas: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Runs the preprocessor with the profile's predefined macros and initial
/// library set.
#[must_use]
pub fn preprocess(source: &str, profile: &PlatformProfile) -> Preprocessed {
    let mut pp = Preprocessor::new(profile);
    pp.run(source);
    Preprocessed {
        source: pp.output.join("\n"),
        libraries: pp.libraries,
        pragmas: pp.pragmas,
        diagnostics: pp.diagnostics,
    }
}

/// One macro definition. Object-like macros have `params == None`.
#[derive(Debug, Clone)]
struct MacroDef {
    params: Option<Vec<String>>,
    body: Vec<PpTok>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PpKind {
    Ident,
    Number,
    Str,
    Char,
    Op,
}

/// A preprocessor token. Lexemes are preserved verbatim so expansion output
/// can be re-rendered without losing suffixes or quoting.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PpTok {
    text: String,
    kind: PpKind,
    /// Whether whitespace preceded this token; used to distinguish
    /// `#define F(x)` (function-like) from `#define F (x)` (object-like).
    space_before: bool,
}

impl PpTok {
    fn number(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            kind: PpKind::Number,
            space_before: true,
        }
    }

    fn is_op(&self, symbol: &str) -> bool {
        self.kind == PpKind::Op && self.text == symbol
    }
}

#[derive(Debug)]
struct CondFrame {
    parent_active: bool,
    /// Whether any branch of this conditional has been taken yet.
    taken: bool,
    active: bool,
    seen_else: bool,
    line: u32,
}

struct Preprocessor {
    macros: AHashMap<String, MacroDef>,
    conds: Vec<CondFrame>,
    output: Vec<String>,
    libraries: Vec<String>,
    pragmas: Vec<String>,
    diagnostics: Vec<Diagnostic>,
    /// Offset applied by `#line` when reporting diagnostic lines.
    line_adjust: i64,
}

impl Preprocessor {
    fn new(profile: &PlatformProfile) -> Self {
        let mut macros = AHashMap::new();
        for (name, value) in profile.all_defines() {
            macros.insert(
                name.to_owned(),
                MacroDef {
                    params: None,
                    body: scan_pp_tokens(value),
                },
            );
        }
        Self {
            macros,
            conds: Vec::new(),
            output: Vec::new(),
            libraries: profile.libraries.iter().map(|s| (*s).to_owned()).collect(),
            pragmas: Vec::new(),
            diagnostics: Vec::new(),
            line_adjust: 0,
        }
    }

    fn active(&self) -> bool {
        self.conds.iter().all(|c| c.active)
    }

    fn report_line(&self, physical: u32) -> u32 {
        let adjusted = i64::from(physical) + self.line_adjust;
        u32::try_from(adjusted.max(1)).unwrap_or(1)
    }

    fn error(&mut self, message: impl Into<String>, line: u32) {
        let line = self.report_line(line);
        self.diagnostics
            .push(Diagnostic::error(ErrorKind::PreprocessorError, message, line));
    }

    fn warning(&mut self, message: impl Into<String>, line: u32) {
        let line = self.report_line(line);
        self.diagnostics
            .push(Diagnostic::warning(ErrorKind::PreprocessorError, message, line));
    }

    fn run(&mut self, source: &str) {
        let stripped = strip_comments(source);
        let logical_lines = splice_lines(&stripped);

        for (text, start_line, physical_count) in logical_lines {
            let trimmed = text.trim_start();
            if let Some(directive) = trimmed.strip_prefix('#') {
                self.handle_directive(directive.trim_start(), start_line);
                for _ in 0..physical_count {
                    self.output.push(String::new());
                }
            } else if self.active() {
                let expanded = self.expand_line(&text);
                self.output.push(expanded);
                for _ in 1..physical_count {
                    self.output.push(String::new());
                }
            } else {
                for _ in 0..physical_count {
                    self.output.push(String::new());
                }
            }
        }

        if let Some(frame) = self.conds.last() {
            let line = frame.line;
            self.error("unterminated conditional directive", line);
            self.conds.clear();
        }
    }

    fn expand_line(&mut self, text: &str) -> String {
        let tokens = scan_pp_tokens(text);
        let mut hide = Vec::new();
        let expanded = self.expand_tokens(&tokens, &mut hide);
        render_tokens(&expanded)
    }

    fn handle_directive(&mut self, directive: &str, line: u32) {
        let (name, rest) = split_directive(directive);
        match name {
            // Conditionals run even inside inactive regions so nesting stays
            // balanced.
            "if" => {
                let parent_active = self.active();
                let active = parent_active && self.eval_condition(rest, line);
                self.conds.push(CondFrame {
                    parent_active,
                    taken: active,
                    active,
                    seen_else: false,
                    line,
                });
            }
            "ifdef" | "ifndef" => {
                let parent_active = self.active();
                let target = rest.trim();
                if target.is_empty() && parent_active {
                    self.error(format!("#{name} with no macro name"), line);
                }
                let defined = self.macros.contains_key(target);
                let truth = if name == "ifdef" { defined } else { !defined };
                let active = parent_active && truth;
                self.conds.push(CondFrame {
                    parent_active,
                    taken: active,
                    active,
                    seen_else: false,
                    line,
                });
            }
            "elif" => match self.conds.last() {
                None => self.error("#elif without matching #if", line),
                Some(frame) if frame.seen_else => self.error("#elif after #else", line),
                Some(_) => {
                    let taken = self.conds.last().map(|f| f.taken).unwrap_or(false);
                    let parent_active = self.conds.last().map(|f| f.parent_active).unwrap_or(false);
                    let value = parent_active && !taken && self.eval_condition(rest, line);
                    let frame = self.conds.last_mut().expect("checked above");
                    frame.active = value;
                    frame.taken |= value;
                }
            },
            "else" => match self.conds.last_mut() {
                None => self.error("#else without matching #if", line),
                Some(frame) if frame.seen_else => self.error("duplicate #else", line),
                Some(frame) => {
                    frame.active = frame.parent_active && !frame.taken;
                    frame.taken = true;
                    frame.seen_else = true;
                }
            },
            "endif" => {
                if self.conds.pop().is_none() {
                    self.error("#endif without matching #if", line);
                }
            }
            _ if !self.active() => {}
            "define" => self.handle_define(rest, line),
            "undef" => {
                let target = rest.trim();
                if target.is_empty() {
                    self.error("#undef with no macro name", line);
                } else {
                    self.macros.remove(target);
                }
            }
            "include" => self.handle_include(rest, line),
            "pragma" => self.pragmas.push(rest.trim().to_owned()),
            "line" => self.handle_line(rest, line),
            "error" => self.error(format!("#error {}", rest.trim()), line),
            "warning" => self.warning(format!("#warning {}", rest.trim()), line),
            "" => {} // the null directive `#` is valid and ignored
            other => self.error(format!("unknown directive #{other}"), line),
        }
    }

    fn handle_define(&mut self, rest: &str, line: u32) {
        let tokens = scan_pp_tokens(rest);
        let Some(first) = tokens.first() else {
            self.error("#define with no macro name", line);
            return;
        };
        if first.kind != PpKind::Ident {
            self.error("#define requires an identifier", line);
            return;
        }
        let name = first.text.clone();

        // `(` glued to the name means function-like.
        let function_like = tokens.get(1).is_some_and(|t| t.is_op("(") && !t.space_before);
        if function_like {
            let mut params = Vec::new();
            let mut idx = 2;
            loop {
                match tokens.get(idx) {
                    Some(t) if t.is_op(")") => {
                        idx += 1;
                        break;
                    }
                    Some(t) if t.kind == PpKind::Ident => {
                        params.push(t.text.clone());
                        idx += 1;
                        match tokens.get(idx) {
                            Some(t) if t.is_op(",") => idx += 1,
                            Some(t) if t.is_op(")") => {}
                            _ => {
                                self.error(format!("malformed parameter list for macro `{name}`"), line);
                                return;
                            }
                        }
                    }
                    _ => {
                        self.error(format!("malformed parameter list for macro `{name}`"), line);
                        return;
                    }
                }
            }
            let body = tokens[idx..].to_vec();
            self.macros.insert(
                name,
                MacroDef {
                    params: Some(params),
                    body,
                },
            );
        } else {
            let body = tokens[1..].to_vec();
            self.macros.insert(name, MacroDef { params: None, body });
        }
    }

    fn handle_include(&mut self, rest: &str, line: u32) {
        let rest = rest.trim();
        let name = if let Some(inner) = rest.strip_prefix('"') {
            inner.split('"').next().map(str::to_owned)
        } else if let Some(inner) = rest.strip_prefix('<') {
            inner.split('>').next().map(str::to_owned)
        } else {
            None
        };
        let Some(name) = name else {
            self.error("malformed #include", line);
            return;
        };
        let library = name
            .trim_end_matches(".hpp")
            .trim_end_matches(".h")
            .rsplit('/')
            .next()
            .unwrap_or(&name)
            .to_owned();
        // Arduino.h is the core itself, not a library.
        if library != "Arduino" && !library.is_empty() && !self.libraries.iter().any(|l| *l == library) {
            self.libraries.push(library);
        }
    }

    fn handle_line(&mut self, rest: &str, physical: u32) {
        let target = rest.trim().split_whitespace().next().and_then(|n| n.parse::<i64>().ok());
        match target {
            Some(n) if n >= 1 => {
                // Subsequent physical line `physical + 1` reports as `n`.
                self.line_adjust = n - i64::from(physical) - 1;
            }
            _ => self.error("malformed #line directive", physical),
        }
    }

    fn eval_condition(&mut self, expr: &str, line: u32) -> bool {
        let tokens = scan_pp_tokens(expr);
        if tokens.is_empty() {
            self.error("#if with no expression", line);
            return false;
        }
        let resolved = self.resolve_defined(&tokens);
        let mut hide = Vec::new();
        let expanded = self.expand_tokens(&resolved, &mut hide);
        match CondEval::new(&expanded).eval() {
            Ok(value) => value.value != 0,
            Err(message) => {
                self.error(message, line);
                false
            }
        }
    }

    /// Replaces `defined(X)` and `defined X` with `1`/`0` before macro
    /// expansion, per C semantics.
    fn resolve_defined(&self, tokens: &[PpTok]) -> Vec<PpTok> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            if tok.kind == PpKind::Ident && tok.text == "defined" {
                let (name, consumed) = match (tokens.get(i + 1), tokens.get(i + 2), tokens.get(i + 3)) {
                    (Some(open), Some(id), Some(close))
                        if open.is_op("(") && id.kind == PpKind::Ident && close.is_op(")") =>
                    {
                        (Some(id.text.clone()), 4)
                    }
                    (Some(id), _, _) if id.kind == PpKind::Ident => (Some(id.text.clone()), 2),
                    _ => (None, 1),
                };
                match name {
                    Some(name) => {
                        let value = if self.macros.contains_key(&name) { "1" } else { "0" };
                        out.push(PpTok::number(value));
                        i += consumed;
                    }
                    None => {
                        // Leave malformed `defined` in place; evaluation will
                        // report it as an unexpected identifier.
                        out.push(tok.clone());
                        i += 1;
                    }
                }
            } else {
                out.push(tok.clone());
                i += 1;
            }
        }
        out
    }

    /// Token-level macro expansion with self-recursion suppressed via the
    /// `hide` list.
    fn expand_tokens(&self, tokens: &[PpTok], hide: &mut Vec<String>) -> Vec<PpTok> {
        let mut out: Vec<PpTok> = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            if tok.kind != PpKind::Ident || hide.contains(&tok.text) {
                out.push(tok.clone());
                i += 1;
                continue;
            }
            let Some(def) = self.macros.get(&tok.text) else {
                out.push(tok.clone());
                i += 1;
                continue;
            };
            match &def.params {
                None => {
                    hide.push(tok.text.clone());
                    let expansion = self.expand_tokens(&def.body, hide);
                    hide.pop();
                    out.extend(expansion);
                    i += 1;
                }
                Some(params) => {
                    // A function-like macro name not followed by `(` is left
                    // alone.
                    if !tokens.get(i + 1).is_some_and(|t| t.is_op("(")) {
                        out.push(tok.clone());
                        i += 1;
                        continue;
                    }
                    let Some((args, after)) = collect_macro_args(tokens, i + 1) else {
                        out.push(tok.clone());
                        i += 1;
                        continue;
                    };
                    // Substitute arguments unexpanded, then rescan the result.
                    let mut substituted = Vec::new();
                    for body_tok in &def.body {
                        if body_tok.kind == PpKind::Ident
                            && let Some(pos) = params.iter().position(|p| *p == body_tok.text)
                        {
                            if let Some(arg) = args.get(pos) {
                                substituted.extend(arg.iter().cloned());
                            }
                            continue;
                        }
                        substituted.push(body_tok.clone());
                    }
                    hide.push(tok.text.clone());
                    let expansion = self.expand_tokens(&substituted, hide);
                    hide.pop();
                    out.extend(expansion);
                    i = after;
                }
            }
        }
        out
    }
}

/// Collects the parenthesized argument list starting at `open` (the index of
/// `(`). Returns the argument token lists and the index just past `)`.
fn collect_macro_args(tokens: &[PpTok], open: usize) -> Option<(Vec<Vec<PpTok>>, usize)> {
    debug_assert!(tokens[open].is_op("("));
    let mut args: Vec<Vec<PpTok>> = vec![Vec::new()];
    let mut depth = 1;
    let mut i = open + 1;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.is_op("(") {
            depth += 1;
        } else if tok.is_op(")") {
            depth -= 1;
            if depth == 0 {
                // `F()` is zero arguments, not one empty argument.
                if args.len() == 1 && args[0].is_empty() {
                    args.clear();
                }
                return Some((args, i + 1));
            }
        } else if tok.is_op(",") && depth == 1 {
            args.push(Vec::new());
            i += 1;
            continue;
        }
        args.last_mut().expect("args never empty").push(tok.clone());
        i += 1;
    }
    None
}

fn split_directive(directive: &str) -> (&str, &str) {
    let end = directive
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(directive.len());
    (&directive[..end], &directive[end..])
}

/// Replaces comments with spaces, preserving newlines so line numbers
/// survive.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                out.push(' ');
                i += 2;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        i += 2;
                        break;
                    }
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
            }
            '"' => {
                out.push('"');
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    out.push(c);
                    i += 1;
                    if c == '\\' && i < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                    } else if c == '"' || c == '\n' {
                        break;
                    }
                }
            }
            '\'' => {
                out.push('\'');
                i += 1;
                while i < chars.len() {
                    let c = chars[i];
                    out.push(c);
                    i += 1;
                    if c == '\\' && i < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                    } else if c == '\'' || c == '\n' {
                        break;
                    }
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Splices backslash-newline continuations into logical lines.
///
/// Returns `(text, starting_line, physical_line_count)` triples.
fn splice_lines(source: &str) -> Vec<(String, u32, usize)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start_line = 1u32;
    let mut physical = 0usize;
    let mut line_no = 1u32;
    for line in source.split('\n') {
        if physical == 0 {
            start_line = line_no;
        }
        physical += 1;
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
            line_no += 1;
            continue;
        }
        current.push_str(line);
        out.push((std::mem::take(&mut current), start_line, physical));
        physical = 0;
        line_no += 1;
    }
    if physical > 0 {
        out.push((current, start_line, physical));
    }
    out
}

/// Scans one logical line into preprocessor tokens, preserving lexemes.
fn scan_pp_tokens(text: &str) -> Vec<PpTok> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let mut space_before = true;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            space_before = true;
            i += 1;
            continue;
        }
        let start = i;
        let kind;
        if c.is_ascii_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            kind = PpKind::Ident;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            // pp-number: digits, identifier characters, `.`, and exponent
            // signs.
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                    i += 1;
                } else if (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E' | 'p' | 'P') {
                    i += 1;
                } else {
                    break;
                }
            }
            kind = PpKind::Number;
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            while i < chars.len() {
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    i += 1;
                    break;
                }
                i += 1;
            }
            kind = if quote == '"' { PpKind::Str } else { PpKind::Char };
        } else {
            let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
            let len = crate::lex::operator_match_len(&rest);
            i += len.max(1);
            kind = PpKind::Op;
        }
        let end = i.min(chars.len());
        out.push(PpTok {
            text: chars[start..end].iter().collect(),
            kind,
            space_before,
        });
        space_before = false;
    }
    out
}

/// Renders tokens back to a source line, space-separated. Extra spaces are
/// harmless to the parser.
fn render_tokens(tokens: &[PpTok]) -> String {
    let mut out = String::new();
    for (i, tok) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&tok.text);
    }
    out
}

/// Evaluated `#if` operand: 32-bit arithmetic, unsigned when any operand is
/// unsigned.
#[derive(Debug, Clone, Copy)]
struct CondValue {
    value: i64,
    unsigned: bool,
}

impl CondValue {
    fn signed(value: i64) -> Self {
        Self {
            value: i64::from(value as i32),
            unsigned: false,
        }
    }

    fn unsigned(value: u32) -> Self {
        Self {
            value: i64::from(value),
            unsigned: true,
        }
    }

    fn truthy(self) -> bool {
        self.value != 0
    }

    fn as_u32(self) -> u32 {
        self.value as u32
    }
}

/// Dedicated arithmetic evaluator for `#if`/`#elif` expressions.
///
/// A separate precedence-climbing grammar: it never touches the full C++
/// parser and never delegates to any host-language evaluation.
struct CondEval<'t> {
    tokens: &'t [PpTok],
    pos: usize,
}

impl<'t> CondEval<'t> {
    fn new(tokens: &'t [PpTok]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn eval(mut self) -> Result<CondValue, String> {
        let value = self.ternary(true)?;
        match self.peek() {
            None => Ok(value),
            Some(tok) => Err(format!("unexpected `{}` in #if expression", tok.text)),
        }
    }

    fn peek(&self) -> Option<&PpTok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&PpTok> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_op(&mut self, symbol: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_op(symbol)) {
            self.pos += 1;
            return true;
        }
        false
    }

    /// `live == false` parses without computing, so the unevaluated side of
    /// `&&`/`||`/`?:` cannot raise division errors.
    fn ternary(&mut self, live: bool) -> Result<CondValue, String> {
        let cond = self.binary(0, live)?;
        if !self.eat_op("?") {
            return Ok(cond);
        }
        let then_live = live && cond.truthy();
        let then = self.ternary(then_live)?;
        if !self.eat_op(":") {
            return Err("expected `:` in conditional expression".to_owned());
        }
        let else_live = live && !cond.truthy();
        let other = self.ternary(else_live)?;
        Ok(if cond.truthy() { then } else { other })
    }

    fn binary(&mut self, min_prec: u8, live: bool) -> Result<CondValue, String> {
        let mut lhs = self.unary(live)?;
        loop {
            let Some(op) = self.peek().filter(|t| t.kind == PpKind::Op).map(|t| t.text.clone()) else {
                break;
            };
            let Some(prec) = binary_precedence(&op) else { break };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs_live = match op.as_str() {
                "&&" => live && lhs.truthy(),
                "||" => live && !lhs.truthy(),
                _ => live,
            };
            let rhs = self.binary(prec + 1, rhs_live)?;
            lhs = if live {
                apply_binary(&op, lhs, rhs)?
            } else {
                CondValue::signed(0)
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self, live: bool) -> Result<CondValue, String> {
        if let Some(tok) = self.peek() {
            if tok.kind == PpKind::Op {
                let op = tok.text.clone();
                match op.as_str() {
                    "!" => {
                        self.pos += 1;
                        let v = self.unary(live)?;
                        return Ok(CondValue::signed(i64::from(!v.truthy())));
                    }
                    "-" => {
                        self.pos += 1;
                        let v = self.unary(live)?;
                        return Ok(CondValue {
                            value: i64::from((v.value as i32).wrapping_neg()),
                            unsigned: v.unsigned,
                        });
                    }
                    "+" => {
                        self.pos += 1;
                        return self.unary(live);
                    }
                    "~" => {
                        self.pos += 1;
                        let v = self.unary(live)?;
                        return Ok(CondValue {
                            value: i64::from(!(v.value as i32)),
                            unsigned: v.unsigned,
                        });
                    }
                    "(" => {
                        self.pos += 1;
                        let v = self.ternary(live)?;
                        if !self.eat_op(")") {
                            return Err("unbalanced parentheses in #if expression".to_owned());
                        }
                        return Ok(v);
                    }
                    _ => {}
                }
            }
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<CondValue, String> {
        let Some(tok) = self.bump() else {
            return Err("unexpected end of #if expression".to_owned());
        };
        match tok.kind {
            PpKind::Number => parse_pp_number(&tok.text),
            PpKind::Char => parse_pp_char(&tok.text),
            // Undefined identifiers evaluate to 0; `true`/`false` keep their
            // boolean values.
            PpKind::Ident => match tok.text.as_str() {
                "true" => Ok(CondValue::signed(1)),
                _ => Ok(CondValue::signed(0)),
            },
            _ => Err(format!("unexpected `{}` in #if expression", tok.text)),
        }
    }
}

fn binary_precedence(op: &str) -> Option<u8> {
    let prec = match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" => 6,
        "<" | ">" | "<=" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        _ => return None,
    };
    Some(prec)
}

fn apply_binary(op: &str, lhs: CondValue, rhs: CondValue) -> Result<CondValue, String> {
    let unsigned = lhs.unsigned || rhs.unsigned;
    let wrap = |value: i64| {
        if unsigned {
            CondValue {
                value: i64::from(value as u32),
                unsigned: true,
            }
        } else {
            CondValue {
                value: i64::from(value as i32),
                unsigned: false,
            }
        }
    };
    let boolean = |b: bool| CondValue::signed(i64::from(b));
    let result = match op {
        "||" => boolean(lhs.truthy() || rhs.truthy()),
        "&&" => boolean(lhs.truthy() && rhs.truthy()),
        "|" => wrap(lhs.value | rhs.value),
        "^" => wrap(lhs.value ^ rhs.value),
        "&" => wrap(lhs.value & rhs.value),
        "==" => boolean(lhs.value == rhs.value),
        "!=" => boolean(lhs.value != rhs.value),
        "<" => boolean(compare(lhs, rhs, unsigned) == std::cmp::Ordering::Less),
        ">" => boolean(compare(lhs, rhs, unsigned) == std::cmp::Ordering::Greater),
        "<=" => boolean(compare(lhs, rhs, unsigned) != std::cmp::Ordering::Greater),
        ">=" => boolean(compare(lhs, rhs, unsigned) != std::cmp::Ordering::Less),
        "<<" => {
            let shift = (rhs.value as u32) & 31;
            if unsigned {
                wrap(i64::from((lhs.as_u32()).wrapping_shl(shift)))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_shl(shift)))
            }
        }
        ">>" => {
            let shift = (rhs.value as u32) & 31;
            if unsigned {
                wrap(i64::from((lhs.as_u32()).wrapping_shr(shift)))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_shr(shift)))
            }
        }
        "+" => {
            if unsigned {
                wrap(i64::from(lhs.as_u32().wrapping_add(rhs.as_u32())))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_add(rhs.value as i32)))
            }
        }
        "-" => {
            if unsigned {
                wrap(i64::from(lhs.as_u32().wrapping_sub(rhs.as_u32())))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_sub(rhs.value as i32)))
            }
        }
        "*" => {
            if unsigned {
                wrap(i64::from(lhs.as_u32().wrapping_mul(rhs.as_u32())))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_mul(rhs.value as i32)))
            }
        }
        "/" => {
            if rhs.value == 0 {
                return Err("division by zero in #if expression".to_owned());
            }
            if unsigned {
                wrap(i64::from(lhs.as_u32() / rhs.as_u32()))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_div(rhs.value as i32)))
            }
        }
        "%" => {
            if rhs.value == 0 {
                return Err("remainder by zero in #if expression".to_owned());
            }
            if unsigned {
                wrap(i64::from(lhs.as_u32() % rhs.as_u32()))
            } else {
                wrap(i64::from((lhs.value as i32).wrapping_rem(rhs.value as i32)))
            }
        }
        other => return Err(format!("unsupported operator `{other}` in #if expression")),
    };
    Ok(result)
}

fn compare(lhs: CondValue, rhs: CondValue, unsigned: bool) -> std::cmp::Ordering {
    if unsigned {
        lhs.as_u32().cmp(&rhs.as_u32())
    } else {
        (lhs.value as i32).cmp(&(rhs.value as i32))
    }
}

/// Parses a pp-number by reusing the crate lexer, then normalizing to the
/// conditional evaluator's 32-bit model.
fn parse_pp_number(text: &str) -> Result<CondValue, String> {
    let (tokens, diagnostics) = crate::lex::lex(text);
    if !diagnostics.is_empty() {
        return Err(format!("invalid number `{text}` in #if expression"));
    }
    match tokens.first().map(|t| &t.tok) {
        Some(crate::lex::Tok::Int { value, suffix }) => {
            if suffix.unsigned {
                Ok(CondValue::unsigned(*value as u32))
            } else {
                Ok(CondValue::signed(*value as i64))
            }
        }
        Some(crate::lex::Tok::Float { .. }) => Err("floating constant in #if expression".to_owned()),
        _ => Err(format!("invalid number `{text}` in #if expression")),
    }
}

fn parse_pp_char(text: &str) -> Result<CondValue, String> {
    let (tokens, diagnostics) = crate::lex::lex(text);
    if !diagnostics.is_empty() {
        return Err(format!("invalid character constant `{text}` in #if expression"));
    }
    match tokens.first().map(|t| &t.tok) {
        Some(crate::lex::Tok::Char { value, .. }) => Ok(CondValue::signed(i64::from(u32::from(*value)))),
        _ => Err(format!("invalid character constant `{text}` in #if expression")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformProfile;

    fn uno() -> &'static PlatformProfile {
        PlatformProfile::lookup("ARDUINO_UNO").unwrap()
    }

    fn esp32() -> &'static PlatformProfile {
        PlatformProfile::lookup("ESP32_NANO").unwrap()
    }

    fn eval(expr: &str, profile: &PlatformProfile) -> bool {
        let source = format!("#if {expr}\nint yes;\n#endif\n");
        let result = preprocess(&source, profile);
        assert!(
            result.diagnostics.is_empty(),
            "diagnostics for `{expr}`: {:?}",
            result.diagnostics
        );
        result.source.contains("yes")
    }

    #[test]
    fn simple_arithmetic() {
        assert!(eval("1 + 2 == 3", uno()));
        assert!(eval("10 / 3 == 3", uno()));
        assert!(eval("10 % 3 == 1", uno()));
        assert!(eval("2 * 3 - 1 == 5", uno()));
        assert!(!eval("0", uno()));
    }

    #[test]
    fn wraparound_is_32_bit_signed() {
        assert!(eval("2147483647 + 1 < 0", uno()));
        assert!(eval("-2147483648 - 1 > 0", uno()));
    }

    #[test]
    fn unsigned_promotion() {
        // 0xFFFFFFFFu compares as a large unsigned value.
        assert!(eval("0xFFFFFFFFu > 0", uno()));
        // -1 promoted to unsigned is the maximum value.
        assert!(eval("-1 > 0u", uno()));
    }

    #[test]
    fn shifts_and_bitwise() {
        assert!(eval("(1 << 4) == 16", uno()));
        assert!(eval("(0xF0 >> 4) == 0xF", uno()));
        assert!(eval("(0xF0 | 0x0F) == 0xFF", uno()));
        assert!(eval("(0xFF & 0x0F) == 0x0F", uno()));
        assert!(eval("(0xFF ^ 0x0F) == 0xF0", uno()));
        assert!(eval("(~0) == -1", uno()));
    }

    #[test]
    fn ternary_and_logic() {
        assert!(eval("1 ? 2 : 0", uno()));
        assert!(!eval("0 ? 2 : 0", uno()));
        assert!(eval("1 && 2", uno()));
        assert!(!eval("1 && 0", uno()));
        assert!(eval("0 || 3", uno()));
    }

    #[test]
    fn short_circuit_protects_division() {
        // The RHS of `&&` is never evaluated, so `1/0` cannot error.
        assert!(!eval("defined(NOT_DEFINED_ANYWHERE) && (1 / NOT_DEFINED_ANYWHERE)", uno()));
        assert!(eval("1 || (1 / 0)", uno()));
    }

    #[test]
    fn defined_both_spellings() {
        assert!(eval("defined(ARDUINO)", uno()));
        assert!(eval("defined ARDUINO", uno()));
        assert!(!eval("defined(ARDUINO_ARCH_ESP32)", uno()));
        assert!(eval("defined(ARDUINO_ARCH_ESP32)", esp32()));
    }

    #[test]
    fn undefined_identifier_is_zero() {
        assert!(eval("SOME_RANDOM_NAME == 0", uno()));
    }

    #[test]
    fn platform_branch_exclusion() {
        let source = "#if defined(ARDUINO_ARCH_AVR)\nint avr_only;\n#else\nint esp_only;\n#endif\n";
        let on_uno = preprocess(source, uno());
        assert!(on_uno.source.contains("avr_only"));
        assert!(!on_uno.source.contains("esp_only"));
        let on_esp = preprocess(source, esp32());
        assert!(!on_esp.source.contains("avr_only"));
        assert!(on_esp.source.contains("esp_only"));
    }

    #[test]
    fn object_macro_expansion() {
        let result = preprocess("#define WIDTH 320\nint w = WIDTH;\n", uno());
        assert!(result.source.contains("int w = 320"));
    }

    #[test]
    fn function_macro_expansion_rescans() {
        let source = "#define DOUBLE(x) ((x) * 2)\n#define FOUR DOUBLE(2)\nint v = FOUR;\n";
        let result = preprocess(source, uno());
        assert!(result.source.contains("( ( 2 ) * 2 )"), "got: {}", result.source);
    }

    #[test]
    fn self_recursion_is_suppressed() {
        let result = preprocess("#define LOOP LOOP + 1\nint v = LOOP;\n", uno());
        assert!(result.source.contains("LOOP + 1"));
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn include_activates_library() {
        let result = preprocess("#include <Servo.h>\n#include \"Adafruit_NeoPixel.h\"\n", uno());
        assert!(result.libraries.iter().any(|l| l == "Servo"));
        assert!(result.libraries.iter().any(|l| l == "Adafruit_NeoPixel"));
        // Profile libraries stay first.
        assert_eq!(result.libraries[0], "Serial");
    }

    #[test]
    fn include_arduino_h_is_not_a_library() {
        let result = preprocess("#include <Arduino.h>\n", uno());
        assert!(!result.libraries.iter().any(|l| l == "Arduino"));
    }

    #[test]
    fn line_count_is_preserved() {
        let source = "#define A 1\nint x = A;\n#if 0\nint gone;\n#endif\nint y;\n";
        let result = preprocess(source, uno());
        assert_eq!(result.source.matches('\n').count(), source.matches('\n').count());
    }

    #[test]
    fn unterminated_conditional_reports() {
        let result = preprocess("#if 1\nint x;\n", uno());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.kind == ErrorKind::PreprocessorError)
        );
    }

    #[test]
    fn error_and_warning_directives() {
        let result = preprocess("#error unsupported board\n#warning legacy api\n", uno());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == crate::error::Severity::Error && d.message.contains("unsupported board"))
        );
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.severity == crate::error::Severity::Warning && d.message.contains("legacy api"))
        );
    }

    #[test]
    fn pragma_recorded() {
        let result = preprocess("#pragma once\n", uno());
        assert_eq!(result.pragmas, vec!["once".to_owned()]);
    }

    #[test]
    fn undef_removes_macro() {
        let result = preprocess("#define X 1\n#undef X\n#ifdef X\nint gone;\n#endif\n", uno());
        assert!(!result.source.contains("gone"));
    }

    #[test]
    fn elif_chains() {
        let source = "#if 0\nint a;\n#elif 1\nint b;\n#elif 1\nint c;\n#else\nint d;\n#endif\n";
        let result = preprocess(source, uno());
        assert!(result.source.contains("int b"));
        assert!(!result.source.contains("int a"));
        assert!(!result.source.contains("int c"));
        assert!(!result.source.contains("int d"));
    }

    #[test]
    fn nested_conditionals() {
        let source = "#if 1\n#if 0\nint a;\n#endif\nint b;\n#endif\n";
        let result = preprocess(source, uno());
        assert!(!result.source.contains("int a"));
        assert!(result.source.contains("int b"));
    }

    #[test]
    fn line_directive_adjusts_diagnostics() {
        let source = "#line 100\n#error here\n";
        let result = preprocess(source, uno());
        let diag = result.diagnostics.first().expect("diagnostic expected");
        assert_eq!(diag.line, 100);
    }
}
