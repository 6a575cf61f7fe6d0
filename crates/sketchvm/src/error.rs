use std::fmt;

/// Closed error taxonomy shared by every phase of the pipeline.
///
/// Compile phases (preprocessor, lexer, parser) accumulate these inside
/// [`Diagnostic`]s; the interpreter carries them inside [`RunError`] and
/// reports them through `ERROR`/`WARNING` command records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Invalid token or unterminated literal.
    LexError,
    /// Grammar violation or unexpected token.
    ParseError,
    /// Malformed directive or unterminated conditional.
    PreprocessorError,
    /// Incompatible assignment, unknown member, unknown function.
    TypeError,
    /// Array access out of bounds or negative index.
    BoundsError,
    /// Pointer read or write through null.
    NullDereference,
    DivisionByZero,
    /// Recursion limit exceeded.
    StackOverflow,
    /// Internal allocation cap exceeded.
    MemoryExhausted,
    /// External read did not resolve before its deadline.
    Timeout,
    /// CompactAST header, version, or structure invalid.
    BadFormat,
    UnknownPlatform,
}

impl ErrorKind {
    /// Fatal errors terminate the run with a `PROGRAM_END` error payload;
    /// everything else is recovered locally with a zero/undefined value.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::StackOverflow | Self::MemoryExhausted | Self::BadFormat)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LexError => "LexError",
            Self::ParseError => "ParseError",
            Self::PreprocessorError => "PreprocessorError",
            Self::TypeError => "TypeError",
            Self::BoundsError => "BoundsError",
            Self::NullDereference => "NullDereference",
            Self::DivisionByZero => "DivisionByZero",
            Self::StackOverflow => "StackOverflow",
            Self::MemoryExhausted => "MemoryExhausted",
            Self::Timeout => "Timeout",
            Self::BadFormat => "BadFormat",
            Self::UnknownPlatform => "UnknownPlatform",
        };
        f.write_str(name)
    }
}

/// Severity of an accumulated diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// One entry in the diagnostic list produced by the compile phases.
///
/// Compile diagnostics never abort a phase: the preprocessor keeps rewriting,
/// and the parser keeps producing a best-effort tree with error-flagged
/// subtrees.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    /// Source line the diagnostic refers to (1-based, after `#line` mapping).
    pub line: u32,
}

impl Diagnostic {
    pub fn error(kind: ErrorKind, message: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            message: message.into(),
            line,
        }
    }

    pub fn warning(kind: ErrorKind, message: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "line {}: {severity}: {}: {}", self.line, self.kind, self.message)
    }
}

impl std::error::Error for Diagnostic {}

/// Internal runtime error carried through evaluation via `Result` and `?`.
///
/// Converted to an `ERROR` command record (and, for fatal kinds, a
/// terminating `PROGRAM_END`) at the interpreter boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn bounds(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BoundsError, message)
    }

    pub fn null_deref(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NullDereference, message)
    }

    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "division by zero")
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RunError {}

/// Result alias used by the evaluator.
pub(crate) type RunResult<T> = Result<T, RunError>;
