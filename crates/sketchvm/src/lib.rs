#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is deliberate and checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts mirror C conversion rules")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors two's-complement C semantics")]
#![expect(clippy::must_use_candidate, reason = "builder-style accessors are pervasive")]

mod ast;
mod builtins;
mod command;
mod compact;
mod error;
mod lex;
mod library;
mod parse;
mod platform;
mod preprocess;
mod resource;
mod run;
mod scope;
mod value;
mod vm;

pub use crate::{
    ast::{Ast, Literal, Node, NodeId, NodeKind, flags},
    command::{CollectCommands, Command, CommandRecord, CommandSink, JsonLinePrint, NoopSink},
    compact::{DecodeError, EncodeError, MAGIC, VERSION, ValueType, decode, encode},
    error::{Diagnostic, ErrorKind, RunError, Severity},
    lex::{IntSuffix, Keyword, Tok, Token, lex},
    library::{LibraryDef, LibraryObject, MethodKind, library},
    parse::{MAX_NESTING_DEPTH, ParseOutcome, parse, parse_with_libraries},
    platform::PlatformProfile,
    preprocess::{Preprocessed, preprocess},
    resource::{
        DEFAULT_MAX_COMMANDS, DEFAULT_MAX_RECURSION_DEPTH, DEFAULT_MAX_STEPS_PER_TICK, DEFAULT_MAX_VALUE_BYTES,
        ResourceError, ResourceLimits, ResourceUsage,
    },
    run::{ExecState, INTERPRETER_VERSION, Interpreter, InterpreterConfig, PARSER_VERSION, Sketch, TickOutcome},
    value::{ArrayValue, BaseType, IntType, IntWidth, LibraryHandle, PointerTarget, PointerValue, StructValue, TypeDesc, Value},
};
