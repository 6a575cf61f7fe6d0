//! Public interface for running Arduino sketches.
//!
//! The host drives execution cooperatively: `start()` emits the version and
//! program-start records, `tick()` advances until the program finishes,
//! suspends on an external read, or exhausts its step budget, and
//! `resume_with_value()` feeds host responses back into the suspended call
//! site.

use std::time::{Duration, Instant};

use crate::{
    ast::Ast,
    command::{Command, CommandSink},
    error::{Diagnostic, ErrorKind, Severity},
    parse::parse_with_libraries,
    platform::PlatformProfile,
    preprocess::preprocess,
    resource::ResourceLimits,
    value::Value,
    vm::{Suspend, Vm, VmOutcome},
};

/// Version reported in the `VERSION_INFO` records.
pub const INTERPRETER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PARSER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Constructor configuration. Every option has a host-tunable default.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InterpreterConfig {
    /// Platform profile id (default `ARDUINO_UNO`).
    pub platform: String,
    /// Hard cap on `loop()` iterations (default 3, tuned for tests).
    pub max_loop_iterations: u32,
    /// External-read timeout in milliseconds (default 5000).
    pub response_timeout_ms: u64,
    /// Artificial delay before each tick, in milliseconds (default 0).
    pub step_delay_ms: u64,
    /// Enable detailed diagnostics.
    pub verbose: bool,
    /// Enable AST/execution trace records (`VAR_GET`, `IF_STATEMENT`, ...).
    pub debug: bool,
    pub limits: ResourceLimits,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            platform: "ARDUINO_UNO".to_owned(),
            max_loop_iterations: 3,
            response_timeout_ms: 5000,
            step_delay_ms: 0,
            verbose: false,
            debug: false,
            limits: ResourceLimits::default(),
        }
    }
}

/// A parsed sketch: the preprocessor and parser output, ready to execute or
/// to serialize for parse-once-run-many hosts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Sketch {
    pub ast: Ast,
    /// Active libraries: the profile's initial set plus `#include`s.
    pub libraries: Vec<String>,
    pub pragmas: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Sketch {
    /// Preprocesses and parses `source` for the given platform.
    pub fn parse(source: &str, platform: &str) -> Result<Self, Diagnostic> {
        let profile = PlatformProfile::lookup(platform)?;
        let preprocessed = preprocess(source, profile);
        let outcome = parse_with_libraries(&preprocessed.source, &preprocessed.libraries);
        let mut diagnostics = preprocessed.diagnostics;
        diagnostics.extend(outcome.diagnostics);
        Ok(Self {
            ast: outcome.ast,
            libraries: preprocessed.libraries,
            pragmas: preprocessed.pragmas,
            diagnostics,
        })
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    /// Serializes the parsed sketch to a binary format for caching.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Restores a sketch serialized with [`Sketch::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Constructed but `start()` has not run.
    Idle,
    Running,
    /// Paused between single steps.
    Stepping,
    /// Suspended awaiting a host response to an external read.
    WaitingForResponse,
    /// `stop()` was called; the final `PROGRAM_END` is still owed.
    Stopped,
    Complete,
    Failed,
}

/// What a `tick()` or `step()` call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Running,
    Suspended,
    Complete,
    Failed,
}

/// The one in-flight external read. At most one exists at any time.
#[derive(Debug)]
struct PendingRequest {
    request_id: String,
    deadline: Instant,
    fallback: Value,
    /// Execution state to restore on resume, so a step-paused program stays
    /// paused.
    prev_state: ExecState,
}

/// A sketch interpreter instance.
///
/// Owns its AST, scope stack, pending request, and usage counters; no
/// global mutable state, so multiple instances coexist in one process.
pub struct Interpreter {
    config: InterpreterConfig,
    sketch: Sketch,
    vm: Vm,
    state: ExecState,
    pending: Option<PendingRequest>,
    /// The final `PROGRAM_END` is emitted exactly once.
    ended: bool,
}

impl Interpreter {
    /// Parses `source` and builds an interpreter.
    ///
    /// # Errors
    /// Returns the diagnostic list when the platform is unknown or the
    /// source has lex/preprocessor/parse errors.
    pub fn new(source: &str, config: InterpreterConfig) -> Result<Self, Vec<Diagnostic>> {
        let sketch = Sketch::parse(source, &config.platform).map_err(|d| vec![d])?;
        Self::from_sketch(sketch, config)
    }

    /// Builds an interpreter from an already-parsed (possibly `load()`ed)
    /// sketch.
    pub fn from_sketch(sketch: Sketch, config: InterpreterConfig) -> Result<Self, Vec<Diagnostic>> {
        if sketch.has_errors() {
            return Err(sketch.diagnostics);
        }
        let profile = PlatformProfile::lookup(&config.platform).map_err(|d| vec![d])?;
        let vm = Vm::new(
            sketch.ast.clone(),
            profile,
            &sketch.libraries,
            config.limits.clone(),
            config.max_loop_iterations,
            config.debug,
        );
        Ok(Self {
            config,
            sketch,
            vm,
            state: ExecState::Idle,
            pending: None,
            ended: false,
        })
    }

    #[must_use]
    pub fn state(&self) -> ExecState {
        self.state
    }

    #[must_use]
    pub fn sketch(&self) -> &Sketch {
        &self.sketch
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.sketch.diagnostics
    }

    /// The id of the in-flight external read, if suspended.
    #[must_use]
    pub fn pending_request_id(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.request_id.as_str())
    }

    /// Exit status for host CLI wrappers: true only for a clean
    /// `PROGRAM_END`.
    #[must_use]
    pub fn exited_cleanly(&self) -> bool {
        self.state == ExecState::Complete
    }

    /// Begins execution: emits `VERSION_INFO` records and `PROGRAM_START`,
    /// then queues global initializers, `setup()`, and the loop phases.
    pub fn start(&mut self, sink: &mut dyn CommandSink) {
        if self.state != ExecState::Idle {
            return;
        }
        self.vm.emit_unchecked(
            sink,
            Command::VersionInfo {
                component: "interpreter".to_owned(),
                version: INTERPRETER_VERSION.to_owned(),
            },
        );
        self.vm.emit_unchecked(
            sink,
            Command::VersionInfo {
                component: "parser".to_owned(),
                version: PARSER_VERSION.to_owned(),
            },
        );
        self.vm.emit_unchecked(sink, Command::ProgramStart);
        self.vm.seed_lifecycle();
        self.state = ExecState::Running;
    }

    /// Advances execution until the program completes, suspends, or the
    /// per-tick step budget runs out.
    pub fn tick(&mut self, sink: &mut dyn CommandSink) -> TickOutcome {
        if self.config.step_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.step_delay_ms));
        }
        match self.state {
            ExecState::Idle => {
                self.start(sink);
                self.advance(sink, self.config.limits.max_steps_per_tick)
            }
            ExecState::Running => self.advance(sink, self.config.limits.max_steps_per_tick),
            // A paused program does not run freely; the host steps it.
            ExecState::Stepping => TickOutcome::Running,
            ExecState::WaitingForResponse => {
                if self.deadline_passed() {
                    self.apply_timeout(sink);
                    if self.state == ExecState::Running {
                        return self.advance(sink, self.config.limits.max_steps_per_tick);
                    }
                    return TickOutcome::Running;
                }
                TickOutcome::Suspended
            }
            ExecState::Stopped => {
                self.finish(sink, None);
                TickOutcome::Complete
            }
            ExecState::Complete => TickOutcome::Complete,
            ExecState::Failed => TickOutcome::Failed,
        }
    }

    /// Executes one machine step, then pauses.
    pub fn step(&mut self, sink: &mut dyn CommandSink) -> TickOutcome {
        match self.state {
            ExecState::Idle => {
                self.start(sink);
                self.state = ExecState::Stepping;
                TickOutcome::Running
            }
            ExecState::Running | ExecState::Stepping => {
                self.state = ExecState::Stepping;
                let outcome = self.advance(sink, 1);
                if self.state == ExecState::Running {
                    self.state = ExecState::Stepping;
                }
                outcome
            }
            ExecState::WaitingForResponse => TickOutcome::Suspended,
            ExecState::Stopped => {
                self.finish(sink, None);
                TickOutcome::Complete
            }
            ExecState::Complete => TickOutcome::Complete,
            ExecState::Failed => TickOutcome::Failed,
        }
    }

    /// Supplies the host's value for the awaited external read.
    ///
    /// Returns false (with no side effects) when nothing is pending or the
    /// id does not match the awaited request.
    pub fn resume_with_value(&mut self, request_id: &str, value: Value, _sink: &mut dyn CommandSink) -> bool {
        if self.state != ExecState::WaitingForResponse {
            return false;
        }
        let matches = self.pending.as_ref().is_some_and(|p| p.request_id == request_id);
        if !matches {
            return false;
        }
        let pending = self.pending.take().expect("checked above");
        self.vm.resume_with(value);
        self.state = pending.prev_state;
        true
    }

    /// Fails the awaited external read: reports the error, substitutes the
    /// documented fallback value, and continues.
    pub fn resume_with_error(&mut self, request_id: &str, message: &str, sink: &mut dyn CommandSink) -> bool {
        if self.state != ExecState::WaitingForResponse {
            return false;
        }
        let matches = self.pending.as_ref().is_some_and(|p| p.request_id == request_id);
        if !matches {
            return false;
        }
        let pending = self.pending.take().expect("checked above");
        self.vm.emit_unchecked(
            sink,
            Command::Error {
                kind: ErrorKind::TypeError.to_string(),
                message: format!("external read {request_id} failed: {message}"),
            },
        );
        self.vm.resume_with(pending.fallback);
        self.state = pending.prev_state;
        true
    }

    /// Terminates execution. The next `tick()` emits the final
    /// `PROGRAM_END` and no further commands after that.
    pub fn stop(&mut self) {
        if matches!(self.state, ExecState::Complete | ExecState::Failed) {
            return;
        }
        self.pending = None;
        self.state = ExecState::Stopped;
    }

    fn deadline_passed(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| Instant::now() >= p.deadline)
    }

    /// Timeout path: emit the `WARNING` with the request id, substitute the
    /// fallback, restore the pre-suspension state.
    fn apply_timeout(&mut self, sink: &mut dyn CommandSink) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.vm.emit_unchecked(
            sink,
            Command::Warning {
                kind: ErrorKind::Timeout.to_string(),
                message: format!(
                    "external read did not resolve within {} ms; using fallback",
                    self.config.response_timeout_ms
                ),
                request_id: Some(pending.request_id),
            },
        );
        self.vm.resume_with(pending.fallback);
        self.state = pending.prev_state;
    }

    fn advance(&mut self, sink: &mut dyn CommandSink, budget: usize) -> TickOutcome {
        debug_assert!(self.pending.is_none(), "cannot run with a pending request");
        match self.vm.run(sink, budget) {
            VmOutcome::Done => {
                self.finish(sink, None);
                TickOutcome::Complete
            }
            VmOutcome::Suspended(suspend) => {
                self.begin_request(suspend);
                TickOutcome::Suspended
            }
            VmOutcome::BudgetExhausted => TickOutcome::Running,
            VmOutcome::Fatal(error) => {
                self.finish(sink, Some(error.to_string()));
                TickOutcome::Failed
            }
        }
    }

    fn begin_request(&mut self, suspend: Suspend) {
        // Hard invariant: at most one outstanding request. The machine
        // halts while suspended, so a second request cannot be issued.
        assert!(self.pending.is_none(), "second external read while one is pending");
        let prev_state = self.state;
        self.pending = Some(PendingRequest {
            request_id: suspend.request_id,
            deadline: Instant::now() + Duration::from_millis(self.config.response_timeout_ms),
            fallback: suspend.fallback,
            prev_state,
        });
        self.state = ExecState::WaitingForResponse;
    }

    fn finish(&mut self, sink: &mut dyn CommandSink, error: Option<String>) {
        if !self.ended {
            self.vm.emit_unchecked(sink, Command::ProgramEnd { error: error.clone() });
            self.ended = true;
            if self.config.verbose {
                eprintln!(
                    "sketchvm: run finished with {} commands emitted",
                    self.vm.command_count()
                );
            }
        }
        self.state = if error.is_some() { ExecState::Failed } else { ExecState::Complete };
    }
}
