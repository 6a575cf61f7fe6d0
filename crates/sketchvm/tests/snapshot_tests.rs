//! Parse-once-run-many: `Sketch::dump`/`load` round-trips and produces the
//! same command stream as a fresh parse.

use sketchvm::{CollectCommands, Command, Interpreter, InterpreterConfig, Sketch, TickOutcome};

const SOURCE: &str = "int threshold = 200;\nvoid setup() { pinMode(13, OUTPUT); }\nvoid loop() { digitalWrite(13, HIGH); delay(50); }";

fn run_to_completion(mut interp: Interpreter) -> Vec<Command> {
    let mut sink = CollectCommands::new();
    loop {
        match interp.tick(&mut sink) {
            TickOutcome::Complete | TickOutcome::Failed => break,
            TickOutcome::Suspended => panic!("fixture has no external reads"),
            TickOutcome::Running => {}
        }
    }
    sink.commands().cloned().collect()
}

#[test]
fn dump_load_round_trip() {
    let sketch = Sketch::parse(SOURCE, "ARDUINO_UNO").unwrap();
    let bytes = sketch.dump().expect("serialize");
    let restored = Sketch::load(&bytes).expect("deserialize");
    assert_eq!(sketch.libraries, restored.libraries);
    assert_eq!(sketch.ast, restored.ast);
}

#[test]
fn loaded_sketch_runs_identically() {
    let config = InterpreterConfig {
        max_loop_iterations: 2,
        ..InterpreterConfig::default()
    };

    let fresh = Interpreter::new(SOURCE, config.clone()).unwrap();
    let fresh_stream = run_to_completion(fresh);

    let sketch = Sketch::parse(SOURCE, "ARDUINO_UNO").unwrap();
    let bytes = sketch.dump().unwrap();
    let restored = Sketch::load(&bytes).unwrap();
    let reloaded = Interpreter::from_sketch(restored, config).unwrap();
    let reloaded_stream = run_to_completion(reloaded);

    // Commands (timestamps excluded) are byte-comparable across the fresh
    // and reloaded runs.
    assert_eq!(fresh_stream, reloaded_stream);
}

#[test]
fn parse_errors_surface_through_interpreter_new() {
    let result = Interpreter::new("int x = ;", InterpreterConfig::default());
    let diagnostics = result.err().expect("parse errors must be returned");
    assert!(!diagnostics.is_empty());
}

#[test]
fn unknown_platform_is_rejected() {
    let config = InterpreterConfig {
        platform: "TEENSY_41".to_owned(),
        ..InterpreterConfig::default()
    };
    let result = Interpreter::new("void setup(){} void loop(){}", config);
    let diagnostics = result.err().expect("unknown platform must fail");
    assert_eq!(diagnostics[0].kind, sketchvm::ErrorKind::UnknownPlatform);
}
