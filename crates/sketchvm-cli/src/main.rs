use std::{env, fs, process::ExitCode, time::Instant};

use sketchvm::{CollectCommands, Interpreter, InterpreterConfig, JsonLinePrint, TickOutcome, Value};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let mut file_path: Option<&str> = None;
    let mut config = InterpreterConfig::default();
    let mut respond_zero = false;
    let mut quiet = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--platform" => {
                i += 1;
                if let Some(platform) = args.get(i) {
                    config.platform = platform.clone();
                }
            }
            "--loops" => {
                i += 1;
                config.max_loop_iterations = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(3);
            }
            "--timeout-ms" => {
                i += 1;
                config.response_timeout_ms = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(5000);
            }
            "--debug" => config.debug = true,
            "--verbose" => config.verbose = true,
            // Answer every external read with the type-appropriate zero
            // instead of waiting for a host.
            "--respond-zero" => respond_zero = true,
            "--quiet" => quiet = true,
            "--help" | "-h" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            path => file_path = Some(path),
        }
        i += 1;
    }

    let Some(file_path) = file_path else {
        print_usage();
        return ExitCode::FAILURE;
    };
    let source = match fs::read_to_string(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {file_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut interp = match Interpreter::new(&source, config) {
        Ok(interp) => interp,
        Err(diagnostics) => {
            eprintln!("parse failed:");
            for diagnostic in &diagnostics {
                eprintln!("  {diagnostic}");
            }
            return ExitCode::FAILURE;
        }
    };
    for diagnostic in interp.diagnostics() {
        eprintln!("{diagnostic}");
    }

    let start = Instant::now();
    let result = if quiet {
        drive(&mut interp, &mut CollectCommands::new(), respond_zero)
    } else {
        drive(&mut interp, &mut JsonLinePrint, respond_zero)
    };
    eprintln!("finished in {:?}", start.elapsed());

    match result {
        TickOutcome::Complete if interp.exited_cleanly() => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn drive(
    interp: &mut Interpreter,
    sink: &mut impl sketchvm::CommandSink,
    respond_zero: bool,
) -> TickOutcome {
    loop {
        match interp.tick(sink) {
            TickOutcome::Running => {}
            TickOutcome::Suspended => {
                if respond_zero {
                    let id = interp
                        .pending_request_id()
                        .expect("suspended interpreter has a pending request")
                        .to_owned();
                    interp.resume_with_value(&id, Value::int(0), sink);
                } else {
                    // Without a responder, wait for the timeout fallback.
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
            }
            outcome @ (TickOutcome::Complete | TickOutcome::Failed) => return outcome,
        }
    }
}

fn print_usage() {
    eprintln!(
        "usage: sketchvm <sketch.ino> [--platform ARDUINO_UNO|ESP32_NANO] [--loops N] \
         [--timeout-ms N] [--respond-zero] [--debug] [--verbose] [--quiet]"
    );
}
