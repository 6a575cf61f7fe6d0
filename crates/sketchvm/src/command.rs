//! Command records emitted by the interpreter and the sink they flow into.
//!
//! Record shape is contractual: the `type` tag and per-type field names and
//! order are fixed, so two implementations produce byte-comparable streams
//! after timestamp normalization.

use std::io::Write as _;

use serde_json::Value as Json;

/// One hardware/lifecycle command. Serialized with a `type` tag in
/// `SCREAMING_SNAKE_CASE` and camelCase payload fields.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, strum::Display)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    VersionInfo {
        component: String,
        version: String,
    },
    ProgramStart,
    ProgramEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SetupStart,
    SetupEnd,
    LoopStart {
        iteration: u32,
    },
    LoopEnd {
        iteration: u32,
    },
    VarSet {
        name: String,
        value: Json,
    },
    VarGet {
        name: String,
        value: Json,
    },
    FunctionCall {
        name: String,
        args: Vec<Json>,
    },
    IfStatement {
        condition: bool,
    },
    SwitchCase {
        value: Json,
    },
    ForLoop {
        iteration: u32,
    },
    WhileLoop {
        iteration: u32,
    },
    PinMode {
        pin: i64,
        mode: String,
    },
    DigitalWrite {
        pin: i64,
        value: i64,
    },
    DigitalReadRequest {
        pin: i64,
        request_id: String,
    },
    AnalogWrite {
        pin: i64,
        value: i64,
    },
    AnalogReadRequest {
        pin: String,
        request_id: String,
    },
    MillisRequest {
        request_id: String,
    },
    MicrosRequest {
        request_id: String,
    },
    Delay {
        duration: i64,
    },
    DelayMicroseconds {
        duration: i64,
    },
    Tone {
        pin: i64,
        frequency: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<i64>,
    },
    NoTone {
        pin: i64,
    },
    SerialBegin {
        baud_rate: i64,
    },
    SerialPrint {
        text: String,
    },
    SerialPrintln {
        text: String,
    },
    SerialWrite {
        value: i64,
    },
    LibraryMethodCall {
        library: String,
        method: String,
        args: Vec<Json>,
    },
    LibraryMethodInternal {
        library: String,
        method: String,
        args: Vec<Json>,
        result: Json,
    },
    LibraryMethodRequest {
        library: String,
        method: String,
        args: Vec<Json>,
        request_id: String,
    },
    Error {
        kind: String,
        message: String,
    },
    Warning {
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

/// A command tagged with the interpreter's monotonic timestamp
/// (milliseconds since `start()`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommandRecord {
    #[serde(flatten)]
    pub command: Command,
    pub timestamp: u64,
}

/// Consumer of the command stream.
///
/// The sink is injected by the host and called synchronously from the
/// interpreter thread; the core never calls it from a background thread.
pub trait CommandSink {
    /// Called once per emitted command, in strict program order.
    fn emit(&mut self, record: &CommandRecord);
}

/// Sink that collects every record, for tests and programmatic hosts.
#[derive(Debug, Default)]
pub struct CollectCommands {
    records: Vec<CommandRecord>,
}

impl CollectCommands {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }

    #[must_use]
    pub fn into_records(self) -> Vec<CommandRecord> {
        self.records
    }

    /// The commands without timestamps, in emission order.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.records.iter().map(|r| &r.command)
    }

    /// The `type` tags in emission order, for ordering assertions.
    #[must_use]
    pub fn type_tags(&self) -> Vec<String> {
        self.records.iter().map(|r| r.command.to_string()).collect()
    }

    /// First command matching the tag, if any.
    #[must_use]
    pub fn first_of(&self, tag: &str) -> Option<&Command> {
        self.commands().find(|c| c.to_string() == tag)
    }
}

impl CommandSink for CollectCommands {
    fn emit(&mut self, record: &CommandRecord) {
        self.records.push(record.clone());
    }
}

/// Sink that ignores all commands.
#[derive(Debug, Default)]
pub struct NoopSink;

impl CommandSink for NoopSink {
    fn emit(&mut self, _record: &CommandRecord) {}
}

/// Sink that prints each record as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct JsonLinePrint;

impl CommandSink for JsonLinePrint {
    fn emit(&mut self, record: &CommandRecord) {
        if let Ok(line) = serde_json::to_string(record) {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_are_screaming_snake() {
        let record = CommandRecord {
            command: Command::DigitalReadRequest {
                pin: 2,
                request_id: "digitalRead_1_abc".to_owned(),
            },
            timestamp: 0,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "DIGITAL_READ_REQUEST");
        assert_eq!(json["requestId"], "digitalRead_1_abc");
    }

    #[test]
    fn field_order_is_stable() {
        let record = CommandRecord {
            command: Command::PinMode {
                pin: 13,
                mode: "OUTPUT".to_owned(),
            },
            timestamp: 7,
        };
        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text, r#"{"type":"PIN_MODE","pin":13,"mode":"OUTPUT","timestamp":7}"#);
    }

    #[test]
    fn round_trips_through_json() {
        let record = CommandRecord {
            command: Command::SerialBegin { baud_rate: 9600 },
            timestamp: 1,
        };
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains(r#""baudRate":9600"#));
        let back: CommandRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }
}
