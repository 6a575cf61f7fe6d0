//! Library registry: the closed table of known Arduino libraries, their
//! constructors, and the internal/external classification of every method.
//!
//! The core does not implement library semantics beyond routing: internal
//! methods compute a value here, external methods become
//! `LIBRARY_METHOD_CALL` records, and external-request methods become
//! `LIBRARY_METHOD_REQUEST` records that suspend execution until the host
//! answers.

use ahash::AHashMap;

use crate::{
    error::{RunError, RunResult},
    value::Value,
};

/// How a method call is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MethodKind {
    /// Pure computation; returns a value and emits no command.
    Internal,
    /// Emits `LIBRARY_METHOD_CALL`; returns void immediately.
    External,
    /// Emits `LIBRARY_METHOD_REQUEST` and suspends until the host responds.
    ExternalRequest,
}

/// Static description of one known library.
#[derive(Debug)]
pub struct LibraryDef {
    pub name: &'static str,
    /// Instance methods and their routing.
    pub methods: &'static [(&'static str, MethodKind)],
    /// Static (`Class::method`) pure functions.
    pub static_methods: &'static [&'static str],
    /// Accepted constructor argument counts.
    pub ctor_args: std::ops::RangeInclusive<usize>,
    /// Singletons (Serial, Wire, ...) are predeclared as global objects;
    /// classes (Servo, ...) are instantiated by user declarations.
    pub singleton: bool,
}

impl LibraryDef {
    #[must_use]
    pub fn method_kind(&self, method: &str) -> Option<MethodKind> {
        self.methods.iter().find(|(name, _)| *name == method).map(|(_, kind)| *kind)
    }

    #[must_use]
    pub fn has_static_method(&self, method: &str) -> bool {
        self.static_methods.contains(&method)
    }
}

use MethodKind::{External, ExternalRequest, Internal};

static NEOPIXEL: LibraryDef = LibraryDef {
    name: "Adafruit_NeoPixel",
    methods: &[
        ("begin", External),
        ("show", External),
        ("clear", External),
        ("setPixelColor", External),
        ("setBrightness", External),
        ("fill", External),
        ("numPixels", ExternalRequest),
        ("getBrightness", ExternalRequest),
        ("getPixelColor", ExternalRequest),
    ],
    static_methods: &["Color"],
    ctor_args: 0..=3,
    singleton: false,
};

static SERVO: LibraryDef = LibraryDef {
    name: "Servo",
    methods: &[
        ("attach", External),
        ("detach", External),
        ("write", External),
        ("writeMicroseconds", External),
        ("read", ExternalRequest),
        ("attached", ExternalRequest),
    ],
    static_methods: &[],
    ctor_args: 0..=0,
    singleton: false,
};

static LIQUID_CRYSTAL: LibraryDef = LibraryDef {
    name: "LiquidCrystal",
    methods: &[
        ("begin", External),
        ("clear", External),
        ("home", External),
        ("setCursor", External),
        ("print", External),
        ("write", External),
        ("display", External),
        ("noDisplay", External),
        ("cursor", External),
        ("noCursor", External),
        ("blink", External),
        ("noBlink", External),
        ("scrollDisplayLeft", External),
        ("scrollDisplayRight", External),
        ("createChar", External),
    ],
    static_methods: &[],
    ctor_args: 4..=8,
    singleton: false,
};

static WIRE: LibraryDef = LibraryDef {
    name: "Wire",
    methods: &[
        ("begin", External),
        ("beginTransmission", External),
        ("write", External),
        ("endTransmission", External),
        ("requestFrom", ExternalRequest),
        ("available", ExternalRequest),
        ("read", ExternalRequest),
    ],
    static_methods: &[],
    ctor_args: 0..=0,
    singleton: true,
};

static SPI: LibraryDef = LibraryDef {
    name: "SPI",
    methods: &[
        ("begin", External),
        ("end", External),
        ("beginTransaction", External),
        ("endTransaction", External),
        ("setBitOrder", External),
        ("setDataMode", External),
        ("setClockDivider", External),
        ("transfer", ExternalRequest),
    ],
    static_methods: &[],
    ctor_args: 0..=0,
    singleton: true,
};

static EEPROM: LibraryDef = LibraryDef {
    name: "EEPROM",
    methods: &[
        ("write", External),
        ("update", External),
        ("read", ExternalRequest),
        ("get", ExternalRequest),
        ("put", External),
        ("length", Internal),
    ],
    static_methods: &[],
    ctor_args: 0..=0,
    singleton: true,
};

/// `Serial` methods: the write family maps onto dedicated `SERIAL_*`
/// commands in the interpreter, the read family suspends like any other
/// external request. `flush` routes as a plain external call.
static SERIAL: LibraryDef = LibraryDef {
    name: "Serial",
    methods: &[
        ("begin", External),
        ("print", External),
        ("println", External),
        ("write", External),
        ("flush", External),
        ("end", External),
        ("available", ExternalRequest),
        ("availableForWrite", ExternalRequest),
        ("read", ExternalRequest),
        ("peek", ExternalRequest),
        ("parseInt", ExternalRequest),
        ("parseFloat", ExternalRequest),
        ("readString", ExternalRequest),
    ],
    static_methods: &[],
    ctor_args: 0..=0,
    singleton: true,
};

static LIBRARIES: &[&LibraryDef] = &[&NEOPIXEL, &SERVO, &LIQUID_CRYSTAL, &WIRE, &SPI, &EEPROM, &SERIAL];

/// Looks up a library definition. The hardware serial ports `Serial1` ..
/// `Serial3` share the `Serial` definition.
#[must_use]
pub fn library(name: &str) -> Option<&'static LibraryDef> {
    if matches!(name, "Serial1" | "Serial2" | "Serial3") {
        return Some(&SERIAL);
    }
    LIBRARIES.iter().find(|def| def.name == name).copied()
}

/// One live library object: its class, the constructor arguments the sketch
/// supplied, and opaque per-instance state for internal methods.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LibraryObject {
    pub library: String,
    pub ctor_args: Vec<Value>,
    pub props: AHashMap<String, Value>,
}

impl LibraryObject {
    #[must_use]
    pub fn new(library: &str, ctor_args: Vec<Value>) -> Self {
        Self {
            library: library.to_owned(),
            ctor_args,
            props: AHashMap::new(),
        }
    }
}

/// Evaluates a static (`Class::method`) call.
pub fn call_static(library: &str, method: &str, args: &[Value]) -> RunResult<Value> {
    match (library, method) {
        ("Adafruit_NeoPixel", "Color") => neopixel_color(args),
        _ => Err(RunError::type_error(format!("unknown member `{library}::{method}`"))),
    }
}

/// Evaluates an internal instance method against the object's state.
pub fn call_internal(object: &mut LibraryObject, method: &str, args: &[Value]) -> RunResult<Value> {
    match (object.library.as_str(), method) {
        ("EEPROM", "length") => Ok(Value::long(1024)),
        _ => {
            let _ = args;
            Err(RunError::type_error(format!(
                "unknown internal method `{}.{method}`",
                object.library
            )))
        }
    }
}

/// `Adafruit_NeoPixel::Color(r, g, b[, w])`: packs channels into a 32-bit
/// color word.
fn neopixel_color(args: &[Value]) -> RunResult<Value> {
    if !(3..=4).contains(&args.len()) {
        return Err(RunError::type_error(format!(
            "Adafruit_NeoPixel::Color expects 3 or 4 arguments, got {}",
            args.len()
        )));
    }
    let channel = |v: &Value| -> RunResult<u32> { Ok((v.as_i64()? as u32) & 0xFF) };
    let r = channel(&args[0])?;
    let g = channel(&args[1])?;
    let b = channel(&args[2])?;
    let w = if args.len() == 4 { channel(&args[3])? } else { 0 };
    let packed = (w << 24) | (r << 16) | (g << 8) | b;
    Ok(Value::typed_int(i64::from(packed), crate::value::IntType::U32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_classification() {
        let neopixel = library("Adafruit_NeoPixel").unwrap();
        assert_eq!(neopixel.method_kind("show"), Some(External));
        assert_eq!(neopixel.method_kind("numPixels"), Some(ExternalRequest));
        assert_eq!(neopixel.method_kind("bogus"), None);
        assert!(neopixel.has_static_method("Color"));
    }

    #[test]
    fn serial_aliases() {
        assert!(library("Serial1").is_some());
        assert_eq!(library("Serial3").unwrap().name, "Serial");
        assert!(library("Serial9").is_none());
    }

    #[test]
    fn neopixel_color_packs_channels() {
        let args = [Value::int(0x12), Value::int(0x34), Value::int(0x56)];
        let packed = call_static("Adafruit_NeoPixel", "Color", &args).unwrap();
        assert_eq!(packed.as_i64().unwrap(), 0x0012_3456);
    }

    #[test]
    fn unknown_static_is_type_error() {
        let err = call_static("Servo", "bogus", &[]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TypeError);
    }
}
