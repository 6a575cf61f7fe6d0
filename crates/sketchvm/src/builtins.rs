//! Built-in Arduino functions: hardware/timing calls that emit commands,
//! external reads that suspend, and the pure math/character helpers.

use crate::{
    error::{RunError, RunResult},
    value::{IntType, Value},
};

/// Closed set of built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    // Hardware and timing; these emit command records.
    PinMode,
    DigitalWrite,
    DigitalRead,
    AnalogWrite,
    AnalogRead,
    Delay,
    DelayMicroseconds,
    Millis,
    Micros,
    Tone,
    NoTone,
    Exit,
    // Pure helpers; no commands.
    Map,
    Constrain,
    Abs,
    Min,
    Max,
    Pow,
    Sq,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Random,
    RandomSeed,
    IsDigit,
    IsAlpha,
    IsAlphaNumeric,
    IsSpace,
    IsWhitespace,
    IsUpperCase,
    IsLowerCase,
    IsPunct,
    IsHexadecimalDigit,
    IsAscii,
    IsControl,
    IsGraph,
    IsPrintable,
    ToUpperCase,
    ToLowerCase,
}

impl Builtin {
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        let builtin = match name {
            "pinMode" => Self::PinMode,
            "digitalWrite" => Self::DigitalWrite,
            "digitalRead" => Self::DigitalRead,
            "analogWrite" => Self::AnalogWrite,
            "analogRead" => Self::AnalogRead,
            "delay" => Self::Delay,
            "delayMicroseconds" => Self::DelayMicroseconds,
            "millis" => Self::Millis,
            "micros" => Self::Micros,
            "tone" => Self::Tone,
            "noTone" => Self::NoTone,
            "exit" => Self::Exit,
            "map" => Self::Map,
            "constrain" => Self::Constrain,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            "sq" => Self::Sq,
            "sqrt" => Self::Sqrt,
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "random" => Self::Random,
            "randomSeed" => Self::RandomSeed,
            "isDigit" => Self::IsDigit,
            "isAlpha" => Self::IsAlpha,
            "isAlphaNumeric" => Self::IsAlphaNumeric,
            "isSpace" => Self::IsSpace,
            "isWhitespace" => Self::IsWhitespace,
            "isUpperCase" => Self::IsUpperCase,
            "isLowerCase" => Self::IsLowerCase,
            "isPunct" => Self::IsPunct,
            "isHexadecimalDigit" => Self::IsHexadecimalDigit,
            "isAscii" => Self::IsAscii,
            "isControl" => Self::IsControl,
            "isGraph" => Self::IsGraph,
            "isPrintable" => Self::IsPrintable,
            "toUpperCase" => Self::ToUpperCase,
            "toLowerCase" => Self::ToLowerCase,
            _ => return None,
        };
        Some(builtin)
    }

    /// External reads suspend execution until the host supplies a value.
    #[must_use]
    pub fn is_external_read(self) -> bool {
        matches!(self, Self::DigitalRead | Self::AnalogRead | Self::Millis | Self::Micros)
    }

    /// Whether this builtin emits a command record (vs. pure computation).
    #[must_use]
    pub fn emits_command(self) -> bool {
        matches!(
            self,
            Self::PinMode
                | Self::DigitalWrite
                | Self::DigitalRead
                | Self::AnalogWrite
                | Self::AnalogRead
                | Self::Delay
                | Self::DelayMicroseconds
                | Self::Millis
                | Self::Micros
                | Self::Tone
                | Self::NoTone
        )
    }
}

/// Renders a `pinMode` mode argument symbolically for the command payload.
#[must_use]
pub fn pin_mode_name(mode: i64) -> String {
    match mode {
        0 => "INPUT".to_owned(),
        1 => "OUTPUT".to_owned(),
        2 => "INPUT_PULLUP".to_owned(),
        other => other.to_string(),
    }
}

fn arity(name: &str, args: &[Value], expected: std::ops::RangeInclusive<usize>) -> RunResult<()> {
    if expected.contains(&args.len()) {
        return Ok(());
    }
    Err(RunError::type_error(format!(
        "{name} expects {} to {} arguments, got {}",
        expected.start(),
        expected.end(),
        args.len()
    )))
}

fn char_arg(name: &str, args: &[Value]) -> RunResult<char> {
    arity(name, args, 1..=1)?;
    let code = args[0].as_i64()?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| RunError::type_error(format!("{name} argument out of character range")))
}

/// Evaluates a pure builtin. `rng` is the interpreter's deterministic
/// `random()` state.
pub fn call_pure(builtin: Builtin, args: &[Value], rng: &mut u64) -> RunResult<Value> {
    match builtin {
        Builtin::Map => {
            arity("map", args, 5..=5)?;
            let x = args[0].as_i64()?;
            let in_min = args[1].as_i64()?;
            let in_max = args[2].as_i64()?;
            let out_min = args[3].as_i64()?;
            let out_max = args[4].as_i64()?;
            if in_max == in_min {
                return Err(RunError::division_by_zero());
            }
            let mapped = (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min;
            Ok(Value::long(mapped))
        }
        Builtin::Constrain => {
            arity("constrain", args, 3..=3)?;
            if args.iter().any(|a| matches!(a, Value::Float32(_) | Value::Float64(_))) {
                let x = args[0].as_f64()?;
                let low = args[1].as_f64()?;
                let high = args[2].as_f64()?;
                Ok(Value::Float64(x.clamp(low.min(high), high.max(low))))
            } else {
                let x = args[0].as_i64()?;
                let low = args[1].as_i64()?;
                let high = args[2].as_i64()?;
                Ok(Value::long(x.clamp(low.min(high), high.max(low))))
            }
        }
        Builtin::Abs => {
            arity("abs", args, 1..=1)?;
            match &args[0] {
                Value::Float32(v) => Ok(Value::Float32(v.abs())),
                Value::Float64(v) => Ok(Value::Float64(v.abs())),
                other => Ok(Value::long(other.as_i64()?.wrapping_abs())),
            }
        }
        Builtin::Min | Builtin::Max => {
            let name = if builtin == Builtin::Min { "min" } else { "max" };
            arity(name, args, 2..=2)?;
            if args.iter().any(|a| matches!(a, Value::Float32(_) | Value::Float64(_))) {
                let a = args[0].as_f64()?;
                let b = args[1].as_f64()?;
                let v = if builtin == Builtin::Min { a.min(b) } else { a.max(b) };
                Ok(Value::Float64(v))
            } else {
                let a = args[0].as_i64()?;
                let b = args[1].as_i64()?;
                let v = if builtin == Builtin::Min { a.min(b) } else { a.max(b) };
                Ok(Value::long(v))
            }
        }
        Builtin::Pow => {
            arity("pow", args, 2..=2)?;
            Ok(Value::Float64(args[0].as_f64()?.powf(args[1].as_f64()?)))
        }
        Builtin::Sq => {
            arity("sq", args, 1..=1)?;
            match &args[0] {
                Value::Float32(v) => Ok(Value::Float32(v * v)),
                Value::Float64(v) => Ok(Value::Float64(v * v)),
                other => {
                    let v = other.as_i64()?;
                    Ok(Value::long(v.wrapping_mul(v)))
                }
            }
        }
        Builtin::Sqrt => {
            arity("sqrt", args, 1..=1)?;
            Ok(Value::Float64(args[0].as_f64()?.sqrt()))
        }
        Builtin::Sin => {
            arity("sin", args, 1..=1)?;
            Ok(Value::Float64(args[0].as_f64()?.sin()))
        }
        Builtin::Cos => {
            arity("cos", args, 1..=1)?;
            Ok(Value::Float64(args[0].as_f64()?.cos()))
        }
        Builtin::Tan => {
            arity("tan", args, 1..=1)?;
            Ok(Value::Float64(args[0].as_f64()?.tan()))
        }
        Builtin::Random => {
            arity("random", args, 1..=2)?;
            let (low, high) = if args.len() == 2 {
                (args[0].as_i64()?, args[1].as_i64()?)
            } else {
                (0, args[0].as_i64()?)
            };
            if high <= low {
                return Ok(Value::long(low));
            }
            let span = (high - low) as u64;
            Ok(Value::long(low + (next_random(rng) % span) as i64))
        }
        Builtin::RandomSeed => {
            arity("randomSeed", args, 1..=1)?;
            *rng = args[0].as_i64()? as u64 | 1;
            Ok(Value::Void)
        }
        Builtin::IsDigit => Ok(Value::Bool(char_arg("isDigit", args)?.is_ascii_digit())),
        Builtin::IsAlpha => Ok(Value::Bool(char_arg("isAlpha", args)?.is_ascii_alphabetic())),
        Builtin::IsAlphaNumeric => Ok(Value::Bool(char_arg("isAlphaNumeric", args)?.is_ascii_alphanumeric())),
        Builtin::IsSpace => Ok(Value::Bool(matches!(
            char_arg("isSpace", args)?,
            ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c'
        ))),
        Builtin::IsWhitespace => Ok(Value::Bool(matches!(char_arg("isWhitespace", args)?, ' ' | '\t'))),
        Builtin::IsUpperCase => Ok(Value::Bool(char_arg("isUpperCase", args)?.is_ascii_uppercase())),
        Builtin::IsLowerCase => Ok(Value::Bool(char_arg("isLowerCase", args)?.is_ascii_lowercase())),
        Builtin::IsPunct => Ok(Value::Bool(char_arg("isPunct", args)?.is_ascii_punctuation())),
        Builtin::IsHexadecimalDigit => Ok(Value::Bool(char_arg("isHexadecimalDigit", args)?.is_ascii_hexdigit())),
        Builtin::IsAscii => Ok(Value::Bool(char_arg("isAscii", args)?.is_ascii())),
        Builtin::IsControl => Ok(Value::Bool(char_arg("isControl", args)?.is_ascii_control())),
        Builtin::IsGraph => Ok(Value::Bool(char_arg("isGraph", args)?.is_ascii_graphic())),
        Builtin::IsPrintable => {
            let c = char_arg("isPrintable", args)?;
            Ok(Value::Bool(c.is_ascii_graphic() || c == ' '))
        }
        Builtin::ToUpperCase => {
            let c = char_arg("toUpperCase", args)?;
            Ok(Value::typed_int(
                i64::from(u32::from(c.to_ascii_uppercase())),
                IntType {
                    width: crate::value::IntWidth::W8,
                    unsigned: false,
                },
            ))
        }
        Builtin::ToLowerCase => {
            let c = char_arg("toLowerCase", args)?;
            Ok(Value::typed_int(
                i64::from(u32::from(c.to_ascii_lowercase())),
                IntType {
                    width: crate::value::IntWidth::W8,
                    unsigned: false,
                },
            ))
        }
        other => Err(RunError::type_error(format!("{other:?} is not a pure builtin"))),
    }
}

/// xorshift64*: deterministic `random()` stream so command streams are
/// reproducible across runs and implementations.
fn next_random(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// Methods on the Arduino `String` class, implemented directly on string
/// values. All of them are internal (pure).
pub fn string_method(s: &str, method: &str, args: &[Value]) -> RunResult<Value> {
    match method {
        "length" => Ok(Value::long(s.chars().count() as i64)),
        "toInt" => Ok(Value::long(
            s.trim().parse::<i64>().unwrap_or_else(|_| leading_int(s)),
        )),
        "toFloat" | "toDouble" => Ok(Value::Float64(s.trim().parse::<f64>().unwrap_or(0.0))),
        "charAt" => {
            arity("charAt", args, 1..=1)?;
            let idx = args[0].as_i64()?;
            let c = usize::try_from(idx).ok().and_then(|i| s.chars().nth(i)).unwrap_or('\0');
            Ok(Value::typed_int(
                i64::from(u32::from(c)),
                IntType {
                    width: crate::value::IntWidth::W8,
                    unsigned: false,
                },
            ))
        }
        "substring" => {
            arity("substring", args, 1..=2)?;
            let from = usize::try_from(args[0].as_i64()?).unwrap_or(0);
            let to = if args.len() == 2 {
                usize::try_from(args[1].as_i64()?).unwrap_or(0)
            } else {
                s.chars().count()
            };
            let out: String = s.chars().skip(from).take(to.saturating_sub(from)).collect();
            Ok(Value::Str(out))
        }
        "indexOf" => {
            arity("indexOf", args, 1..=1)?;
            let needle = args[0].display_text();
            Ok(Value::long(s.find(&needle).map_or(-1, |i| i as i64)))
        }
        "startsWith" => {
            arity("startsWith", args, 1..=1)?;
            Ok(Value::Bool(s.starts_with(&args[0].display_text())))
        }
        "endsWith" => {
            arity("endsWith", args, 1..=1)?;
            Ok(Value::Bool(s.ends_with(&args[0].display_text())))
        }
        "equals" => {
            arity("equals", args, 1..=1)?;
            Ok(Value::Bool(s == args[0].display_text()))
        }
        "equalsIgnoreCase" => {
            arity("equalsIgnoreCase", args, 1..=1)?;
            Ok(Value::Bool(s.eq_ignore_ascii_case(&args[0].display_text())))
        }
        "toUpperCase" => Ok(Value::Str(s.to_ascii_uppercase())),
        "toLowerCase" => Ok(Value::Str(s.to_ascii_lowercase())),
        "trim" => Ok(Value::Str(s.trim().to_owned())),
        "isEmpty" => Ok(Value::Bool(s.is_empty())),
        "concat" => {
            arity("concat", args, 1..=1)?;
            let mut out = s.to_owned();
            out.push_str(&args[0].display_text());
            Ok(Value::Str(out))
        }
        other => Err(RunError::type_error(format!("unknown member `String.{other}`"))),
    }
}

fn leading_int(s: &str) -> i64 {
    let trimmed = s.trim_start();
    let mut end = 0;
    for (i, c) in trimmed.char_indices() {
        if (c == '-' && i == 0) || c.is_ascii_digit() {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    trimmed[..end].parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_scales_linearly() {
        let args = [
            Value::int(512),
            Value::int(0),
            Value::int(1023),
            Value::int(0),
            Value::int(255),
        ];
        let mut rng = 1;
        let result = call_pure(Builtin::Map, &args, &mut rng).unwrap();
        assert_eq!(result.as_i64().unwrap(), 127);
    }

    #[test]
    fn constrain_clamps() {
        let mut rng = 1;
        let args = [Value::int(300), Value::int(0), Value::int(255)];
        assert_eq!(call_pure(Builtin::Constrain, &args, &mut rng).unwrap().as_i64().unwrap(), 255);
    }

    #[test]
    fn random_is_deterministic_and_in_range() {
        let mut rng_a = 42;
        let mut rng_b = 42;
        for _ in 0..100 {
            let a = call_pure(Builtin::Random, &[Value::int(10)], &mut rng_a).unwrap();
            let b = call_pure(Builtin::Random, &[Value::int(10)], &mut rng_b).unwrap();
            assert_eq!(a, b);
            let v = a.as_i64().unwrap();
            assert!((0..10).contains(&v));
        }
    }

    #[test]
    fn char_classification() {
        let mut rng = 1;
        let digit = [Value::int(i64::from(u32::from('7')))];
        assert_eq!(call_pure(Builtin::IsDigit, &digit, &mut rng).unwrap(), Value::Bool(true));
        let space = [Value::int(i64::from(u32::from(' ')))];
        assert_eq!(call_pure(Builtin::IsSpace, &space, &mut rng).unwrap(), Value::Bool(true));
        assert_eq!(call_pure(Builtin::IsAlpha, &digit, &mut rng).unwrap(), Value::Bool(false));
    }

    #[test]
    fn string_methods() {
        assert_eq!(
            string_method("hello", "length", &[]).unwrap().as_i64().unwrap(),
            5
        );
        assert_eq!(
            string_method("42abc", "toInt", &[]).unwrap().as_i64().unwrap(),
            42
        );
        assert_eq!(
            string_method("hello", "substring", &[Value::int(1), Value::int(3)]).unwrap(),
            Value::Str("el".to_owned())
        );
        assert_eq!(
            string_method("hello", "indexOf", &[Value::Str("ll".to_owned())]).unwrap().as_i64().unwrap(),
            2
        );
    }
}
