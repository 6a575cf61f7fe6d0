//! Runtime values: a tagged union covering the C++ subset's data model,
//! with explicit widening/narrowing routines and a closed binary-operator
//! dispatch.

use indexmap::IndexMap;

use crate::{
    ast::NodeId,
    error::{RunError, RunResult},
    scope::VarId,
};

/// Integer storage width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    #[must_use]
    pub fn bytes(self) -> u32 {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
            Self::W64 => 8,
        }
    }
}

/// Width plus signedness of an integer lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IntType {
    pub width: IntWidth,
    pub unsigned: bool,
}

impl IntType {
    pub const I32: Self = Self {
        width: IntWidth::W32,
        unsigned: false,
    };
    pub const U32: Self = Self {
        width: IntWidth::W32,
        unsigned: true,
    };
    pub const I64: Self = Self {
        width: IntWidth::W64,
        unsigned: false,
    };

    /// Normalizes `bits` to this lane: truncate to width, then sign- or
    /// zero-extend back to i64.
    #[must_use]
    pub fn normalize(self, bits: i64) -> i64 {
        match (self.width, self.unsigned) {
            (IntWidth::W8, false) => i64::from(bits as i8),
            (IntWidth::W8, true) => i64::from(bits as u8),
            (IntWidth::W16, false) => i64::from(bits as i16),
            (IntWidth::W16, true) => i64::from(bits as u16),
            (IntWidth::W32, false) => i64::from(bits as i32),
            (IntWidth::W32, true) => i64::from(bits as u32),
            (IntWidth::W64, _) => bits,
        }
    }
}

/// Handle into the interpreter's library-object table.
///
/// Library objects never hold a back-reference to the interpreter; operations
/// take the interpreter as a parameter and resolve the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LibraryHandle(pub u32);

/// What a pointer refers to.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PointerTarget {
    Null,
    /// A whole variable slot.
    Var(VarId),
    /// One element of an array variable.
    Elem(VarId, u32),
    /// A named member of a struct variable.
    Member(VarId, String),
    /// A function, for function pointers.
    Function(NodeId),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PointerValue {
    pub target: PointerTarget,
}

impl PointerValue {
    #[must_use]
    pub fn null() -> Self {
        Self {
            target: PointerTarget::Null,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self.target, PointerTarget::Null)
    }
}

/// Dense array storage. Multi-dimensional arrays nest: the outer array's
/// elements are themselves arrays.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArrayValue {
    pub elem: TypeDesc,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StructValue {
    pub type_name: String,
    pub fields: IndexMap<String, Value>,
}

/// Primary runtime value type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Void,
    Bool(bool),
    Int {
        /// Normalized per `ty` (see [`IntType::normalize`]).
        bits: i64,
        ty: IntType,
    },
    Float32(f32),
    Float64(f64),
    Str(String),
    Array(ArrayValue),
    Struct(StructValue),
    Pointer(PointerValue),
    Library(LibraryHandle),
    Function(NodeId),
}

impl Value {
    #[must_use]
    pub fn int(v: i64) -> Self {
        Self::Int {
            bits: IntType::I32.normalize(v),
            ty: IntType::I32,
        }
    }

    #[must_use]
    pub fn long(v: i64) -> Self {
        Self::Int { bits: v, ty: IntType::I64 }
    }

    #[must_use]
    pub fn typed_int(v: i64, ty: IntType) -> Self {
        Self::Int {
            bits: ty.normalize(v),
            ty,
        }
    }

    /// Truthiness per C: numbers against zero, pointers against null.
    pub fn truthy(&self) -> RunResult<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Int { bits, .. } => Ok(*bits != 0),
            Self::Float32(v) => Ok(*v != 0.0),
            Self::Float64(v) => Ok(*v != 0.0),
            Self::Pointer(p) => Ok(!p.is_null()),
            Self::Str(s) => Ok(!s.is_empty()),
            Self::Void => Ok(false),
            other => Err(RunError::type_error(format!(
                "value of type {} cannot be used as a condition",
                other.type_label()
            ))),
        }
    }

    pub fn as_i64(&self) -> RunResult<i64> {
        match self {
            Self::Bool(b) => Ok(i64::from(*b)),
            Self::Int { bits, .. } => Ok(*bits),
            Self::Float32(v) => Ok(*v as i64),
            Self::Float64(v) => Ok(*v as i64),
            other => Err(RunError::type_error(format!(
                "expected a number, found {}",
                other.type_label()
            ))),
        }
    }

    pub fn as_f64(&self) -> RunResult<f64> {
        match self {
            Self::Bool(b) => Ok(f64::from(u8::from(*b))),
            Self::Int { bits, ty } => {
                if ty.unsigned {
                    Ok((*bits as u64) as f64)
                } else {
                    Ok(*bits as f64)
                }
            }
            Self::Float32(v) => Ok(f64::from(*v)),
            Self::Float64(v) => Ok(*v),
            other => Err(RunError::type_error(format!(
                "expected a number, found {}",
                other.type_label()
            ))),
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Bool(_) | Self::Int { .. } | Self::Float32(_) | Self::Float64(_))
    }

    /// Human-readable type name; also the result of `typeof`.
    #[must_use]
    pub fn type_label(&self) -> String {
        match self {
            Self::Void => "void".to_owned(),
            Self::Bool(_) => "bool".to_owned(),
            Self::Int { ty, .. } => match (ty.width, ty.unsigned) {
                (IntWidth::W8, false) => "char".to_owned(),
                (IntWidth::W8, true) => "byte".to_owned(),
                (IntWidth::W16, false) => "short".to_owned(),
                (IntWidth::W16, true) => "word".to_owned(),
                (IntWidth::W32, false) => "int".to_owned(),
                (IntWidth::W32, true) => "unsigned int".to_owned(),
                (IntWidth::W64, false) => "long long".to_owned(),
                (IntWidth::W64, true) => "unsigned long long".to_owned(),
            },
            Self::Float32(_) => "float".to_owned(),
            Self::Float64(_) => "double".to_owned(),
            Self::Str(_) => "String".to_owned(),
            Self::Array(a) => format!("{}[]", a.elem.label()),
            Self::Struct(s) => s.type_name.clone(),
            Self::Pointer(_) => "pointer".to_owned(),
            Self::Library(_) => "object".to_owned(),
            Self::Function(_) => "function".to_owned(),
        }
    }

    /// Text rendering used by `Serial.print` and `String` concatenation.
    ///
    /// Floats print with two decimal places, matching Arduino's default
    /// `Print::print(double)` behavior.
    #[must_use]
    pub fn display_text(&self) -> String {
        match self {
            Self::Void => String::new(),
            Self::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
            Self::Int { bits, ty } => {
                // `char` prints as a character, matching Print::print(char);
                // byte and wider lanes print numerically.
                if ty.width == IntWidth::W8 && !ty.unsigned {
                    if let Some(c) = u32::try_from(*bits).ok().and_then(char::from_u32) {
                        return c.to_string();
                    }
                }
                if ty.unsigned {
                    format!("{}", *bits as u64)
                } else {
                    format!("{bits}")
                }
            }
            Self::Float32(v) => format!("{v:.2}"),
            Self::Float64(v) => format!("{v:.2}"),
            Self::Str(s) => s.clone(),
            Self::Array(a) => format!("[array of {}]", a.data.len()),
            Self::Struct(s) => format!("[{}]", s.type_name),
            Self::Pointer(p) => {
                if p.is_null() {
                    "0".to_owned()
                } else {
                    "[pointer]".to_owned()
                }
            }
            Self::Library(_) => "[object]".to_owned(),
            Self::Function(_) => "[function]".to_owned(),
        }
    }

    /// JSON rendering for command payloads.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Void => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int { bits, ty } => {
                if ty.unsigned {
                    serde_json::Value::from(*bits as u64)
                } else {
                    serde_json::Value::from(*bits)
                }
            }
            Self::Float32(v) => serde_json::Value::from(f64::from(*v)),
            Self::Float64(v) => serde_json::Value::from(*v),
            Self::Str(s) => serde_json::Value::from(s.clone()),
            Self::Array(a) => serde_json::Value::Array(a.data.iter().map(Self::to_json).collect()),
            Self::Struct(s) => {
                let mut map = serde_json::Map::new();
                for (name, value) in &s.fields {
                    map.insert(name.clone(), value.to_json());
                }
                serde_json::Value::Object(map)
            }
            Self::Pointer(p) => {
                if p.is_null() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::from("[pointer]")
                }
            }
            Self::Library(_) => serde_json::Value::from("[object]"),
            Self::Function(_) => serde_json::Value::from("[function]"),
        }
    }

    /// Rough memory estimate, used against the value-byte limit.
    #[must_use]
    pub fn estimate_bytes(&self) -> usize {
        match self {
            Self::Str(s) => s.len() + 24,
            Self::Array(a) => a.data.iter().map(Self::estimate_bytes).sum::<usize>() + 24,
            Self::Struct(s) => s.fields.values().map(Self::estimate_bytes).sum::<usize>() + 24,
            _ => 16,
        }
    }
}

// ----------------------------------------------------------------------
// Declared types
// ----------------------------------------------------------------------

/// Base of a resolved declared type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BaseType {
    Void,
    Bool,
    Int(IntType),
    Float32,
    Float64,
    /// The Arduino `String` class.
    ArduinoString,
    /// A struct, enum, or library class referenced by name.
    Named(String),
    /// `auto`: the initializer's type wins.
    Auto,
}

/// A declared type resolved from a `TypeName` node's canonical string.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TypeDesc {
    pub base: BaseType,
    /// Pointer indirection level (`*` count).
    pub pointer: u8,
    pub reference: bool,
}

impl TypeDesc {
    /// Resolves a canonical type string (`unsigned long`, `char*`, `Servo`)
    /// against the platform's `int` width.
    #[must_use]
    pub fn parse(name: &str, int_bytes: u8) -> Self {
        let mut text = name.trim();
        let mut reference = false;
        if let Some(stripped) = text.strip_suffix('&') {
            reference = true;
            text = stripped.trim_end();
        }
        let mut pointer = 0u8;
        while let Some(stripped) = text.strip_suffix('*') {
            pointer += 1;
            text = stripped.trim_end();
        }

        let int_width = if int_bytes <= 2 { IntWidth::W16 } else { IntWidth::W32 };
        let lane = |width: IntWidth, unsigned: bool| BaseType::Int(IntType { width, unsigned });
        let base = match text {
            "void" => BaseType::Void,
            "bool" | "boolean" => BaseType::Bool,
            "char" | "signed char" | "int8_t" => lane(IntWidth::W8, false),
            "unsigned char" | "byte" | "uint8_t" => lane(IntWidth::W8, true),
            "short" | "short int" | "signed short" | "int16_t" => lane(IntWidth::W16, false),
            "unsigned short" | "word" | "uint16_t" => lane(IntWidth::W16, true),
            "int" | "signed" | "signed int" => lane(int_width, false),
            "unsigned" | "unsigned int" => lane(int_width, true),
            "long" | "long int" | "signed long" | "int32_t" => lane(IntWidth::W32, false),
            "unsigned long" | "uint32_t" | "size_t" => lane(IntWidth::W32, true),
            "long long" | "signed long long" | "int64_t" => lane(IntWidth::W64, false),
            "unsigned long long" | "uint64_t" => lane(IntWidth::W64, true),
            "float" => BaseType::Float32,
            "double" | "long double" => BaseType::Float64,
            "String" => BaseType::ArduinoString,
            "auto" => BaseType::Auto,
            other => BaseType::Named(other.to_owned()),
        };
        Self {
            base,
            pointer,
            reference,
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        let mut out = match &self.base {
            BaseType::Void => "void".to_owned(),
            BaseType::Bool => "bool".to_owned(),
            BaseType::Int(ty) => match (ty.width, ty.unsigned) {
                (IntWidth::W8, false) => "char".to_owned(),
                (IntWidth::W8, true) => "byte".to_owned(),
                (IntWidth::W16, false) => "short".to_owned(),
                (IntWidth::W16, true) => "word".to_owned(),
                (IntWidth::W32, false) => "int".to_owned(),
                (IntWidth::W32, true) => "unsigned int".to_owned(),
                (IntWidth::W64, false) => "long long".to_owned(),
                (IntWidth::W64, true) => "unsigned long long".to_owned(),
            },
            BaseType::Float32 => "float".to_owned(),
            BaseType::Float64 => "double".to_owned(),
            BaseType::ArduinoString => "String".to_owned(),
            BaseType::Named(name) => name.clone(),
            BaseType::Auto => "auto".to_owned(),
        };
        for _ in 0..self.pointer {
            out.push('*');
        }
        out
    }

    /// `sizeof` for this type, consistent with the platform's word sizes.
    #[must_use]
    pub fn size_of(&self, pointer_bytes: u8) -> u32 {
        if self.pointer > 0 {
            return u32::from(pointer_bytes);
        }
        match &self.base {
            BaseType::Void => 1,
            BaseType::Bool => 1,
            BaseType::Int(ty) => ty.width.bytes(),
            BaseType::Float32 => 4,
            BaseType::Float64 => 8,
            BaseType::ArduinoString => 6,
            BaseType::Named(_) => u32::from(pointer_bytes),
            BaseType::Auto => u32::from(pointer_bytes),
        }
    }

    /// The zero value a declaration of this type starts with.
    #[must_use]
    pub fn default_value(&self) -> Value {
        if self.pointer > 0 {
            return Value::Pointer(PointerValue::null());
        }
        match &self.base {
            BaseType::Void => Value::Void,
            BaseType::Bool => Value::Bool(false),
            BaseType::Int(ty) => Value::Int { bits: 0, ty: *ty },
            BaseType::Float32 => Value::Float32(0.0),
            BaseType::Float64 => Value::Float64(0.0),
            BaseType::ArduinoString => Value::Str(String::new()),
            BaseType::Named(name) => Value::Struct(StructValue {
                type_name: name.clone(),
                fields: IndexMap::new(),
            }),
            BaseType::Auto => Value::Void,
        }
    }
}

// ----------------------------------------------------------------------
// Conversion
// ----------------------------------------------------------------------

/// Converts `value` to the declared type `ty`: the assignment conversion of
/// spec §4.5.3. Floats truncate toward zero when assigned to integers;
/// `String` parses from and formats to numbers.
pub fn convert(value: Value, ty: &TypeDesc) -> RunResult<Value> {
    if ty.pointer > 0 {
        return match value {
            Value::Pointer(_) => Ok(value),
            Value::Int { bits: 0, .. } => Ok(Value::Pointer(PointerValue::null())),
            Value::Str(_) if ty.pointer == 1 => Ok(value), // char* from string literal
            Value::Array(_) => Ok(value),                  // arrays decay in practice
            Value::Function(_) => Ok(value),
            other => Err(RunError::type_error(format!(
                "cannot convert {} to {}",
                other.type_label(),
                ty.label()
            ))),
        };
    }
    match &ty.base {
        BaseType::Auto => Ok(value),
        BaseType::Void => Ok(Value::Void),
        BaseType::Bool => Ok(Value::Bool(value.truthy()?)),
        BaseType::Int(int_ty) => {
            let bits = match &value {
                Value::Str(s) => parse_arduino_number(s),
                // Truncation toward zero for float sources.
                Value::Float32(v) => *v as i64,
                Value::Float64(v) => *v as i64,
                other => other.as_i64()?,
            };
            Ok(Value::typed_int(bits, *int_ty))
        }
        BaseType::Float32 => {
            let v = match &value {
                Value::Str(s) => parse_arduino_float(s),
                other => other.as_f64()?,
            };
            Ok(Value::Float32(v as f32))
        }
        BaseType::Float64 => {
            let v = match &value {
                Value::Str(s) => parse_arduino_float(s),
                other => other.as_f64()?,
            };
            Ok(Value::Float64(v))
        }
        BaseType::ArduinoString => match value {
            Value::Str(_) => Ok(value),
            other if other.is_numeric() => Ok(Value::Str(other.display_text())),
            other => Err(RunError::type_error(format!(
                "cannot convert {} to String",
                other.type_label()
            ))),
        },
        BaseType::Named(name) => match &value {
            Value::Struct(s) if s.type_name == *name => Ok(value),
            Value::Library(_) => Ok(value),
            // Enum-typed variables hold plain integers.
            Value::Int { .. } | Value::Bool(_) => Ok(value),
            other => Err(RunError::type_error(format!(
                "cannot convert {} to {name}",
                other.type_label()
            ))),
        },
    }
}

/// `String::toInt` semantics: leading integer, 0 when unparsable.
fn parse_arduino_number(s: &str) -> i64 {
    let trimmed = s.trim_start();
    let mut end = 0;
    for (i, c) in trimmed.char_indices() {
        if c == '-' && i == 0 || c.is_ascii_digit() {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    trimmed[..end].parse().unwrap_or(0)
}

/// `String::toFloat` semantics: leading decimal number, 0.0 when unparsable.
fn parse_arduino_float(s: &str) -> f64 {
    let trimmed = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in trimmed.char_indices() {
        if c == '-' && i == 0 || c.is_ascii_digit() {
            end = i + c.len_utf8();
        } else if c == '.' && !seen_dot {
            seen_dot = true;
            end = i + 1;
        } else {
            break;
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

// ----------------------------------------------------------------------
// Operators
// ----------------------------------------------------------------------

/// Usual arithmetic conversions for two integer lanes: promote to at least
/// 32 bits, unsigned wins ties.
#[must_use]
pub fn common_int_type(a: IntType, b: IntType) -> IntType {
    let width = a.width.max(b.width).max(IntWidth::W32);
    IntType {
        width,
        unsigned: a.unsigned || b.unsigned,
    }
}

fn int_type_of(value: &Value) -> IntType {
    match value {
        Value::Int { ty, .. } => *ty,
        _ => IntType::I32,
    }
}

/// Applies a binary operator. `&&`/`||` never reach this point; the
/// evaluator short-circuits them.
pub fn binary_op(op: &str, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    // Arduino String concatenation and comparison.
    if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) {
        return string_op(op, lhs, rhs);
    }
    // Pointer equality.
    if let (Value::Pointer(a), Value::Pointer(b)) = (lhs, rhs) {
        return match op {
            "==" => Ok(Value::Bool(a == b)),
            "!=" => Ok(Value::Bool(a != b)),
            _ => Err(RunError::type_error(format!("operator `{op}` not defined for pointers"))),
        };
    }
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return Err(RunError::type_error(format!(
            "operator `{op}` not defined for {} and {}",
            lhs.type_label(),
            rhs.type_label()
        )));
    }

    let float_result = matches!(lhs, Value::Float32(_) | Value::Float64(_))
        || matches!(rhs, Value::Float32(_) | Value::Float64(_));
    if float_result {
        let a = lhs.as_f64()?;
        let b = rhs.as_f64()?;
        let single = matches!(lhs, Value::Float32(_)) && matches!(rhs, Value::Float32(_) | Value::Int { .. } | Value::Bool(_))
            || matches!(rhs, Value::Float32(_)) && matches!(lhs, Value::Int { .. } | Value::Bool(_));
        let wrap = |v: f64| {
            if single {
                Value::Float32(v as f32)
            } else {
                Value::Float64(v)
            }
        };
        return match op {
            "+" => Ok(wrap(a + b)),
            "-" => Ok(wrap(a - b)),
            "*" => Ok(wrap(a * b)),
            "/" => {
                if b == 0.0 {
                    return Err(RunError::division_by_zero());
                }
                Ok(wrap(a / b))
            }
            "%" => Err(RunError::type_error("operator `%` not defined for floating point")),
            "==" => Ok(Value::Bool(a == b)),
            "!=" => Ok(Value::Bool(a != b)),
            "<" => Ok(Value::Bool(a < b)),
            ">" => Ok(Value::Bool(a > b)),
            "<=" => Ok(Value::Bool(a <= b)),
            ">=" => Ok(Value::Bool(a >= b)),
            _ => Err(RunError::type_error(format!(
                "operator `{op}` not defined for floating point"
            ))),
        };
    }

    let ty = common_int_type(int_type_of(lhs), int_type_of(rhs));
    let a = ty.normalize(lhs.as_i64()?);
    let b = ty.normalize(rhs.as_i64()?);
    let make = |bits: i64| Value::typed_int(bits, ty);
    let compare = || {
        if ty.unsigned {
            (a as u64).cmp(&(b as u64))
        } else {
            a.cmp(&b)
        }
    };
    match op {
        "+" => Ok(make(a.wrapping_add(b))),
        "-" => Ok(make(a.wrapping_sub(b))),
        "*" => Ok(make(a.wrapping_mul(b))),
        "/" => {
            if b == 0 {
                return Err(RunError::division_by_zero());
            }
            if ty.unsigned {
                Ok(make(((a as u64) / (b as u64)) as i64))
            } else {
                Ok(make(a.wrapping_div(b)))
            }
        }
        "%" => {
            if b == 0 {
                return Err(RunError::division_by_zero());
            }
            if ty.unsigned {
                Ok(make(((a as u64) % (b as u64)) as i64))
            } else {
                Ok(make(a.wrapping_rem(b)))
            }
        }
        "&" => Ok(make(a & b)),
        "|" => Ok(make(a | b)),
        "^" => Ok(make(a ^ b)),
        "<<" => {
            let shift = (b as u32) % (ty.width.bytes() * 8);
            Ok(make(a.wrapping_shl(shift)))
        }
        ">>" => {
            let shift = (b as u32) % (ty.width.bytes() * 8);
            if ty.unsigned {
                Ok(make(((a as u64).wrapping_shr(shift)) as i64))
            } else {
                Ok(make(a.wrapping_shr(shift)))
            }
        }
        "==" => Ok(Value::Bool(a == b)),
        "!=" => Ok(Value::Bool(a != b)),
        "<" => Ok(Value::Bool(compare() == std::cmp::Ordering::Less)),
        ">" => Ok(Value::Bool(compare() == std::cmp::Ordering::Greater)),
        "<=" => Ok(Value::Bool(compare() != std::cmp::Ordering::Greater)),
        ">=" => Ok(Value::Bool(compare() != std::cmp::Ordering::Less)),
        other => Err(RunError::type_error(format!("unknown operator `{other}`"))),
    }
}

fn string_op(op: &str, lhs: &Value, rhs: &Value) -> RunResult<Value> {
    match op {
        "+" => {
            let mut out = lhs.display_text();
            out.push_str(&rhs.display_text());
            Ok(Value::Str(out))
        }
        "==" | "!=" | "<" | ">" | "<=" | ">=" => {
            let (Value::Str(a), Value::Str(b)) = (lhs, rhs) else {
                return Err(RunError::type_error(format!(
                    "operator `{op}` not defined for {} and {}",
                    lhs.type_label(),
                    rhs.type_label()
                )));
            };
            let ordering = a.cmp(b);
            let result = match op {
                "==" => ordering == std::cmp::Ordering::Equal,
                "!=" => ordering != std::cmp::Ordering::Equal,
                "<" => ordering == std::cmp::Ordering::Less,
                ">" => ordering == std::cmp::Ordering::Greater,
                "<=" => ordering != std::cmp::Ordering::Greater,
                ">=" => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        other => Err(RunError::type_error(format!(
            "operator `{other}` not defined for String operands"
        ))),
    }
}

/// Applies a prefix unary operator (`-`, `+`, `!`, `~`). Increment,
/// dereference, and address-of are handled by the evaluator because they
/// touch storage.
pub fn unary_op(op: &str, operand: &Value) -> RunResult<Value> {
    match op {
        "!" => Ok(Value::Bool(!operand.truthy()?)),
        "+" => {
            if operand.is_numeric() {
                Ok(operand.clone())
            } else {
                Err(RunError::type_error(format!(
                    "unary `+` not defined for {}",
                    operand.type_label()
                )))
            }
        }
        "-" => match operand {
            Value::Float32(v) => Ok(Value::Float32(-v)),
            Value::Float64(v) => Ok(Value::Float64(-v)),
            Value::Int { bits, ty } => {
                let ty = common_int_type(*ty, IntType::I32);
                Ok(Value::typed_int(bits.wrapping_neg(), ty))
            }
            Value::Bool(b) => Ok(Value::int(-i64::from(*b))),
            other => Err(RunError::type_error(format!(
                "unary `-` not defined for {}",
                other.type_label()
            ))),
        },
        "~" => {
            let ty = common_int_type(int_type_of(operand), IntType::I32);
            let bits = ty.normalize(operand.as_i64()?);
            Ok(Value::typed_int(!bits, ty))
        }
        other => Err(RunError::type_error(format!("unknown unary operator `{other}`"))),
    }
}

/// Builds a zero-initialized (possibly nested) array of `dims` extents.
#[must_use]
pub fn zero_array(elem: &TypeDesc, dims: &[u32]) -> Value {
    match dims {
        [] => elem.default_value(),
        [head, rest @ ..] => {
            let data = (0..*head).map(|_| zero_array(elem, rest)).collect();
            Value::Array(ArrayValue {
                elem: elem.clone(),
                data,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(v: i64) -> Value {
        Value::int(v)
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let max = Value::typed_int(i64::from(i32::MAX), IntType::I32);
        let result = binary_op("+", &max, &i(1)).unwrap();
        assert_eq!(result.as_i64().unwrap(), i64::from(i32::MIN));
    }

    #[test]
    fn unsigned_comparison() {
        let minus_one = Value::typed_int(-1, IntType::I32);
        let zero_u = Value::typed_int(0, IntType::U32);
        // -1 promoted to unsigned compares greater than 0.
        let result = binary_op(">", &minus_one, &zero_u).unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = binary_op("/", &i(1), &i(0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DivisionByZero);
        let err = binary_op("%", &i(1), &i(0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DivisionByZero);
    }

    #[test]
    fn float_truncates_toward_zero_on_assignment() {
        let ty = TypeDesc::parse("int", 4);
        assert_eq!(convert(Value::Float64(3.9), &ty).unwrap().as_i64().unwrap(), 3);
        assert_eq!(convert(Value::Float64(-3.9), &ty).unwrap().as_i64().unwrap(), -3);
    }

    #[test]
    fn narrowing_truncates() {
        let ty = TypeDesc::parse("byte", 4);
        assert_eq!(convert(i(300), &ty).unwrap().as_i64().unwrap(), 44);
        let ty = TypeDesc::parse("char", 4);
        assert_eq!(convert(i(200), &ty).unwrap().as_i64().unwrap(), -56);
    }

    #[test]
    fn platform_int_width_matters() {
        // On an 8-bit AVR, int is 16 bits.
        let ty = TypeDesc::parse("int", 2);
        assert_eq!(convert(i(70000), &ty).unwrap().as_i64().unwrap(), 4464);
        // On ESP32, int is 32 bits.
        let ty = TypeDesc::parse("int", 4);
        assert_eq!(convert(i(70000), &ty).unwrap().as_i64().unwrap(), 70000);
    }

    #[test]
    fn string_numeric_coercion() {
        let ty = TypeDesc::parse("int", 4);
        assert_eq!(convert(Value::Str("512".to_owned()), &ty).unwrap().as_i64().unwrap(), 512);
        let ty = TypeDesc::parse("String", 4);
        assert_eq!(convert(i(512), &ty).unwrap(), Value::Str("512".to_owned()));
    }

    #[test]
    fn string_concat() {
        let result = binary_op("+", &Value::Str("val: ".to_owned()), &i(7)).unwrap();
        assert_eq!(result, Value::Str("val: 7".to_owned()));
    }

    #[test]
    fn float_display_uses_two_decimals() {
        assert_eq!(Value::Float64(3.14159).display_text(), "3.14");
        assert_eq!(Value::Float32(1.5).display_text(), "1.50");
    }

    #[test]
    fn shift_masks_by_width() {
        let result = binary_op("<<", &i(1), &i(33)).unwrap();
        // Shift count wraps modulo 32 for 32-bit lanes.
        assert_eq!(result.as_i64().unwrap(), 2);
    }

    #[test]
    fn zero_array_shapes() {
        let elem = TypeDesc::parse("int", 4);
        let Value::Array(outer) = zero_array(&elem, &[2, 3]) else {
            panic!("expected array");
        };
        assert_eq!(outer.data.len(), 2);
        let Value::Array(inner) = &outer.data[0] else {
            panic!("expected nested array");
        };
        assert_eq!(inner.data.len(), 3);
    }
}
