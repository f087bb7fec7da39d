use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{VmError, VmResult};

/// Runtime value in the DNX VM
///
/// Values are primitives (int, double, string, undefined) or arrays.
/// Arrays are reference-shared: cloning a `Value::Array` clones the
/// handle, not the elements, so `SetArrayIndex` mutates the one buffer
/// every stack copy points at.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent / uninitialized value
    Undefined,

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit floating point number
    Double(f64),

    /// UTF-8 string
    String(String),

    /// Ordered sequence of values, mutable in place by index
    Array(Rc<RefCell<Vec<Value>>>),
}

impl Value {
    /// Build an array value from owned elements
    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    /// Check if this value is truthy (for jumps and choice guards)
    ///
    /// Numerics are truthy iff greater than zero; strings and arrays
    /// iff non-empty; undefined is falsey.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Int(i) => *i > 0,
            Value::Double(d) => *d > 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
        }
    }

    /// Get the type name of this value for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
        }
    }

    /// Try to extract an i32, accepting only the `Int` tag
    pub fn as_int(&self) -> VmResult<i32> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(VmError::type_error(format!(
                "expected int, got {}",
                other.type_name()
            ))),
        }
    }

    /// Try to extract an f64 from either numeric tag
    pub fn as_double(&self) -> VmResult<f64> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Double(d) => Ok(*d),
            other => Err(VmError::type_error(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }

    /// Try to extract a string slice
    pub fn as_str(&self) -> VmResult<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(VmError::type_error(format!(
                "expected string, got {}",
                other.type_name()
            ))),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    /// Numeric addition with promotion; string + string concatenates
    pub fn add(&self, rhs: &Value) -> VmResult<Value> {
        match (self, rhs) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{}{}", l, r))),
            _ => self.numeric_op(rhs, "add", |a, b| a.wrapping_add(b), |a, b| a + b),
        }
    }

    pub fn sub(&self, rhs: &Value) -> VmResult<Value> {
        self.numeric_op(rhs, "subtract", |a, b| a.wrapping_sub(b), |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Value) -> VmResult<Value> {
        self.numeric_op(rhs, "multiply", |a, b| a.wrapping_mul(b), |a, b| a * b)
    }

    /// Division. Integer division by zero is an explicit error; double
    /// division follows IEEE-754 and may yield infinities or NaN.
    pub fn div(&self, rhs: &Value) -> VmResult<Value> {
        if let (Value::Int(_), Value::Int(0)) = (self, rhs) {
            return Err(VmError::DivisionByZero);
        }
        self.numeric_op(rhs, "divide", |a, b| a.wrapping_div(b), |a, b| a / b)
    }

    pub fn rem(&self, rhs: &Value) -> VmResult<Value> {
        if let (Value::Int(_), Value::Int(0)) = (self, rhs) {
            return Err(VmError::DivisionByZero);
        }
        self.numeric_op(rhs, "modulo", |a, b| a.wrapping_rem(b), |a, b| a % b)
    }

    /// Exponentiation always promotes both operands to double
    pub fn pow(&self, rhs: &Value) -> VmResult<Value> {
        if !self.is_numeric() || !rhs.is_numeric() {
            return Err(VmError::type_error(format!(
                "cannot exponentiate {} and {}",
                self.type_name(),
                rhs.type_name()
            )));
        }
        Ok(Value::Double(self.as_double()?.powf(rhs.as_double()?)))
    }

    /// Arithmetic negation on either numeric tag
    pub fn neg(&self) -> VmResult<Value> {
        match self {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Double(d) => Ok(Value::Double(-d)),
            other => Err(VmError::type_error(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        }
    }

    /// Logical inversion: numerics invert their truthiness, strings and
    /// arrays report emptiness; undefined has no inversion.
    pub fn invert(&self) -> VmResult<Value> {
        match self {
            Value::Undefined => Err(VmError::type_error("cannot invert undefined")),
            v => Ok(Value::Int(if v.is_truthy() { 0 } else { 1 })),
        }
    }

    pub fn bit_and(&self, rhs: &Value) -> VmResult<Value> {
        self.int_op(rhs, "bitwise AND", |a, b| a & b)
    }

    pub fn bit_or(&self, rhs: &Value) -> VmResult<Value> {
        self.int_op(rhs, "bitwise OR", |a, b| a | b)
    }

    pub fn bit_xor(&self, rhs: &Value) -> VmResult<Value> {
        self.int_op(rhs, "bitwise XOR", |a, b| a ^ b)
    }

    pub fn bit_shl(&self, rhs: &Value) -> VmResult<Value> {
        self.int_op(rhs, "left shift", |a, b| a.wrapping_shl(b as u32))
    }

    pub fn bit_shr(&self, rhs: &Value) -> VmResult<Value> {
        self.int_op(rhs, "right shift", |a, b| a.wrapping_shr(b as u32))
    }

    pub fn bit_not(&self) -> VmResult<Value> {
        match self {
            Value::Int(i) => Ok(Value::Int(!i)),
            other => Err(VmError::type_error(format!(
                "cannot bitwise NOT {}",
                other.type_name()
            ))),
        }
    }

    /// Equality. Differing tags never compare equal; same-tag values
    /// compare by content (arrays element-wise).
    pub fn eq_value(&self, rhs: &Value) -> bool {
        match (self, rhs) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Int(l), Value::Int(r)) => l == r,
            (Value::Double(l), Value::Double(r)) => l == r,
            (Value::String(l), Value::String(r)) => l == r,
            (Value::Array(l), Value::Array(r)) => {
                if Rc::ptr_eq(l, r) {
                    return true;
                }
                let (l, r) = (l.borrow(), r.borrow());
                l.len() == r.len() && l.iter().zip(r.iter()).all(|(a, b)| a.eq_value(b))
            }
            _ => false,
        }
    }

    /// Ordering comparison; both sides must be numeric and promote.
    pub fn compare(&self, rhs: &Value) -> VmResult<std::cmp::Ordering> {
        if !self.is_numeric() || !rhs.is_numeric() {
            return Err(VmError::type_error(format!(
                "cannot order {} and {}",
                self.type_name(),
                rhs.type_name()
            )));
        }
        let (l, r) = (self.as_double()?, rhs.as_double()?);
        l.partial_cmp(&r)
            .ok_or_else(|| VmError::type_error("cannot order NaN"))
    }

    fn numeric_op(
        &self,
        rhs: &Value,
        verb: &str,
        int_op: fn(i32, i32) -> i32,
        double_op: fn(f64, f64) -> f64,
    ) -> VmResult<Value> {
        match (self, rhs) {
            (Value::Int(l), Value::Int(r)) => Ok(Value::Int(int_op(*l, *r))),
            (Value::Int(_), Value::Double(_))
            | (Value::Double(_), Value::Int(_))
            | (Value::Double(_), Value::Double(_)) => {
                Ok(Value::Double(double_op(self.as_double()?, rhs.as_double()?)))
            }
            _ => Err(VmError::type_error(format!(
                "cannot {} {} and {}",
                verb,
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }

    fn int_op(&self, rhs: &Value, verb: &str, op: fn(i32, i32) -> i32) -> VmResult<Value> {
        match (self, rhs) {
            (Value::Int(l), Value::Int(r)) => Ok(Value::Int(op(*l, *r))),
            _ => Err(VmError::type_error(format!(
                "cannot {} {} and {}",
                verb,
                self.type_name(),
                rhs.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    /// Rendering used by string interpolation: numerics in decimal,
    /// strings inline, undefined empty, arrays as sequence text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
