// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.

//! The object extension point, and the built-in value mappings for
//! date/time, complex and decimal values.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use num_complex::Complex64;
use num_traits::ToPrimitive;

use crate::error::{Error, ErrorCode, Result};
use crate::registry::ObjectDeconstructor;
use crate::value::{HashableValue, Value};

/// Trait for types that can live inside a `Value` graph without a native
/// `Value` representation.
///
/// Implementors get encoding support through a registered pickler or
/// deconstructor (see the `registry` module), or through the opt-in
/// attribute capability below.  Decoding support comes from a registered
/// constructor producing the type.
pub trait Object: Any + fmt::Debug + Send + Sync {
    /// Name of the concrete type, used in error messages.
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn clone_box(&self) -> Box<dyn Object>;

    /// Equality against another object of any registered type.
    fn object_eq(&self, other: &dyn Object) -> bool;

    /// Apply state from a BUILD opcode.  The default rejects state.
    fn set_state(&mut self, state: Value) -> Result<()> {
        let _ = state;
        Err(Error::Syntax(ErrorCode::StateNotSupported(self.type_name())))
    }

    /// Class name for the attribute-dict fallback encoding.  Types that
    /// return `Some` here and from `attributes` opt into being encoded as a
    /// plain dict with a `__class__` key when no pickler or deconstructor
    /// is registered for them.
    fn class_name(&self) -> Option<String> { None }

    /// Attribute list for the attribute-dict fallback encoding.
    fn attributes(&self) -> Option<Vec<(String, Value)>> { None }
}

impl dyn Object {
    pub fn downcast_ref<T: Object>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Object>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Implements the `Object` boilerplate for a foreign type that already has
/// `Clone`, `Debug` and `PartialEq`.
macro_rules! impl_object {
    ($ty:ty) => {
        impl Object for $ty {
            fn type_name(&self) -> &'static str { std::any::type_name::<$ty>() }
            fn as_any(&self) -> &dyn Any { self }
            fn clone_box(&self) -> Box<dyn Object> { Box::new(self.clone()) }
            fn object_eq(&self, other: &dyn Object) -> bool {
                other.downcast_ref::<$ty>().map_or(false, |other| self == other)
            }
        }
    };
}

impl_object!(Complex64);
impl_object!(NaiveDateTime);
impl_object!(NaiveDate);
impl_object!(NaiveTime);
impl_object!(Duration);

/// Placeholder for instances of classes without a registered constructor.
///
/// It mimics an attribute dictionary: BUILD state is merged into the
/// attribute map, and re-encoding goes through the attribute-dict fallback,
/// so unknown objects survive a decode/encode round trip as dicts.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassDict {
    class: String,
    attrs: BTreeMap<String, Value>,
}

impl ClassDict {
    pub fn new(module: &str, name: &str) -> ClassDict {
        let class = if module.is_empty() { name.to_owned() }
                    else { format!("{}.{}", module, name) };
        ClassDict { class, attrs: BTreeMap::new() }
    }

    /// Fully qualified name of the class this stands in for.
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    pub fn set(&mut self, attr: &str, value: Value) {
        self.attrs.insert(attr.to_owned(), value);
    }

    fn merge(&mut self, dict: BTreeMap<HashableValue, Value>) -> Result<()> {
        for (key, value) in dict {
            let key = match key {
                HashableValue::String(s) => s,
                HashableValue::Bytes(b) => String::from_utf8(b).map_err(
                    |_| Error::Syntax(ErrorCode::StringNotUTF8))?,
                other => return construction(format!(
                    "attribute name for {} must be a string, got {}", self.class, other)),
            };
            self.attrs.insert(key, value);
        }
        Ok(())
    }
}

impl Object for ClassDict {
    fn type_name(&self) -> &'static str { "ClassDict" }
    fn as_any(&self) -> &dyn Any { self }
    fn clone_box(&self) -> Box<dyn Object> { Box::new(self.clone()) }
    fn object_eq(&self, other: &dyn Object) -> bool {
        other.downcast_ref::<ClassDict>().map_or(false, |other| self == other)
    }

    // State is either an attribute dict or a (dict, dict) pair of instance
    // and slot attributes.
    fn set_state(&mut self, state: Value) -> Result<()> {
        match state {
            Value::Dict(dict) => self.merge(dict),
            Value::Tuple(parts) => {
                for part in parts {
                    match part {
                        Value::None => {}
                        Value::Dict(dict) => self.merge(dict)?,
                        other => return construction(format!(
                            "state for {} must consist of dicts, got {}", self.class, other)),
                    }
                }
                Ok(())
            }
            other => construction(format!(
                "state for {} must be a dict, got {}", self.class, other)),
        }
    }

    fn class_name(&self) -> Option<String> {
        Some(self.class.clone())
    }

    fn attributes(&self) -> Option<Vec<(String, Value)>> {
        Some(self.attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// An opaque timezone reference, as produced by `pytz.timezone(name)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timezone {
    pub name: String,
}

impl Timezone {
    pub fn new(name: impl Into<String>) -> Timezone {
        Timezone { name: name.into() }
    }

    pub fn utc() -> Timezone {
        Timezone::new("UTC")
    }
}

impl_object!(Timezone);

fn construction<T>(msg: String) -> Result<T> {
    Err(Error::Syntax(ErrorCode::Construction(msg)))
}

fn int_arg(what: &str, arg: &Value) -> Result<i64> {
    match *arg {
        Value::I64(i) => Ok(i),
        Value::Int(ref i) => match i.to_i64() {
            Some(i) => Ok(i),
            None => construction(format!("{}: integer argument out of range", what)),
        },
        ref other => construction(format!("{}: expected an integer, got {}", what, other)),
    }
}

fn float_arg(what: &str, arg: &Value) -> Result<f64> {
    match *arg {
        Value::F64(f) => Ok(f),
        Value::I64(i) => Ok(i as f64),
        Value::Int(ref i) => match i.to_f64() {
            Some(f) => Ok(f),
            None => construction(format!("{}: number out of float range", what)),
        },
        ref other => construction(format!("{}: expected a number, got {}", what, other)),
    }
}

// The datetime module pickles datetime/date/time values either as a packed
// big-endian byte string (protocol 2+, possibly disguised as a latin-1
// text string) or as a tuple of integer fields (older pickles).
fn packed_arg(arg: &Value) -> Option<Vec<u8>> {
    match *arg {
        Value::Bytes(ref b) => Some(b.clone()),
        Value::String(ref s) => Some(s.chars().map(|ch| ch as u8).collect()),
        _ => None,
    }
}

fn in_u32(v: i64) -> Option<u32> {
    if v >= 0 && v <= u32::max_value() as i64 { Some(v as u32) } else { None }
}

fn make_date(what: &str, year: i64, month: i64, day: i64) -> Result<NaiveDate> {
    let date = match (in_u32(month), in_u32(day)) {
        (Some(m), Some(d)) => NaiveDate::from_ymd_opt(year as i32, m, d),
        _ => None,
    };
    match date {
        Some(date) => Ok(date),
        None => construction(format!("{}: date {}-{}-{} out of range",
                                     what, year, month, day)),
    }
}

fn make_time(what: &str, hour: i64, minute: i64, second: i64, micro: i64)
             -> Result<NaiveTime> {
    let time = match (in_u32(hour), in_u32(minute), in_u32(second), in_u32(micro)) {
        (Some(h), Some(m), Some(s), Some(us)) => NaiveTime::from_hms_micro_opt(h, m, s, us),
        _ => None,
    };
    match time {
        Some(time) => Ok(time),
        None => construction(format!("{}: time {}:{}:{}.{} out of range",
                                     what, hour, minute, second, micro)),
    }
}

pub(crate) fn construct_datetime(mut args: Vec<Value>) -> Result<Value> {
    // A trailing tzinfo argument is accepted but not represented; the
    // result stays naive.
    match args.len() {
        1 | 2 => {
            let packed = match packed_arg(&args[0]) {
                Some(packed) => packed,
                None => return construction(
                    format!("datetime: expected packed bytes, got {}", args[0])),
            };
            if packed.len() != 10 {
                return construction(format!(
                    "datetime: packed form must be 10 bytes, got {}", packed.len()));
            }
            let year = (packed[0] as i64) << 8 | packed[1] as i64;
            let micro = (packed[7] as i64) << 16 | (packed[8] as i64) << 8 | packed[9] as i64;
            let date = make_date("datetime", year, packed[2] as i64, packed[3] as i64)?;
            let time = make_time("datetime", packed[4] as i64, packed[5] as i64,
                                 packed[6] as i64, micro)?;
            Ok(Value::Object(Box::new(NaiveDateTime::new(date, time))))
        }
        7 | 8 => {
            args.truncate(7);
            let mut fields = [0i64; 7];
            for (field, arg) in fields.iter_mut().zip(&args) {
                *field = int_arg("datetime", arg)?;
            }
            let date = make_date("datetime", fields[0], fields[1], fields[2])?;
            let time = make_time("datetime", fields[3], fields[4], fields[5], fields[6])?;
            Ok(Value::Object(Box::new(NaiveDateTime::new(date, time))))
        }
        n => construction(format!("datetime: expected 1, 2, 7 or 8 arguments, got {}", n)),
    }
}

pub(crate) fn construct_date(args: Vec<Value>) -> Result<Value> {
    match args.len() {
        1 => {
            let packed = match packed_arg(&args[0]) {
                Some(packed) => packed,
                None => return construction(
                    format!("date: expected packed bytes, got {}", args[0])),
            };
            if packed.len() != 4 {
                return construction(format!(
                    "date: packed form must be 4 bytes, got {}", packed.len()));
            }
            let year = (packed[0] as i64) << 8 | packed[1] as i64;
            let date = make_date("date", year, packed[2] as i64, packed[3] as i64)?;
            Ok(Value::Object(Box::new(date)))
        }
        3 => {
            let year = int_arg("date", &args[0])?;
            let month = int_arg("date", &args[1])?;
            let day = int_arg("date", &args[2])?;
            Ok(Value::Object(Box::new(make_date("date", year, month, day)?)))
        }
        n => construction(format!("date: expected 1 or 3 arguments, got {}", n)),
    }
}

pub(crate) fn construct_time(args: Vec<Value>) -> Result<Value> {
    match args.len() {
        1 => {
            let packed = match packed_arg(&args[0]) {
                Some(packed) => packed,
                None => return construction(
                    format!("time: expected packed bytes, got {}", args[0])),
            };
            if packed.len() != 6 {
                return construction(format!(
                    "time: packed form must be 6 bytes, got {}", packed.len()));
            }
            let micro = (packed[3] as i64) << 16 | (packed[4] as i64) << 8 | packed[5] as i64;
            let time = make_time("time", packed[0] as i64, packed[1] as i64,
                                 packed[2] as i64, micro)?;
            Ok(Value::Object(Box::new(time)))
        }
        4 => {
            let hour = int_arg("time", &args[0])?;
            let minute = int_arg("time", &args[1])?;
            let second = int_arg("time", &args[2])?;
            let micro = int_arg("time", &args[3])?;
            Ok(Value::Object(Box::new(make_time("time", hour, minute, second, micro)?)))
        }
        n => construction(format!("time: expected 1 or 4 arguments, got {}", n)),
    }
}

pub(crate) fn construct_timedelta(args: Vec<Value>) -> Result<Value> {
    if args.len() != 3 {
        return construction(format!("timedelta: expected 3 arguments, got {}", args.len()));
    }
    let days = int_arg("timedelta", &args[0])?;
    let seconds = int_arg("timedelta", &args[1])?;
    let micros = int_arg("timedelta", &args[2])?;
    let total = days.checked_mul(86_400_000_000)
        .and_then(|t| seconds.checked_mul(1_000_000).and_then(|s| t.checked_add(s)))
        .and_then(|t| t.checked_add(micros));
    match total {
        Some(total) => Ok(Value::Object(Box::new(Duration::microseconds(total)))),
        None => construction(format!("timedelta: ({}, {}, {}) out of range",
                                     days, seconds, micros)),
    }
}

pub(crate) fn construct_complex(args: Vec<Value>) -> Result<Value> {
    if args.len() != 2 {
        return construction(format!("complex: expected 2 arguments, got {}", args.len()));
    }
    let re = float_arg("complex", &args[0])?;
    let im = float_arg("complex", &args[1])?;
    Ok(Value::Object(Box::new(Complex64::new(re, im))))
}

pub(crate) fn construct_set(args: Vec<Value>) -> Result<Value> {
    collect_set("set", args).map(Value::Set)
}

pub(crate) fn construct_frozenset(args: Vec<Value>) -> Result<Value> {
    collect_set("frozenset", args).map(Value::FrozenSet)
}

fn collect_set(what: &str, mut args: Vec<Value>) -> Result<BTreeSet<HashableValue>> {
    if args.len() != 1 {
        return construction(format!("{}: expected 1 argument, got {}", what, args.len()));
    }
    match args.remove(0) {
        Value::List(items) | Value::Tuple(items) =>
            items.into_iter().map(Value::into_hashable).collect(),
        other => construction(format!("{}: expected a sequence, got {}", what, other)),
    }
}

// Matches the protocol-2 shape for byte strings: bytearray(text, "latin-1")
// with every byte mapped to the equal code point.  Integer lists and plain
// byte arguments occur in older pickles.
pub(crate) fn construct_bytes(mut args: Vec<Value>) -> Result<Value> {
    match args.len() {
        0 => Ok(Value::Bytes(vec![])),
        1 => match args.remove(0) {
            Value::Bytes(b) => Ok(Value::Bytes(b)),
            Value::String(s) => Ok(Value::Bytes(latin1_bytes("bytearray", &s)?)),
            Value::List(items) => {
                let mut bytes = Vec::with_capacity(items.len());
                for item in &items {
                    let b = int_arg("bytearray", item)?;
                    if b < 0 || b > 255 {
                        return construction(format!("bytearray: byte {} out of range", b));
                    }
                    bytes.push(b as u8);
                }
                Ok(Value::Bytes(bytes))
            }
            other => construction(format!("bytearray: unsupported argument {}", other)),
        },
        2 => {
            let encoding = args.remove(1);
            match (args.remove(0), encoding) {
                (Value::String(s), Value::String(enc)) => {
                    if !enc.starts_with("latin-") && enc != "latin1" {
                        return construction(format!(
                            "bytearray: unsupported encoding {:?}", enc));
                    }
                    Ok(Value::Bytes(latin1_bytes("bytearray", &s)?))
                }
                (data, enc) => construction(format!(
                    "bytearray: unsupported arguments ({}, {})", data, enc)),
            }
        }
        n => construction(format!("bytearray: expected 0, 1 or 2 arguments, got {}", n)),
    }
}

pub(crate) fn construct_encoded(mut args: Vec<Value>) -> Result<Value> {
    match args.len() {
        1 => match args.remove(0) {
            Value::String(s) => Ok(Value::Bytes(latin1_bytes("_codecs.encode", &s)?)),
            other => construction(format!("_codecs.encode: expected text, got {}", other)),
        },
        2 => {
            let encoding = args.remove(1);
            match (args.remove(0), encoding) {
                (Value::String(s), Value::String(enc)) => {
                    if !enc.starts_with("latin-") && enc != "latin1" {
                        return construction(format!(
                            "_codecs.encode: unsupported encoding {:?}", enc));
                    }
                    Ok(Value::Bytes(latin1_bytes("_codecs.encode", &s)?))
                }
                (data, enc) => construction(format!(
                    "_codecs.encode: unsupported arguments ({}, {})", data, enc)),
            }
        }
        n => construction(format!("_codecs.encode: expected 1 or 2 arguments, got {}", n)),
    }
}

fn latin1_bytes(what: &str, s: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(s.len());
    for ch in s.chars() {
        if ch as u32 > 0xff {
            return construction(format!("{}: non-latin-1 character {:?}", what, ch));
        }
        bytes.push(ch as u8);
    }
    Ok(bytes)
}

// Decimals map to floats, with the textual "NaN" becoming a float NaN.
// Registered like any other constructor, so the mapping can be overridden.
pub(crate) fn construct_decimal(mut args: Vec<Value>) -> Result<Value> {
    if args.len() != 1 {
        return construction(format!("Decimal: expected 1 argument, got {}", args.len()));
    }
    match args.remove(0) {
        Value::String(s) => {
            if s.eq_ignore_ascii_case("nan") {
                return Ok(Value::F64(std::f64::NAN));
            }
            match s.parse::<f64>() {
                Ok(f) => Ok(Value::F64(f)),
                Err(_) => construction(format!("Decimal: invalid literal {:?}", s)),
            }
        }
        Value::I64(i) => Ok(Value::F64(i as f64)),
        Value::F64(f) => Ok(Value::F64(f)),
        other => construction(format!("Decimal: unsupported argument {}", other)),
    }
}

pub(crate) fn construct_timezone(mut args: Vec<Value>) -> Result<Value> {
    if args.len() != 1 {
        return construction(format!("timezone: expected 1 argument, got {}", args.len()));
    }
    match args.remove(0) {
        Value::String(name) => Ok(Value::Object(Box::new(Timezone::new(name)))),
        other => construction(format!("timezone: expected a name, got {}", other)),
    }
}

pub(crate) fn construct_utc(args: Vec<Value>) -> Result<Value> {
    if !args.is_empty() {
        return construction(format!("UTC: expected no arguments, got {}", args.len()));
    }
    Ok(Value::Object(Box::new(Timezone::utc())))
}

fn expect<'a, T: Object>(obj: &'a dyn Object, what: &str) -> Result<&'a T> {
    match obj.downcast_ref::<T>() {
        Some(obj) => Ok(obj),
        None => construction(format!("{} deconstructor applied to {}", what, obj.type_name())),
    }
}

pub(crate) struct DateTimeDeconstructor;

impl ObjectDeconstructor for DateTimeDeconstructor {
    fn module(&self) -> &str { "datetime" }
    fn name(&self) -> &str { "datetime" }
    fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>> {
        let dt = expect::<NaiveDateTime>(obj, "datetime")?;
        Ok(vec![
            Value::I64(dt.year() as i64),
            Value::I64(dt.month() as i64),
            Value::I64(dt.day() as i64),
            Value::I64(dt.hour() as i64),
            Value::I64(dt.minute() as i64),
            Value::I64(dt.second() as i64),
            Value::I64((dt.nanosecond() / 1000) as i64),
        ])
    }
}

pub(crate) struct DateDeconstructor;

impl ObjectDeconstructor for DateDeconstructor {
    fn module(&self) -> &str { "datetime" }
    fn name(&self) -> &str { "date" }
    fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>> {
        let date = expect::<NaiveDate>(obj, "date")?;
        Ok(vec![
            Value::I64(date.year() as i64),
            Value::I64(date.month() as i64),
            Value::I64(date.day() as i64),
        ])
    }
}

pub(crate) struct TimeDeconstructor;

impl ObjectDeconstructor for TimeDeconstructor {
    fn module(&self) -> &str { "datetime" }
    fn name(&self) -> &str { "time" }
    fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>> {
        let time = expect::<NaiveTime>(obj, "time")?;
        Ok(vec![
            Value::I64(time.hour() as i64),
            Value::I64(time.minute() as i64),
            Value::I64(time.second() as i64),
            Value::I64((time.nanosecond() / 1000) as i64),
        ])
    }
}

pub(crate) struct TimeDeltaDeconstructor;

impl ObjectDeconstructor for TimeDeltaDeconstructor {
    fn module(&self) -> &str { "datetime" }
    fn name(&self) -> &str { "timedelta" }
    fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>> {
        let delta = expect::<Duration>(obj, "timedelta")?;
        let total = match delta.num_microseconds() {
            Some(total) => total,
            None => return construction("timedelta out of microsecond range".into()),
        };
        // Python normalizes so that seconds and microseconds are
        // non-negative, with days carrying the sign.
        let days = total.div_euclid(86_400_000_000);
        let rest = total.rem_euclid(86_400_000_000);
        Ok(vec![
            Value::I64(days),
            Value::I64(rest / 1_000_000),
            Value::I64(rest % 1_000_000),
        ])
    }
}

pub(crate) struct ComplexDeconstructor;

impl ObjectDeconstructor for ComplexDeconstructor {
    fn module(&self) -> &str { "__builtin__" }
    fn name(&self) -> &str { "complex" }
    fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>> {
        let c = expect::<Complex64>(obj, "complex")?;
        Ok(vec![Value::F64(c.re), Value::F64(c.im)])
    }
}
