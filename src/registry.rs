// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.

//! Process-wide registries mapping class names to constructors and runtime
//! types to encoders.
//!
//! Registration is expected to happen during startup; once registration
//! quiesces, any number of encoders and decoders can consult the registries
//! concurrently.  Registering a pair or type again replaces the previous
//! entry; there is no unregistration.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use num_complex::Complex64;
use once_cell::sync::Lazy;

use crate::error::Result;
use crate::objects::{self, Object};
use crate::ser::Emitter;
use crate::value::Value;

/// Builds a value from the argument tuple of a REDUCE or NEWOBJ opcode.
///
/// Implemented by any `Fn(Vec<Value>) -> Result<Value>` closure, so most
/// constructors need no dedicated type.
pub trait ObjectConstructor: Send + Sync {
    fn construct(&self, args: Vec<Value>) -> Result<Value>;
}

impl<F> ObjectConstructor for F
    where F: Fn(Vec<Value>) -> Result<Value> + Send + Sync
{
    fn construct(&self, args: Vec<Value>) -> Result<Value> {
        self(args)
    }
}

/// Breaks an object into a class name and a constructor argument list,
/// encoded as GLOBAL + args + REDUCE.
pub trait ObjectDeconstructor: Send + Sync {
    /// Module part of the class reference to emit.
    fn module(&self) -> &str;
    /// Name part of the class reference to emit.
    fn name(&self) -> &str;
    /// The arguments the class will be called with when decoding.
    fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>>;
}

/// Writes an object's full pickle representation itself, via the emitter.
///
/// This is the low-level alternative to a deconstructor for types whose
/// encoding is not a plain constructor call.
pub trait ObjectPickler: Send + Sync {
    fn pickle(&self, obj: &dyn Object, emitter: &mut dyn Emitter) -> Result<()>;
}

type ConstructorMap = HashMap<(String, String), Arc<dyn ObjectConstructor>>;
type PicklerMap = HashMap<TypeId, Arc<dyn ObjectPickler>>;
type DeconstructorMap = HashMap<TypeId, Arc<dyn ObjectDeconstructor>>;

static CONSTRUCTORS: Lazy<RwLock<ConstructorMap>> =
    Lazy::new(|| RwLock::new(default_constructors()));
static PICKLERS: Lazy<RwLock<PicklerMap>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static DECONSTRUCTORS: Lazy<RwLock<DeconstructorMap>> =
    Lazy::new(|| RwLock::new(default_deconstructors()));

/// Register a constructor for the given `(module, name)` class pair.
pub fn register_constructor(module: &str, name: &str,
                            constructor: Arc<dyn ObjectConstructor>) {
    CONSTRUCTORS.write().unwrap_or_else(PoisonError::into_inner)
        .insert((module.to_owned(), name.to_owned()), constructor);
}

/// Register a custom pickler for objects of exactly the type `T`.
///
/// A pickler takes precedence over a deconstructor registered for the
/// same type.
pub fn register_pickler<T: Object>(pickler: Arc<dyn ObjectPickler>) {
    PICKLERS.write().unwrap_or_else(PoisonError::into_inner)
        .insert(TypeId::of::<T>(), pickler);
}

/// Register a deconstructor for objects of exactly the type `T`.
pub fn register_deconstructor<T: Object>(deconstructor: Arc<dyn ObjectDeconstructor>) {
    DECONSTRUCTORS.write().unwrap_or_else(PoisonError::into_inner)
        .insert(TypeId::of::<T>(), deconstructor);
}

pub(crate) fn find_constructor(module: &str, name: &str)
                               -> Option<Arc<dyn ObjectConstructor>> {
    CONSTRUCTORS.read().unwrap_or_else(PoisonError::into_inner)
        .get(&(module.to_owned(), name.to_owned())).cloned()
}

pub(crate) fn find_pickler(tid: TypeId) -> Option<Arc<dyn ObjectPickler>> {
    PICKLERS.read().unwrap_or_else(PoisonError::into_inner).get(&tid).cloned()
}

pub(crate) fn find_deconstructor(tid: TypeId) -> Option<Arc<dyn ObjectDeconstructor>> {
    DECONSTRUCTORS.read().unwrap_or_else(PoisonError::into_inner).get(&tid).cloned()
}

fn default_constructors() -> ConstructorMap {
    let mut map = ConstructorMap::new();
    let mut add = |module: &str, name: &str, ctor: fn(Vec<Value>) -> Result<Value>| {
        map.insert((module.to_owned(), name.to_owned()),
                   Arc::new(ctor) as Arc<dyn ObjectConstructor>);
    };
    // Python 2 and 3 use different module names for the builtins.
    for module in &["__builtin__", "builtins"] {
        add(module, "set", objects::construct_set);
        add(module, "frozenset", objects::construct_frozenset);
        add(module, "bytearray", objects::construct_bytes);
        add(module, "bytes", objects::construct_bytes);
        add(module, "complex", objects::construct_complex);
    }
    add("_codecs", "encode", objects::construct_encoded);
    add("datetime", "datetime", objects::construct_datetime);
    add("datetime", "date", objects::construct_date);
    add("datetime", "time", objects::construct_time);
    add("datetime", "timedelta", objects::construct_timedelta);
    add("decimal", "Decimal", objects::construct_decimal);
    add("pytz", "timezone", objects::construct_timezone);
    add("pytz", "_UTC", objects::construct_utc);
    add("pytz", "UTC", objects::construct_utc);
    map
}

fn default_deconstructors() -> DeconstructorMap {
    let mut map = DeconstructorMap::new();
    map.insert(TypeId::of::<NaiveDateTime>(),
               Arc::new(objects::DateTimeDeconstructor) as Arc<dyn ObjectDeconstructor>);
    map.insert(TypeId::of::<NaiveDate>(),
               Arc::new(objects::DateDeconstructor) as Arc<dyn ObjectDeconstructor>);
    map.insert(TypeId::of::<NaiveTime>(),
               Arc::new(objects::TimeDeconstructor) as Arc<dyn ObjectDeconstructor>);
    map.insert(TypeId::of::<Duration>(),
               Arc::new(objects::TimeDeltaDeconstructor) as Arc<dyn ObjectDeconstructor>);
    map.insert(TypeId::of::<Complex64>(),
               Arc::new(objects::ComplexDeconstructor) as Arc<dyn ObjectDeconstructor>);
    map
}
