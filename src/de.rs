// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle decoding
//!
//! Note: Pickles are not a declarative format, but a program for a stack-based
//! VM.  Each value that is decoded is simply put on the stack, and some
//! operations pop items from the stack and construct new data with them.
//!
//! The memo table doubles as the arena for shared and cyclic data: a memo
//! opcode moves the top of stack into the table and leaves a `Value::Ref` with
//! the table id in its place, and a GET pushes such a `Ref`.  Opcodes that
//! mutate a container below the mark follow `Ref` chains into the table, so
//! batched APPENDS/SETITEMS work on the real container.  At STOP, the
//! remaining references are resolved against the table; only references that
//! point back into a value currently being resolved stay `Ref`s, which keeps
//! cycles representable.

use std::io;
use std::mem;
use std::str;
use std::char;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use iter_read::IterRead;

use crate::error::{Error, ErrorCode, Result};
use crate::consts::*;
use crate::objects::ClassDict;
use crate::registry;
use crate::value::{Value, HashableValue};

/// Hook resolving persistent ids (see `DeOptions::persistent_load`).
pub type PersistentLoadFn = Box<dyn Fn(Value) -> Result<Value>>;

/// Options for decoding.
#[derive(Default)]
pub struct DeOptions {
    decode_strings: bool,
    persistent_load: Option<PersistentLoadFn>,
}

impl DeOptions {
    pub fn new() -> Self { Self::default() }

    /// Decode Python 2 byte strings (STRING opcodes) as text instead of
    /// `Value::Bytes`.
    pub fn decode_strings(mut self) -> Self {
        self.decode_strings = true;
        self
    }

    /// Install a persistent-load hook, called with the persistent id for
    /// every persistent reference in the stream.
    pub fn persistent_load<F>(mut self, hook: F) -> Self
        where F: Fn(Value) -> Result<Value> + 'static
    {
        self.persistent_load = Some(Box::new(hook));
        self
    }
}

/// Decodes pickle streams into values.
pub struct Unpickler<R> {
    rdr: R,
    pos: usize,
    stack: Vec<Value>,
    stacks: Vec<Vec<Value>>,
    memo: HashMap<u32, Value>,
    options: DeOptions,
}

impl<R: io::Read> Unpickler<R> {
    pub fn new(rdr: R, options: DeOptions) -> Unpickler<R> {
        Unpickler {
            rdr,
            pos: 0,
            stack: Vec::with_capacity(128),
            stacks: Vec::with_capacity(16),
            memo: HashMap::new(),
            options,
        }
    }

    /// Assert that the whole stream has been consumed.
    pub fn end(&mut self) -> Result<()> {
        let mut buf = [0u8];
        match self.rdr.read(&mut buf) {
            Ok(0) => Ok(()),
            Ok(_) => self.error(ErrorCode::TrailingBytes),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Decode one complete value from the stream.
    pub fn parse(&mut self) -> Result<Value> {
        loop {
            match self.read_byte()? {
                // Specials
                STOP => {
                    let value = self.pop()?;
                    if !self.stack.is_empty() || !self.stacks.is_empty() {
                        return self.error(ErrorCode::StackNotEmpty);
                    }
                    return self.resolve_deep(value, &mut BTreeSet::new());
                }
                POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                POP_MARK => { self.pop_mark()?; }
                DUP => { let top = self.top()?.clone(); self.stack.push(top); }
                MARK => {
                    let stack = mem::replace(&mut self.stack, Vec::with_capacity(128));
                    self.stacks.push(stack);
                }
                PROTO => {
                    // Ignore this, as the opcodes determine what we support.
                    self.read_byte()?;
                }
                FRAME => {
                    // We'll ignore framing.  But we still have to gobble up the length.
                    self.read_bytes(8)?;
                }

                // Memo ops
                PUT => {
                    let line = self.read_line()?;
                    let id = self.parse_memo_id(&line)?;
                    self.memoize(id)?;
                }
                BINPUT => {
                    let id = self.read_byte()? as u32;
                    self.memoize(id)?;
                }
                LONG_BINPUT => {
                    let bytes = self.read_bytes(4)?;
                    self.memoize(LittleEndian::read_u32(&bytes))?;
                }
                MEMOIZE => {
                    let id = self.memo.len() as u32;
                    self.memoize(id)?;
                }
                GET => {
                    let line = self.read_line()?;
                    let id = self.parse_memo_id(&line)?;
                    self.push_memo_ref(id)?;
                }
                BINGET => {
                    let id = self.read_byte()? as u32;
                    self.push_memo_ref(id)?;
                }
                LONG_BINGET => {
                    let bytes = self.read_bytes(4)?;
                    self.push_memo_ref(LittleEndian::read_u32(&bytes))?;
                }

                // Singletons
                NONE => self.stack.push(Value::None),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                NEWTRUE => self.stack.push(Value::Bool(true)),

                // ASCII-formatted numbers
                INT => {
                    let line = self.read_line()?;
                    // Handle protocol 1 way of spelling true/false
                    if line == b"00" {
                        self.stack.push(Value::Bool(false))
                    } else if line == b"01" {
                        self.stack.push(Value::Bool(true))
                    } else {
                        match str::from_utf8(&line).unwrap_or("").parse::<i64>() {
                            Ok(i)  => self.stack.push(Value::I64(i)),
                            Err(_) => return self.error(ErrorCode::InvalidLiteral(line))
                        }
                    }
                }
                LONG => {
                    let mut line = self.read_line()?;
                    // Remove "L" suffix.
                    if line.last() == Some(&b'L') { line.pop(); }
                    match BigInt::parse_bytes(&line, 10) {
                        Some(i)  => self.stack.push(int_value(i)),
                        None => return self.error(ErrorCode::InvalidLiteral(line))
                    }
                }
                FLOAT => {
                    let line = self.read_line()?;
                    match str::from_utf8(&line).unwrap_or("").parse::<f64>() {
                        Ok(f)  => self.stack.push(Value::F64(f)),
                        Err(_) => return self.error(ErrorCode::InvalidLiteral(line))
                    }
                }

                // Until-EOL strings
                STRING => {
                    let line = self.read_line()?;
                    // Remove quotes.
                    let slice = if line.len() >= 2 && line[0] == line[line.len() - 1] &&
                        (line[0] == b'"' || line[0] == b'\'') {
                            &line[1..line.len() - 1]
                        } else { &line };
                    let string = self.decode_escaped_string(slice)?;
                    self.stack.push(string);
                }
                UNICODE => {
                    let line = self.read_line()?;
                    let string = self.decode_escaped_unicode(&line)?;
                    self.stack.push(string);
                }

                // Binary-coded numbers
                BINFLOAT => {
                    let bytes = self.read_bytes(8)?;
                    self.stack.push(Value::F64(BigEndian::read_f64(&bytes)));
                }
                BININT => {
                    let bytes = self.read_bytes(4)?;
                    self.stack.push(Value::I64(LittleEndian::read_i32(&bytes) as i64));
                }
                BININT1 => {
                    let byte = self.read_byte()?;
                    self.stack.push(Value::I64(byte as i64));
                }
                BININT2 => {
                    let bytes = self.read_bytes(2)?;
                    self.stack.push(Value::I64(LittleEndian::read_u16(&bytes) as i64));
                }

                // Length-prefixed longs
                LONG1 => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(decode_long(bytes));
                }
                LONG4 => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    self.stack.push(decode_long(bytes));
                }

                // Length-prefixed (byte)strings
                SHORT_BINBYTES => {
                    let string = self.read_u8_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(string));
                }
                BINBYTES => {
                    let string = self.read_u32_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(string));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let string = self.read_u64_prefixed_bytes()?;
                    self.stack.push(Value::Bytes(string));
                }
                SHORT_BINSTRING => {
                    let string = self.read_u8_prefixed_bytes()?;
                    let decoded = self.decode_string(string)?;
                    self.stack.push(decoded);
                }
                BINSTRING => {
                    let string = self.read_i32_prefixed_bytes()?;
                    let decoded = self.decode_string(string)?;
                    self.stack.push(decoded);
                }
                SHORT_BINUNICODE => {
                    let string = self.read_u8_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }
                BINUNICODE => {
                    let string = self.read_u32_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }
                BINUNICODE8 => {
                    let string = self.read_u64_prefixed_bytes()?;
                    let decoded = self.decode_unicode(string)?;
                    self.stack.push(decoded);
                }

                // Containers
                EMPTY_TUPLE => self.stack.push(Value::Tuple(vec![])),
                TUPLE1 => {
                    let item = self.pop()?;
                    self.stack.push(Value::Tuple(vec![item]));
                }
                TUPLE2 => {
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::Tuple(vec![item1, item2]));
                }
                TUPLE3 => {
                    let item3 = self.pop()?;
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    self.stack.push(Value::Tuple(vec![item1, item2, item3]));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                EMPTY_LIST => self.stack.push(Value::List(vec![])),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                APPEND => {
                    let pos = self.pos;
                    let value = self.pop()?;
                    let top = self.top_container()?;
                    if let Value::List(ref mut list) = *top {
                        list.push(value);
                    } else {
                        return Err(Error::Eval(ErrorCode::InvalidStackTop(
                            "list", format!("{}", top)), pos));
                    }
                }
                APPENDS => {
                    let pos = self.pos;
                    let items = self.pop_mark()?;
                    let top = self.top_container()?;
                    if let Value::List(ref mut list) = *top {
                        list.extend(items);
                    } else {
                        return Err(Error::Eval(ErrorCode::InvalidStackTop(
                            "list", format!("{}", top)), pos));
                    }
                }
                EMPTY_DICT => self.stack.push(Value::Dict(BTreeMap::new())),
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = self.make_pairs(items)?;
                    self.stack.push(Value::Dict(pairs.into_iter().collect()));
                }
                SETITEM => {
                    let pos = self.pos;
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let key = self.make_hashable(key)?;
                    let top = self.top_container()?;
                    if let Value::Dict(ref mut dict) = *top {
                        dict.insert(key, value);
                    } else {
                        return Err(Error::Eval(ErrorCode::InvalidStackTop(
                            "dict", format!("{}", top)), pos));
                    }
                }
                SETITEMS => {
                    let pos = self.pos;
                    let items = self.pop_mark()?;
                    let pairs = self.make_pairs(items)?;
                    let top = self.top_container()?;
                    if let Value::Dict(ref mut dict) = *top {
                        dict.extend(pairs);
                    } else {
                        return Err(Error::Eval(ErrorCode::InvalidStackTop(
                            "dict", format!("{}", top)), pos));
                    }
                }
                EMPTY_SET => self.stack.push(Value::Set(BTreeSet::new())),
                FROZENSET => {
                    let items = self.pop_mark()?;
                    let mut set = BTreeSet::new();
                    for item in items {
                        set.insert(self.make_hashable(item)?);
                    }
                    self.stack.push(Value::FrozenSet(set));
                }
                ADDITEMS => {
                    let pos = self.pos;
                    let items = self.pop_mark()?;
                    let mut hashed = Vec::with_capacity(items.len());
                    for item in items {
                        hashed.push(self.make_hashable(item)?);
                    }
                    let top = self.top_container()?;
                    if let Value::Set(ref mut set) = *top {
                        set.extend(hashed);
                    } else {
                        return Err(Error::Eval(ErrorCode::InvalidStackTop(
                            "set", format!("{}", top)), pos));
                    }
                }

                // Class references and object construction
                GLOBAL => {
                    let modname = self.read_line()?;
                    let globname = self.read_line()?;
                    let module = self.decode_utf8(modname)?;
                    let name = self.decode_utf8(globname)?;
                    self.stack.push(Value::Global(module, name));
                }
                STACK_GLOBAL => {
                    let name = self.pop_string()?;
                    let module = self.pop_string()?;
                    self.stack.push(Value::Global(module, name));
                }
                REDUCE | NEWOBJ => {
                    let argtuple = self.pop()?;
                    let args = match self.resolve_deep(argtuple, &mut BTreeSet::new())? {
                        Value::Tuple(args) => args,
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "tuple", format!("{}", other))),
                    };
                    let callable = self.pop()?;
                    match self.resolve(callable)? {
                        Value::Global(module, name) => {
                            let value = self.construct(&module, &name, args)?;
                            self.stack.push(value);
                        }
                        other => return self.error(ErrorCode::InvalidStackTop(
                            "class reference", format!("{}", other))),
                    }
                }
                BUILD => {
                    let pos = self.pos;
                    let state = self.pop()?;
                    let state = self.resolve_deep(state, &mut BTreeSet::new())?;
                    let target = self.top_container()?;
                    match *target {
                        Value::Object(ref mut obj) => obj.set_state(state)?,
                        ref other => return Err(Error::Eval(ErrorCode::InvalidStackTop(
                            "object", format!("{}", other)), pos)),
                    }
                }

                // Persistent references
                PERSID => {
                    let line = self.read_line()?;
                    let pid = self.decode_unicode(line)?;
                    self.load_persistent(pid)?;
                }
                BINPERSID => {
                    let pid = self.pop()?;
                    let pid = self.resolve_deep(pid, &mut BTreeSet::new())?;
                    self.load_persistent(pid)?;
                }

                code => return self.error(ErrorCode::Unsupported(code as char))
            }
        }
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None    => self.error(ErrorCode::StackUnderflow)
        }
    }

    fn pop_string(&mut self) -> Result<String> {
        let top = self.pop()?;
        match self.resolve(top)? {
            Value::String(string) => Ok(string),
            other => self.error(ErrorCode::InvalidStackTop("string", format!("{}", other))),
        }
    }

    fn top(&mut self) -> Result<&mut Value> {
        if self.stack.is_empty() {
            return self.error(ErrorCode::StackUnderflow);
        }
        Ok(self.stack.last_mut().unwrap())
    }

    /// Like `top`, but follows `Ref`s into the memo table, so that mutation
    /// opcodes reach the real container.
    fn top_container(&mut self) -> Result<&mut Value> {
        match self.stack.last() {
            None => self.error(ErrorCode::StackUnderflow),
            Some(&Value::Ref(id)) => {
                let id = self.final_ref(id)?;
                match self.memo.get_mut(&id) {
                    Some(value) => Ok(value),
                    None => Err(Error::Eval(ErrorCode::MissingMemo(id), self.pos)),
                }
            }
            Some(_) => Ok(self.stack.last_mut().unwrap()),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        match self.stacks.pop() {
            Some(new) => Ok(mem::replace(&mut self.stack, new)),
            None      => self.error(ErrorCode::StackUnderflow)
        }
    }

    /// Move the top of stack into the memo table, leaving a `Ref` behind.
    fn memoize(&mut self, id: u32) -> Result<()> {
        // An id is assigned at most once per stream.  A reassignment could
        // store `Ref(id)` under `id` itself and make a reference chain
        // circular.
        if self.memo.contains_key(&id) {
            return self.error(ErrorCode::MemoReassigned(id));
        }
        let top = match self.stack.last_mut() {
            Some(top) => top,
            None => return self.error(ErrorCode::StackUnderflow),
        };
        // Memoizing a Ref just aliases the id.
        let value = mem::replace(top, Value::Ref(id));
        self.memo.insert(id, value);
        Ok(())
    }

    fn push_memo_ref(&mut self, id: u32) -> Result<()> {
        if !self.memo.contains_key(&id) {
            return self.error(ErrorCode::MissingMemo(id));
        }
        self.stack.push(Value::Ref(id));
        Ok(())
    }

    fn parse_memo_id(&self, line: &[u8]) -> Result<u32> {
        match str::from_utf8(line).unwrap_or("").parse::<u32>() {
            Ok(id) => Ok(id),
            Err(_) => self.error(ErrorCode::InvalidLiteral(line.to_vec())),
        }
    }

    /// Follow a chain of aliased ids to the one holding a real value.
    /// Chains always point to earlier ids, so this terminates.
    fn final_ref(&self, mut id: u32) -> Result<u32> {
        loop {
            match self.memo.get(&id) {
                Some(&Value::Ref(next)) => id = next,
                Some(_) => return Ok(id),
                None => return Err(Error::Eval(ErrorCode::MissingMemo(id), self.pos)),
            }
        }
    }

    /// Resolve a single level of back-reference.
    fn resolve(&self, value: Value) -> Result<Value> {
        match value {
            Value::Ref(id) => {
                let id = self.final_ref(id)?;
                match self.memo.get(&id) {
                    Some(value) => Ok(value.clone()),
                    None => Err(Error::Eval(ErrorCode::MissingMemo(id), self.pos)),
                }
            }
            other => Ok(other),
        }
    }

    /// Recursively replace references by the memoized values.  References on
    /// the active resolution path are left in place: they close a cycle.
    fn resolve_deep(&self, value: Value, active: &mut BTreeSet<u32>) -> Result<Value> {
        match value {
            Value::Ref(id) => {
                let id = self.final_ref(id)?;
                if active.contains(&id) {
                    return Ok(Value::Ref(id));
                }
                let inner = match self.memo.get(&id) {
                    Some(value) => value.clone(),
                    None => return Err(Error::Eval(ErrorCode::MissingMemo(id), self.pos)),
                };
                active.insert(id);
                let resolved = self.resolve_deep(inner, active)?;
                active.remove(&id);
                Ok(resolved)
            }
            Value::List(items) => items.into_iter()
                .map(|item| self.resolve_deep(item, active))
                .collect::<Result<Vec<_>>>().map(Value::List),
            Value::Tuple(items) => items.into_iter()
                .map(|item| self.resolve_deep(item, active))
                .collect::<Result<Vec<_>>>().map(Value::Tuple),
            Value::Dict(dict) => dict.into_iter()
                .map(|(key, item)| Ok((key, self.resolve_deep(item, active)?)))
                .collect::<Result<BTreeMap<_, _>>>().map(Value::Dict),
            other => Ok(other),
        }
    }

    fn make_hashable(&self, value: Value) -> Result<HashableValue> {
        // Keys and set items must be fully resolved to be comparable.
        let value = self.resolve_deep(value, &mut BTreeSet::new())?;
        match value.into_hashable() {
            Ok(value) => Ok(value),
            Err(_) => self.error(ErrorCode::ValueNotHashable),
        }
    }

    fn make_pairs(&self, items: Vec<Value>) -> Result<Vec<(HashableValue, Value)>> {
        if items.len() % 2 != 0 {
            return self.error(ErrorCode::InvalidValue(
                "odd number of dict operands".into()));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut key = None;
        for value in items {
            match key.take() {
                None      => key = Some(value),
                Some(key) => pairs.push((self.make_hashable(key)?, value)),
            }
        }
        Ok(pairs)
    }

    /// Construct an object for a REDUCE or NEWOBJ opcode.
    fn construct(&self, module: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        if let Some(constructor) = registry::find_constructor(module, name) {
            return constructor.construct(args);
        }
        if args.is_empty() {
            // Unknown class constructed without arguments: stand in with an
            // attribute dict, which takes state from a following BUILD.
            Ok(Value::Object(Box::new(ClassDict::new(module, name))))
        } else {
            Err(Error::Eval(ErrorCode::UnknownClass(module.to_owned(), name.to_owned()),
                            self.pos))
        }
    }

    fn load_persistent(&mut self, pid: Value) -> Result<()> {
        let loaded = match self.options.persistent_load {
            Some(ref hook) => hook(pid)?,
            None => return self.error(ErrorCode::NoPersistentLoad),
        };
        self.stack.push(loaded);
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8];
        loop {
            match self.rdr.read(&mut buf) {
                Ok(0) => return self.error(ErrorCode::EOFWhileParsing),
                Ok(_) => { self.pos += 1; return Ok(buf[0]) }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(16);
        loop {
            match self.read_byte()? {
                b'\n' => {
                    if result.last() == Some(&b'\r') { result.pop(); }
                    return Ok(result)
                }
                ch    => result.push(ch)
            }
        }
    }

    fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        (0..n).map(|_| self.read_byte()).collect()
    }

    fn read_i32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(4)?;
        match LittleEndian::read_i32(&lenbytes) {
            0          => Ok(vec![]),
            l if l < 0 => self.error(ErrorCode::NegativeLength),
            l          => self.read_bytes(l as u64)
        }
    }

    fn read_u64_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(8)?;
        self.read_bytes(LittleEndian::read_u64(&lenbytes))
    }

    fn read_u32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(4)?;
        self.read_bytes(LittleEndian::read_u32(&lenbytes) as u64)
    }

    fn read_u8_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbyte = self.read_byte()?;
        self.read_bytes(lenbyte as u64)
    }

    fn decode_string(&self, string: Vec<u8>) -> Result<Value> {
        if self.options.decode_strings {
            self.decode_unicode(string)
        } else {
            Ok(Value::Bytes(string))
        }
    }

    fn decode_escaped_string(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "normal" Python string escape rules.
        let mut result = Vec::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            match b {
                b'\\' => match iter.next() {
                    Some(&b'\\') => result.push(b'\\'),
                    Some(&b'a') => result.push(b'\x07'),
                    Some(&b'b') => result.push(b'\x08'),
                    Some(&b't') => result.push(b'\x09'),
                    Some(&b'n') => result.push(b'\x0a'),
                    Some(&b'v') => result.push(b'\x0b'),
                    Some(&b'f') => result.push(b'\x0c'),
                    Some(&b'r') => result.push(b'\x0d'),
                    Some(&b'x') => {
                        match iter.next()
                                  .and_then(|&ch1| (ch1 as char).to_digit(16))
                                  .and_then(|v1| iter.next()
                                            .and_then(|&ch2| (ch2 as char).to_digit(16))
                                            .map(|v2| 16*(v1 as u8) + (v2 as u8)))
                        {
                            Some(v) => result.push(v),
                            None => return self.error(ErrorCode::InvalidLiteral(s.into()))
                        }
                    },
                    _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                },
                _ => result.push(b)
            }
        }
        self.decode_string(result)
    }

    fn decode_utf8(&self, string: Vec<u8>) -> Result<String> {
        match String::from_utf8(string) {
            Ok(v)  => Ok(v),
            Err(_) => self.error(ErrorCode::StringNotUTF8)
        }
    }

    fn decode_unicode(&self, string: Vec<u8>) -> Result<Value> {
        self.decode_utf8(string).map(Value::String)
    }

    fn decode_escaped_unicode(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "raw-unicode-escape", which only knows
        // the \uXXXX and \UYYYYYYYY escapes.  The backslash is escaped
        // in this way, too.
        let mut result = String::with_capacity(s.len());
        let mut iter = s.iter();
        while let Some(&b) = iter.next() {
            match b {
                b'\\' => {
                    let nescape = match iter.next() {
                        Some(&b'u') => 4,
                        Some(&b'U') => 8,
                        _ => return self.error(ErrorCode::InvalidLiteral(s.into())),
                    };
                    let mut accum = 0;
                    for _i in 0..nescape {
                        accum *= 16;
                        match iter.next().and_then(|&ch| (ch as char).to_digit(16)) {
                            Some(v) => accum += v,
                            None => return self.error(ErrorCode::InvalidLiteral(s.into()))
                        }
                    }
                    match char::from_u32(accum) {
                        Some(v) => result.push(v),
                        None => return self.error(ErrorCode::InvalidLiteral(s.into()))
                    }
                }
                _ => result.push(b as char)
            }
        }
        Ok(Value::String(result))
    }

    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.pos))
    }
}

fn decode_long(bytes: Vec<u8>) -> Value {
    // BigInt::from_bytes_le doesn't like a sign bit in the bytes, therefore
    // we have to extract that ourselves and do the two-s complement.
    let negative = !bytes.is_empty() && (bytes[bytes.len() - 1] & 0x80 != 0);
    let mut val = BigInt::from_bytes_le(Sign::Plus, &bytes);
    if negative {
        val = val - (BigInt::from(1) << (bytes.len() * 8));
    }
    int_value(val)
}

fn int_value(val: BigInt) -> Value {
    // Fit into an i64 where possible.
    match val.to_i64() {
        Some(i) => Value::I64(i),
        None    => Value::Int(val),
    }
}

/// Decode a value from a `std::io::Read`.
pub fn value_from_reader<R: io::Read>(rdr: R, options: DeOptions) -> Result<Value> {
    let mut unpickler = Unpickler::new(rdr, options);
    let value = unpickler.parse()?;
    // Make sure the whole stream has been consumed.
    unpickler.end()?;
    Ok(value)
}

/// Decode a value directly from a byte iterator.
pub fn value_from_iter<I>(iter: I, options: DeOptions) -> Result<Value>
    where I: Iterator<Item=u8>
{
    value_from_reader(IterRead::new(iter), options)
}

/// Decode a value from a byte slice `&[u8]`.
pub fn value_from_slice(v: &[u8], options: DeOptions) -> Result<Value> {
    value_from_reader(v, options)
}
