// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::fmt;
use std::io;
use std::error;
use std::result;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// Unsupported opcode
    Unsupported(char),
    /// EOF while parsing op argument
    EOFWhileParsing,
    /// Stack underflowed
    StackUnderflow,
    /// More than one value left on the stack when STOP was reached
    StackNotEmpty,
    /// Length prefix found negative
    NegativeLength,
    /// String decoding as UTF-8 failed
    StringNotUTF8,
    /// Wrong stack top type for opcode
    InvalidStackTop(&'static str, String),
    /// Value not hashable, but used as dict key or set item
    ValueNotHashable,
    /// Self-referential value found while memoization is disabled
    Recursive,
    /// A back-reference pointed to an unassigned memo id
    MissingMemo(u32),
    /// A memo id was assigned a second time
    MemoReassigned(u32),
    /// Invalid literal found
    InvalidLiteral(Vec<u8>),
    /// Found trailing bytes after STOP opcode
    TrailingBytes,
    /// Invalid value in pickle stream
    InvalidValue(String),
    /// No encoding exists for this runtime type
    UnsupportedType(&'static str),
    /// Class reference with constructor arguments, but no registered constructor
    UnknownClass(String, String),
    /// A registered constructor or state application failed
    Construction(String),
    /// BUILD applied to an object that takes no state
    StateNotSupported(&'static str),
    /// Persistent reference found, but no persistent-load hook configured
    NoPersistentLoad,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ErrorCode::Unsupported(ch) => write!(fmt, "unsupported opcode {:?}", ch),
            ErrorCode::EOFWhileParsing => write!(fmt, "EOF while parsing"),
            ErrorCode::StackUnderflow => write!(fmt, "pickle stack underflow"),
            ErrorCode::StackNotEmpty => write!(fmt, "stack not empty at STOP opcode"),
            ErrorCode::NegativeLength => write!(fmt, "negative length prefix"),
            ErrorCode::StringNotUTF8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::InvalidStackTop(what, ref it) =>
                write!(fmt, "invalid stack top, expected {}, got {}", what, it),
            ErrorCode::ValueNotHashable => write!(fmt, "dict key or set item not hashable"),
            ErrorCode::Recursive =>
                write!(fmt, "self-referential value found, but memoization is disabled"),
            ErrorCode::MissingMemo(n) => write!(fmt, "missing memo with id {}", n),
            ErrorCode::MemoReassigned(n) => write!(fmt, "memo id {} assigned twice", n),
            ErrorCode::InvalidLiteral(ref l) =>
                write!(fmt, "literal is invalid: {}", String::from_utf8_lossy(l)),
            ErrorCode::TrailingBytes => write!(fmt, "trailing bytes found"),
            ErrorCode::InvalidValue(ref s) => write!(fmt, "invalid value: {}", s),
            ErrorCode::UnsupportedType(ty) => write!(fmt, "no encoding for type {}", ty),
            ErrorCode::UnknownClass(ref m, ref n) =>
                write!(fmt, "no constructor registered for class {}.{}", m, n),
            ErrorCode::Construction(ref s) => write!(fmt, "construction failed: {}", s),
            ErrorCode::StateNotSupported(ty) =>
                write!(fmt, "type {} does not take state from BUILD", ty),
            ErrorCode::NoPersistentLoad =>
                write!(fmt, "persistent reference found, but no persistent-load \
                             hook is configured"),
        }
    }
}

/// This type represents all possible errors that can occur when encoding or
/// decoding a value.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred when encoding or decoding a value.
    Io(io::Error),
    /// The pickle had some error while interpreting.
    Eval(ErrorCode, usize),
    /// Error while transforming a value, independent of a stream position.
    Syntax(ErrorCode),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref error) => error.fmt(fmt),
            Error::Eval(ref code, offset) => write!(fmt, "eval error at offset {}: {}",
                                                    offset, code),
            Error::Syntax(ref code) => write!(fmt, "codec error: {}", code)
        }
    }
}

impl error::Error for Error {}
