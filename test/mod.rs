// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except
// according to those terms.


macro_rules! treemap {
    ($($k:expr => $v:expr),*) => {
        {
            let mut m = BTreeMap::new();
            $(m.insert($k, $v);)*
            m
        }
    };
}

/// Wrap an opcode sequence in the protocol-2 header and the STOP opcode.
fn framed(middle: &[u8]) -> Vec<u8> {
    let mut bytes = vec![b'\x80', 2];
    bytes.extend_from_slice(middle);
    bytes.push(b'.');
    bytes
}

/// Encode without memo opcodes, for byte-exact comparisons.
fn encode_plain(value: &crate::Value) -> Vec<u8> {
    crate::value_to_vec(value, crate::SerOptions::new().without_memo()).unwrap()
}

fn decode(bytes: &[u8]) -> crate::Value {
    crate::value_from_slice(bytes, crate::DeOptions::new()).unwrap()
}

mod wire_tests {
    use std::collections::BTreeMap;
    use num_bigint::BigInt;
    use crate::Value;
    use super::{encode_plain, framed};

    fn check(value: Value, middle: &[u8]) {
        assert_eq!(encode_plain(&value), framed(middle));
    }

    #[test]
    fn singletons() {
        check(Value::None, b"N");
        check(Value::Bool(true), b"\x88");
        check(Value::Bool(false), b"\x89");
    }

    #[test]
    fn int_opcode_selection() {
        // The narrowest opcode that holds the value exactly.
        check(Value::I64(0), b"K\x00");
        check(Value::I64(100), b"Kd");
        check(Value::I64(255), b"K\xff");
        check(Value::I64(256), b"M\x00\x01");
        check(Value::I64(0x1234), b"M\x34\x12");
        check(Value::I64(65535), b"M\xff\xff");
        check(Value::I64(65536), b"J\x00\x00\x01\x00");
        check(Value::I64(1_000_000), b"J@B\x0f\x00");
        check(Value::I64(-5), b"J\xfb\xff\xff\xff");
        check(Value::I64(-2147483648), b"J\x00\x00\x00\x80");
    }

    #[test]
    fn long_minimal_length() {
        // Values beyond i32 take the shortest two's-complement byte run.
        check(Value::I64(0x8000_0000), b"\x8a\x05\x00\x00\x00\x80\x00");
        check(Value::I64(-0x8000_0001), b"\x8a\x05\xff\xff\xff\x7f\xff");
        check(Value::I64(0x12345678abcdef), b"\x8a\x07\xef\xcd\xabxV4\x12");
        check(Value::Int(BigInt::from(65)), b"\x8a\x01A");
        check(Value::Int(BigInt::from(128)), b"\x8a\x02\x80\x00");
        check(Value::Int(BigInt::from(-128)), b"\x8a\x01\x80");
    }

    #[test]
    fn floats() {
        check(Value::F64(4.5), b"G@\x12\x00\x00\x00\x00\x00\x00");
        check(Value::F64(2.5), b"G@\x04\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn strings() {
        check(Value::String("abc".into()), b"X\x03\x00\x00\x00abc");
        check(Value::String("".into()), b"X\x00\x00\x00\x00");
        // Length counts UTF-8 bytes, not characters.
        check(Value::String("h\u{e9}".into()), b"X\x03\x00\x00\x00h\xc3\xa9");
    }

    #[test]
    fn byte_strings() {
        // The bytearray(text, "latin-1") representation, readable by both
        // Python major versions.
        check(Value::Bytes(vec![1, 2, 3]),
              b"c__builtin__\nbytearray\nX\x03\x00\x00\x00\x01\x02\x03\
                X\x07\x00\x00\x00latin-1\x86R");
    }

    #[test]
    fn tuples_by_arity() {
        check(Value::Tuple(vec![]), b")");
        check(Value::Tuple(vec![Value::I64(1)]), b"K\x01\x85");
        check(Value::Tuple(vec![Value::I64(1), Value::I64(2)]), b"K\x01K\x02\x86");
        check(Value::Tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
              b"K\x01K\x02K\x03\x87");
        check(Value::Tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3), Value::I64(4)]),
              b"(K\x01K\x02K\x03K\x04t");
    }

    #[test]
    fn containers() {
        check(Value::List(vec![]), b"]");
        check(Value::List(vec![Value::I64(1), Value::I64(2)]), b"](K\x01K\x02e");
        check(Value::Dict(treemap!()), b"}");
        check(Value::Dict(treemap!(crate::HashableValue::I64(1) => Value::I64(2))),
              b"}(K\x01K\x02u");
        check(Value::Set(vec![crate::HashableValue::I64(42), crate::HashableValue::I64(0)]
                         .into_iter().collect()),
              b"\x8f(K\x00K*\x90");
        check(Value::FrozenSet(vec![crate::HashableValue::I64(42), crate::HashableValue::I64(0)]
                               .into_iter().collect()),
              b"(K\x00K*\x91");
    }
}

mod value_tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::iter::FromIterator;
    use num_bigint::BigInt;
    use rand::{thread_rng, RngCore};
    use quickcheck::{QuickCheck, StdGen};
    use crate::{value_to_vec, value_from_slice, SerOptions, DeOptions};
    use crate::{Value, HashableValue};

    fn get_test_object() -> Value {
        let longish = BigInt::from(10000000000u64) * BigInt::from(10000000000u64);
        let set = BTreeSet::from_iter(vec![HashableValue::I64(42), HashableValue::I64(0)]);
        Value::Dict(treemap!(
            HashableValue::None => Value::None,
            HashableValue::Bool(false) => Value::Tuple(vec![Value::Bool(false),
                                                            Value::Bool(true)]),
            HashableValue::I64(10) => Value::I64(100000),
            HashableValue::Int(longish.clone()) => Value::Int(longish),
            HashableValue::F64(1.0) => Value::F64(1.0),
            HashableValue::Bytes(b"bytes".to_vec()) => Value::Bytes(b"bytes".to_vec()),
            HashableValue::String("string".into()) => Value::String("string".into()),
            HashableValue::FrozenSet(set.clone()) => Value::FrozenSet(set.clone()),
            HashableValue::Tuple(vec![HashableValue::I64(1), HashableValue::I64(2)]) =>
                Value::Tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
            HashableValue::Tuple(vec![]) =>
                Value::List(vec![
                    Value::List(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
                    Value::Set(set),
                    Value::Dict(BTreeMap::new())
                ])))
    }

    #[test]
    fn roundtrip() {
        let dict = get_test_object();
        let vec = value_to_vec(&dict, SerOptions::new()).unwrap();
        let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
        assert_eq!(dict, tripped);
    }

    #[test]
    fn roundtrip_by_value_memo() {
        let dict = get_test_object();
        let vec = value_to_vec(&dict, SerOptions::new().by_value_memo()).unwrap();
        let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
        assert_eq!(dict, tripped);
    }

    #[test]
    fn roundtrip_without_memo() {
        let dict = get_test_object();
        let vec = value_to_vec(&dict, SerOptions::new().without_memo()).unwrap();
        assert!(!vec.contains(&b'q'), "memo opcodes written with memo disabled");
        let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
        assert_eq!(dict, tripped);
    }

    #[test]
    fn roundtrip_negative_bigint() {
        let value = Value::Int(BigInt::from(-1) << 70);
        let vec = value_to_vec(&value, SerOptions::new()).unwrap();
        assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), value);
    }

    #[test]
    fn longs_shrink_to_i64() {
        // Anything that fits decodes as I64, even when written as a long.
        let vec = value_to_vec(&Value::Int(BigInt::from(65)), SerOptions::new()).unwrap();
        assert_eq!(value_from_slice(&vec, DeOptions::new()).unwrap(), Value::I64(65));
    }

    #[test]
    fn protocol_0_literals() {
        let decode0 = |bytes: &[u8]| {
            value_from_slice(bytes, DeOptions::new().decode_strings()).unwrap()
        };
        assert_eq!(decode0(b"(lp0\nI1\naI2\naI3\na."),
                   Value::List(vec![Value::I64(1), Value::I64(2), Value::I64(3)]));
        assert_eq!(decode0(b"I01\n."), Value::Bool(true));
        assert_eq!(decode0(b"I00\n."), Value::Bool(false));
        assert_eq!(decode0(b"F2.5\n."), Value::F64(2.5));
        assert_eq!(decode0(b"L123L\n."), Value::I64(123));
        assert_eq!(decode0(b"S'ab\\ncd'\np0\n."), Value::String("ab\ncd".into()));
        assert_eq!(decode0(b"Vab\\u00e9\np0\n."), Value::String("ab\u{e9}".into()));
        assert_eq!(decode0(b"(dp0\nI1\nI2\ns."),
                   Value::Dict(treemap!(HashableValue::I64(1) => Value::I64(2))));
    }

    #[test]
    fn fuzzing() {
        // Tries to ensure that we don't panic when encountering strange streams.
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            thread_rng().fill_bytes(&mut stream);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if the
            // last byte is a STOP opcode.
            assert!(value_from_slice(&stream, DeOptions::new()).is_err());
        }
    }

    #[test]
    fn qc_roundtrip() {
        fn roundtrip(original: Value) {
            let vec = value_to_vec(&original, SerOptions::new()).unwrap();
            let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
            assert_eq!(original, tripped);
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(10000)
                         .quickcheck(roundtrip as fn(Value));
    }
}

mod memo_tests {
    use crate::{value_to_vec, value_from_slice, SerOptions, DeOptions};
    use crate::{Error, ErrorCode, Value, HashableValue};
    use super::framed;
    use std::collections::BTreeMap;

    #[test]
    fn identity_sharing() {
        // Sharing is explicit: a Ref names the id of an earlier value.
        let value = Value::List(vec![Value::String("hello".into()), Value::Ref(1)]);
        let bytes = value_to_vec(&value, SerOptions::new()).unwrap();
        assert_eq!(bytes, framed(b"]q\x00(X\x05\x00\x00\x00helloq\x01h\x01e"));
        // Decoding resolves the acyclic reference into a plain value.
        let decoded = value_from_slice(&bytes, DeOptions::new()).unwrap();
        assert_eq!(decoded, Value::List(vec![Value::String("hello".into()),
                                             Value::String("hello".into())]));
    }

    #[test]
    fn by_value_collapses_equal_strings() {
        let value = Value::List(vec![Value::String("hello".into()),
                                     Value::String("hello".into())]);
        let bytes = value_to_vec(&value, SerOptions::new().by_value_memo()).unwrap();
        // The second occurrence becomes a GET of the first one's id.
        assert_eq!(bytes, framed(b"]q\x00(X\x05\x00\x00\x00helloq\x01h\x01e"));
        assert_eq!(value_from_slice(&bytes, DeOptions::new()).unwrap(), value);
    }

    #[test]
    fn by_value_collapses_equal_tuples() {
        let tuple = Value::Tuple(vec![Value::I64(1000), Value::I64(2000)]);
        let value = Value::List(vec![tuple.clone(), tuple]);
        let by_value = value_to_vec(&value, SerOptions::new().by_value_memo()).unwrap();
        let identity = value_to_vec(&value, SerOptions::new()).unwrap();
        assert!(by_value.len() < identity.len());
        assert_eq!(value_from_slice(&by_value, DeOptions::new()).unwrap(), value);
        assert_eq!(value_from_slice(&identity, DeOptions::new()).unwrap(), value);
    }

    #[test]
    fn cycle_roundtrip() {
        // A list containing itself: the Ref points at the list's own memo id.
        let value = Value::List(vec![Value::I64(5), Value::Ref(0)]);
        let bytes = value_to_vec(&value, SerOptions::new()).unwrap();
        assert_eq!(bytes, framed(b"]q\x00(K\x05h\x00e"));
        let decoded = value_from_slice(&bytes, DeOptions::new()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn cycle_fails_without_memo() {
        let value = Value::List(vec![Value::Ref(0)]);
        match value_to_vec(&value, SerOptions::new().without_memo()) {
            Err(Error::Syntax(ErrorCode::Recursive)) => {}
            other => panic!("expected recursion error, got {:?}", other),
        }
    }

    #[test]
    fn forward_reference_fails() {
        let value = Value::List(vec![Value::Ref(5)]);
        match value_to_vec(&value, SerOptions::new()) {
            Err(Error::Syntax(ErrorCode::MissingMemo(5))) => {}
            other => panic!("expected missing memo error, got {:?}", other),
        }
    }

    #[test]
    fn memo_id_reassignment_fails() {
        // NONE, BINPUT 0, BINGET 0, BINPUT 0: the second PUT would alias
        // id 0 to itself and make the reference chain circular.
        match value_from_slice(b"\x80\x02Nq\x00h\x00q\x000.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::MemoReassigned(0), _)) => {}
            other => panic!("expected memo reassignment error, got {:?}", other),
        }
        // Text-form PUT reusing an id is rejected the same way.
        match value_from_slice(b"(lp0\nNp0\na.", DeOptions::new()) {
            Err(Error::Eval(ErrorCode::MemoReassigned(0), _)) => {}
            other => panic!("expected memo reassignment error, got {:?}", other),
        }
    }

    #[test]
    fn shared_and_recursive_stream() {
        // A stream with a shared string, a shared dict and a self-referential
        // list, produced by a reference implementation.
        let bytes = [
            128u8, 2, 93, 113, 0, 40, 75, 65, 85, 5, 104, 101, 108, 108, 111, 113, 1,
            104, 1, 125, 113, 2, 85, 7, 114, 101, 99, 117, 114, 115, 101, 113, 3, 104,
            0, 115, 104, 1, 101, 46,
        ];
        let decoded = value_from_slice(&bytes, DeOptions::new().decode_strings()).unwrap();
        let expected = Value::List(vec![
            Value::I64(65),
            Value::String("hello".into()),
            Value::String("hello".into()),
            Value::Dict(treemap!(
                HashableValue::String("recurse".into()) => Value::Ref(0))),
            Value::String("hello".into()),
        ]);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn text_memo_opcodes() {
        // PUT/GET with string ids, as written by protocol 0.
        let decoded = value_from_slice(b"(lp0\nS'a'\np1\nag1\na.",
                                       DeOptions::new().decode_strings()).unwrap();
        assert_eq!(decoded, Value::List(vec![Value::String("a".into()),
                                             Value::String("a".into())]));
    }
}

mod object_tests {
    use std::any::Any;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use chrono::{Duration, NaiveDate};
    use num_complex::Complex64;
    use crate::{value_to_vec, value_from_slice, SerOptions, DeOptions};
    use crate::{register_constructor, register_deconstructor, register_pickler};
    use crate::{ClassDict, Emitter, Error, ErrorCode, HashableValue, Object,
                ObjectDeconstructor, ObjectPickler, Result, Timezone, Value};
    use super::{decode, encode_plain, framed};

    macro_rules! test_object {
        ($ty:ident) => {
            impl Object for $ty {
                fn type_name(&self) -> &'static str { stringify!($ty) }
                fn as_any(&self) -> &dyn Any { self }
                fn clone_box(&self) -> Box<dyn Object> { Box::new(self.clone()) }
                fn object_eq(&self, other: &dyn Object) -> bool {
                    other.downcast_ref::<$ty>().map_or(false, |other| self == other)
                }
            }
        };
    }

    #[test]
    fn datetime_values() {
        let dt = NaiveDate::from_ymd_opt(2011, 12, 31).unwrap()
            .and_hms_micro_opt(14, 33, 59, 456000).unwrap();
        let value = Value::Object(Box::new(dt));
        assert_eq!(encode_plain(&value),
                   framed(b"cdatetime\ndatetime\n(M\xdb\x07K\x0cK\x1fK\x0eK!K;J@\xf5\x06\x00tR"));
        assert_eq!(decode(&encode_plain(&value)), value);
        // The packed single-argument form decodes to the same value.
        let packed = framed(b"cdatetime\ndatetime\nU\n\x07\xdb\x0c\x1f\x0e!;\x06\xf5@\x85R");
        assert_eq!(decode(&packed), value);
    }

    #[test]
    fn date_and_time_values() {
        let date = Value::Object(Box::new(NaiveDate::from_ymd_opt(2011, 12, 31).unwrap()));
        assert_eq!(encode_plain(&date),
                   framed(b"cdatetime\ndate\nM\xdb\x07K\x0cK\x1f\x87R"));
        assert_eq!(decode(&encode_plain(&date)), date);
        let packed_date = framed(b"cdatetime\ndate\nU\x04\x07\xdb\x0c\x1f\x85R");
        assert_eq!(decode(&packed_date), date);

        let time = Value::Object(Box::new(
            chrono::NaiveTime::from_hms_micro_opt(14, 33, 59, 0).unwrap()));
        assert_eq!(encode_plain(&time),
                   framed(b"cdatetime\ntime\n(K\x0eK!K;K\x00tR"));
        assert_eq!(decode(&encode_plain(&time)), time);
        let packed_time = framed(b"cdatetime\ntime\nU\x06\x0e!;\x00\x00\x00\x85R");
        assert_eq!(decode(&packed_time), time);
    }

    #[test]
    fn timedelta_values() {
        let delta = Duration::microseconds(
            2 * 86_400_000_000 + 7000 * 1_000_000 + 456_789);
        let value = Value::Object(Box::new(delta));
        assert_eq!(encode_plain(&value),
                   framed(b"cdatetime\ntimedelta\nK\x02MX\x1bJU\xf8\x06\x00\x87R"));
        assert_eq!(decode(&encode_plain(&value)), value);
    }

    #[test]
    fn timedelta_sign_normalization() {
        // Seconds and microseconds stay non-negative; days carry the sign.
        let value = Value::Object(Box::new(Duration::microseconds(-1)));
        assert_eq!(encode_plain(&value),
                   framed(b"cdatetime\ntimedelta\nJ\xff\xff\xff\xffJ\x7fQ\x01\x00J?B\x0f\x00\x87R"));
        assert_eq!(decode(&encode_plain(&value)), value);
    }

    #[test]
    fn complex_values() {
        let value = Value::Object(Box::new(Complex64::new(2.5, 3.5)));
        assert_eq!(encode_plain(&value),
                   framed(b"c__builtin__\ncomplex\n\
                            G@\x04\x00\x00\x00\x00\x00\x00G@\x0c\x00\x00\x00\x00\x00\x00\x86R"));
        assert_eq!(decode(&encode_plain(&value)), value);
    }

    #[test]
    fn decimal_values() {
        let decoded = decode(&framed(b"cdecimal\nDecimal\nX\x0a\x00\x00\x0012345.6789\x85R"));
        assert_eq!(decoded, Value::F64(12345.6789));
        // The textual NaN maps to a float NaN.
        let nan = decode(&framed(b"cdecimal\nDecimal\nX\x03\x00\x00\x00NaN\x85R"));
        match nan {
            Value::F64(f) => assert!(f.is_nan()),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn timezone_values() {
        let decoded = decode(&framed(b"cpytz\ntimezone\nX\x10\x00\x00\x00Europe/Amsterdam\x85R"));
        assert_eq!(decoded, Value::Object(Box::new(Timezone::new("Europe/Amsterdam"))));
        let utc = decode(&framed(b"cpytz\n_UTC\n)R"));
        assert_eq!(utc, Value::Object(Box::new(Timezone::utc())));
    }

    #[test]
    fn codecs_encode_checks_the_encoding() {
        let decoded = decode(&framed(
            b"c_codecs\nencode\nX\x03\x00\x00\x00abcX\x07\x00\x00\x00latin-1\x86R"));
        assert_eq!(decoded, Value::Bytes(b"abc".to_vec()));
        // Only the latin-1 byte-for-byte mapping is supported.
        match value_from_slice(&framed(
            b"c_codecs\nencode\nX\x03\x00\x00\x00abcX\x05\x00\x00\x00utf-8\x86R"),
                               DeOptions::new()) {
            Err(Error::Syntax(ErrorCode::Construction(msg))) =>
                assert!(msg.contains("utf-8"), "unexpected message: {}", msg),
            other => panic!("expected construction error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_class_without_args_becomes_class_dict() {
        let decoded = decode(&framed(b"c__main__\nCustomClass\n)R"));
        let dict = decoded.downcast_object::<ClassDict>().expect("expected a ClassDict");
        assert_eq!(dict.class(), "__main__.CustomClass");
    }

    #[test]
    fn unknown_class_with_args_fails() {
        match value_from_slice(&framed(b"c__main__\nCustomClass\nK\x01\x85R"),
                               DeOptions::new()) {
            Err(Error::Eval(ErrorCode::UnknownClass(module, name), _)) => {
                assert_eq!(module, "__main__");
                assert_eq!(name, "CustomClass");
            }
            other => panic!("expected unknown class error, got {:?}", other),
        }
    }

    #[test]
    fn class_dict_takes_build_state() {
        // NEWOBJ plus BUILD state, produced by a reference implementation.
        let bytes = [
            128u8, 2, 99, 95, 95, 109, 97, 105, 110, 95, 95, 10, 67, 117, 115, 116,
            111, 109, 67, 108, 97, 115, 115, 10, 113, 0, 41, 129, 113, 1, 125, 113,
            2, 40, 85, 3, 97, 103, 101, 113, 3, 75, 34, 85, 6, 118, 97, 108, 117,
            101, 115, 113, 4, 93, 113, 5, 40, 75, 1, 75, 2, 75, 3, 101, 85, 4, 110,
            97, 109, 101, 113, 6, 85, 5, 72, 97, 114, 114, 121, 113, 7, 117, 98, 46,
        ];
        let decoded = value_from_slice(&bytes, DeOptions::new().decode_strings()).unwrap();
        let dict = decoded.downcast_object::<ClassDict>().expect("expected a ClassDict");
        assert_eq!(dict.class(), "__main__.CustomClass");
        assert_eq!(dict.get("name"), Some(&Value::String("Harry".into())));
        assert_eq!(dict.get("age"), Some(&Value::I64(34)));
        assert_eq!(dict.get("values"),
                   Some(&Value::List(vec![Value::I64(1), Value::I64(2), Value::I64(3)])));
    }

    #[test]
    fn class_dict_reencodes_as_attribute_dict() {
        let mut dict = ClassDict::new("app", "Config");
        dict.set("port", Value::I64(80));
        let bytes = encode_plain(&Value::Object(Box::new(dict)));
        let decoded = decode(&bytes);
        let expected = Value::Dict(treemap!(
            HashableValue::String("__class__".into()) => Value::String("app.Config".into()),
            HashableValue::String("port".into()) => Value::I64(80)));
        assert_eq!(decoded, expected);
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Point {
        x: f64,
        y: f64,
    }

    test_object!(Point);

    struct PointDeconstructor;

    impl ObjectDeconstructor for PointDeconstructor {
        fn module(&self) -> &str { "geom" }
        fn name(&self) -> &str { "Point" }
        fn deconstruct(&self, obj: &dyn Object) -> Result<Vec<Value>> {
            let point = obj.downcast_ref::<Point>().unwrap();
            Ok(vec![Value::F64(point.x), Value::F64(point.y)])
        }
    }

    #[test]
    fn registered_type_roundtrip() {
        register_deconstructor::<Point>(Arc::new(PointDeconstructor));
        register_constructor("geom", "Point", Arc::new(|args: Vec<Value>| {
            match args.as_slice() {
                [Value::F64(x), Value::F64(y)] =>
                    Ok(Value::Object(Box::new(Point { x: *x, y: *y }))),
                _ => Err(Error::Syntax(ErrorCode::Construction(
                    "Point: expected two floats".into()))),
            }
        }));
        let value = Value::List(vec![
            Value::Object(Box::new(Point { x: 1.5, y: -2.0 })),
            Value::I64(7),
        ]);
        let bytes = value_to_vec(&value, SerOptions::new()).unwrap();
        assert_eq!(value_from_slice(&bytes, DeOptions::new()).unwrap(), value);
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Span {
        start: i64,
        len: i64,
    }

    test_object!(Span);

    struct SpanPickler;

    impl ObjectPickler for SpanPickler {
        fn pickle(&self, obj: &dyn Object, emitter: &mut dyn Emitter) -> Result<()> {
            let span = obj.downcast_ref::<Span>().unwrap();
            emitter.save(&Value::Tuple(vec![Value::I64(span.start), Value::I64(span.len)]))
        }
    }

    #[test]
    fn custom_pickler_controls_encoding() {
        register_pickler::<Span>(Arc::new(SpanPickler));
        let value = Value::Object(Box::new(Span { start: 3, len: 4 }));
        assert_eq!(encode_plain(&value), framed(b"K\x03K\x04\x86"));
        // The custom representation decodes as the plain tuple it is.
        assert_eq!(decode(&encode_plain(&value)),
                   Value::Tuple(vec![Value::I64(3), Value::I64(4)]));
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Config {
        host: String,
        port: i64,
    }

    impl Object for Config {
        fn type_name(&self) -> &'static str { "Config" }
        fn as_any(&self) -> &dyn Any { self }
        fn clone_box(&self) -> Box<dyn Object> { Box::new(self.clone()) }
        fn object_eq(&self, other: &dyn Object) -> bool {
            other.downcast_ref::<Config>().map_or(false, |other| self == other)
        }
        fn class_name(&self) -> Option<String> {
            Some("app.Config".into())
        }
        fn attributes(&self) -> Option<Vec<(String, Value)>> {
            Some(vec![("host".into(), Value::String(self.host.clone())),
                      ("port".into(), Value::I64(self.port))])
        }
    }

    #[test]
    fn attribute_fallback_encodes_as_dict() {
        let value = Value::Object(Box::new(Config { host: "localhost".into(), port: 80 }));
        let decoded = decode(&encode_plain(&value));
        let expected = Value::Dict(treemap!(
            HashableValue::String("__class__".into()) => Value::String("app.Config".into()),
            HashableValue::String("host".into()) => Value::String("localhost".into()),
            HashableValue::String("port".into()) => Value::I64(80)));
        assert_eq!(decoded, expected);
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Opaque;

    test_object!(Opaque);

    #[test]
    fn unregistered_type_fails_with_its_name() {
        match value_to_vec(&Value::Object(Box::new(Opaque)), SerOptions::new()) {
            Err(Error::Syntax(ErrorCode::UnsupportedType("Opaque"))) => {}
            other => panic!("expected unsupported type error, got {:?}", other),
        }
    }
}

mod hook_tests {
    use crate::{value_to_vec, value_from_slice, SerOptions, DeOptions};
    use crate::{Error, ErrorCode, Value};
    use super::framed;

    #[test]
    fn persistent_roundtrip() {
        let value = Value::List(vec![Value::String("db:42".into()), Value::I64(1)]);
        let options = SerOptions::new().persistent_id(|value: &Value| match value {
            Value::String(s) if s.starts_with("db:") =>
                Some(Value::I64(s[3..].parse().unwrap())),
            _ => None,
        });
        let bytes = value_to_vec(&value, options).unwrap();
        assert_eq!(bytes, framed(b"]q\x00(K*QK\x01e"));
        let decoded = value_from_slice(&bytes, DeOptions::new()
            .persistent_load(|pid| match pid {
                Value::I64(i) => Ok(Value::String(format!("db:{}", i))),
                other => Err(Error::Syntax(ErrorCode::InvalidValue(
                    format!("unexpected pid {}", other)))),
            })).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn text_persistent_id() {
        let decoded = value_from_slice(b"\x80\x02Pdb:7\n.", DeOptions::new()
            .persistent_load(|pid| Ok(pid))).unwrap();
        assert_eq!(decoded, Value::String("db:7".into()));
    }

    #[test]
    fn persistent_ref_without_hook_fails() {
        match value_from_slice(&framed(b"K\x01Q"), DeOptions::new()) {
            Err(Error::Eval(ErrorCode::NoPersistentLoad, _)) => {}
            other => panic!("expected missing hook error, got {:?}", other),
        }
    }
}

mod error_tests {
    use crate::{value_from_slice, DeOptions, Error, ErrorCode};
    use super::framed;

    fn assert_eval_error(bytes: &[u8], expected: ErrorCode) {
        match value_from_slice(bytes, DeOptions::new()) {
            Err(Error::Eval(code, _)) => assert_eq!(code, expected),
            other => panic!("expected {:?}, got {:?}", expected, other),
        }
    }

    #[test]
    fn truncated_stream() {
        assert_eval_error(b"\x80\x02X\x10\x00\x00\x00ab", ErrorCode::EOFWhileParsing);
        assert_eval_error(b"\x80\x02", ErrorCode::EOFWhileParsing);
    }

    #[test]
    fn trailing_bytes() {
        assert_eval_error(b"\x80\x02N.N", ErrorCode::TrailingBytes);
    }

    #[test]
    fn stack_not_empty_at_stop() {
        assert_eval_error(b"\x80\x02NN.", ErrorCode::StackNotEmpty);
    }

    #[test]
    fn stack_underflow() {
        assert_eval_error(b"\x80\x02e.", ErrorCode::StackUnderflow);
        assert_eval_error(b"\x80\x02\x85.", ErrorCode::StackUnderflow);
    }

    #[test]
    fn unsupported_opcode() {
        assert_eval_error(b"\x80\x02\x07.", ErrorCode::Unsupported('\x07'));
    }

    #[test]
    fn missing_memo_id() {
        assert_eval_error(&framed(b"h\x00"), ErrorCode::MissingMemo(0));
    }

    #[test]
    fn unhashable_key() {
        assert_eval_error(&framed(b"}(]K\x01u"), ErrorCode::ValueNotHashable);
    }

    #[test]
    fn invalid_reduce_argument() {
        // REDUCE needs an argument tuple on top of the stack.
        match value_from_slice(&framed(b"c__main__\nCustomClass\nK\x01R"),
                               DeOptions::new()) {
            Err(Error::Eval(ErrorCode::InvalidStackTop(what, _), _)) =>
                assert_eq!(what, "tuple"),
            other => panic!("expected invalid stack top, got {:?}", other),
        }
    }

    #[test]
    fn errors_format_offsets() {
        let err = value_from_slice(b"\x80\x02\x07.", DeOptions::new()).unwrap_err();
        assert_eq!(format!("{}", err),
                   "eval error at offset 3: unsupported opcode '\\u{7}'");
    }

    #[test]
    fn position_free_errors_format() {
        use crate::{value_to_vec, SerOptions, Value};
        let err = value_to_vec(&Value::List(vec![Value::Ref(0)]),
                               SerOptions::new().without_memo()).unwrap_err();
        assert_eq!(format!("{}", err),
                   "codec error: self-referential value found, \
                    but memoization is disabled");
    }
}
