//! End-to-end tests, running hand-assembled AML through the whole interpreter.

use crate::{
    namespace::AmlName,
    notify::GpeTrigger,
    object::{Object, WeakObject, WrappedObject},
    op_region::{OpRegion, RegionHandler, RegionSpace, SetupFunction},
    test_utils::*,
    AmlError,
    Handler,
    Interpreter,
    InterpreterConfig,
    ParsePolicy,
};
use alloc::{string::String, sync::Arc, vec, vec::Vec};
use core::{
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};
use proptest::prelude::*;
use std::{sync::Mutex, time::Duration};

fn interpreter() -> (TestHandler, Interpreter) {
    let handler = TestHandler::new();
    let interpreter = Interpreter::new(handler.clone(), 2);
    (handler, interpreter)
}

fn path(path: &str) -> AmlName {
    AmlName::from_str(path).unwrap()
}

fn integer_value(object: &WrappedObject) -> u64 {
    object.lock().as_integer().unwrap()
}

fn get(interpreter: &Interpreter, name: &str) -> WrappedObject {
    interpreter.namespace.lock().get(path(name)).unwrap()
}

fn cat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

#[test]
fn names_and_integers() {
    let (_, interpreter) = interpreter();
    let table = cat(&[&name("FOO", &integer(0x1234)), &scope("\\_SB", &name("BAR", &string("hello")))]);
    interpreter.load_table(&table).unwrap();

    assert_eq!(integer_value(&get(&interpreter, "\\FOO")), 0x1234);
    assert_eq!(get(&interpreter, "\\_SB.BAR").lock().as_string().unwrap(), "hello");
}

#[test]
fn method_arithmetic() {
    let (_, interpreter) = interpreter();
    let table = method("MAIN", 0, &ret(&cat(&[&[0x72], &integer(3), &integer(4), &[0x00]])));
    interpreter.load_table(&table).unwrap();

    let result = interpreter.invoke_method(path("\\MAIN"), vec![]).unwrap();
    assert_eq!(integer_value(&result), 7);
}

#[test]
fn args_and_locals() {
    let (_, interpreter) = interpreter();
    // Local0 = Arg0 - Arg1; Return (Local0 * 2)
    let body = cat(&[
        &[0x74, ARG0, ARG1, LOCAL0],
        &ret(&cat(&[&[0x77, LOCAL0], &integer(2), &[0x00]])),
    ]);
    interpreter.load_table(&method("SUBD", 2, &body)).unwrap();

    let result = interpreter
        .invoke_method(path("\\SUBD"), vec![Object::Integer(10).wrap(), Object::Integer(4).wrap()])
        .unwrap();
    assert_eq!(integer_value(&result), 12);
}

#[test]
fn wrong_argument_count() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&method("ONE_", 1, &ret(&[ARG0]))).unwrap();
    assert_eq!(interpreter.invoke_method(path("\\ONE_"), vec![]).err(), Some(AmlError::MethodArgCountIncorrect));
}

#[test]
fn while_and_break() {
    let (_, interpreter) = interpreter();
    let body = cat(&[
        &store(&integer(0), &[LOCAL0]),
        &while_loop(
            &cat(&[&[0x95, LOCAL0], &integer(10)]),
            &cat(&[&[0x75, LOCAL0], &if_else(&cat(&[&[0x93, LOCAL0], &integer(5)]), &[0xa5], None)]),
        ),
        &ret(&[LOCAL0]),
    ]);

    let result = interpreter.execute_method(&body).unwrap();
    assert_eq!(integer_value(&result), 5);
}

#[test]
fn while_and_continue() {
    let (_, interpreter) = interpreter();
    // Sum the even numbers up to 6
    let body = cat(&[
        &store(&integer(0), &[LOCAL0]),
        &store(&integer(0), &[LOCAL1]),
        &while_loop(
            &cat(&[&[0x95, LOCAL0], &integer(6)]),
            &cat(&[
                &[0x75, LOCAL0],
                &if_else(&cat(&[&[0x7b, LOCAL0], &integer(1), &[0x00]]), &[0x9f], None),
                &[0x72, LOCAL1, LOCAL0, LOCAL1],
            ]),
        ),
        &ret(&[LOCAL1]),
    ]);

    let result = interpreter.execute_method(&body).unwrap();
    assert_eq!(integer_value(&result), 12);
}

#[test]
fn if_else_branches() {
    let (_, interpreter) = interpreter();
    let body = if_else(&cat(&[&[0x94, ARG0], &integer(3)]), &ret(&string("big")), Some(&ret(&string("small"))));
    interpreter.load_table(&method("SIZE", 1, &body)).unwrap();

    let big = interpreter.invoke_method(path("\\SIZE"), vec![Object::Integer(8).wrap()]).unwrap();
    let small = interpreter.invoke_method(path("\\SIZE"), vec![Object::Integer(1).wrap()]).unwrap();
    assert_eq!(big.lock().as_string().unwrap(), "big");
    assert_eq!(small.lock().as_string().unwrap(), "small");
}

#[test]
fn nested_method_calls() {
    let (_, interpreter) = interpreter();
    let table = cat(&[
        &method("DBL_", 1, &ret(&cat(&[&[0x77, ARG0], &integer(2), &[0x00]]))),
        &method("MAIN", 0, &ret(&cat(&[&name_string("DBL"), &name_string("DBL"), &integer(3)]))),
    ]);
    interpreter.load_table(&table).unwrap();

    let result = interpreter.invoke_method(path("\\MAIN"), vec![]).unwrap();
    assert_eq!(integer_value(&result), 12);
}

#[test]
fn method_without_return() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&method("NOPE", 0, &store(&integer(1), &[LOCAL0]))).unwrap();

    let result = interpreter.invoke_method(path("\\NOPE"), vec![]).unwrap();
    assert!(matches!(*result.lock(), Object::Uninitialized));
}

#[test]
fn parse_and_execute() {
    let (_, interpreter) = interpreter();
    let result = interpreter
        .parse_and_execute(&method("MAIN", 0, &ret(&integer(7))), Some(path("\\MAIN")), vec![])
        .unwrap()
        .unwrap();
    assert_eq!(integer_value(&result), 7);

    assert!(interpreter.parse_and_execute(&[], None, vec![]).unwrap().is_none());
}

#[test]
fn evaluate_missing_object() {
    let (_, interpreter) = interpreter();
    assert!(interpreter.evaluate_if_present(path("\\NOPE"), vec![]).unwrap().is_none());
    assert!(interpreter.evaluate_if_present(path("\\_SB.NOPE.FOO"), vec![]).unwrap().is_none());
}

#[test]
fn match_package() {
    let (_, interpreter) = interpreter();
    let table = name("PKG", &package(&[integer(5), integer(3), integer(8), integer(1)]));
    interpreter.load_table(&table).unwrap();

    // Match (PKG, MEQ, 8, MTR, 0, 0)
    let found = cat(&[&[0x89], &name_string("PKG"), &[1], &integer(8), &[0], &integer(0), &integer(0)]);
    assert_eq!(integer_value(&interpreter.execute_method(&ret(&found)).unwrap()), 2);

    let missing = cat(&[&[0x89], &name_string("PKG"), &[1], &integer(7), &[0], &integer(0), &integer(0)]);
    assert_eq!(integer_value(&interpreter.execute_method(&ret(&missing)).unwrap()), u64::MAX);

    let past_end = cat(&[&[0x89], &name_string("PKG"), &[1], &integer(7), &[0], &integer(0), &integer(4)]);
    assert_eq!(interpreter.execute_method(&ret(&past_end)).err(), Some(AmlError::PackageLimit));
}

#[test]
fn match_skips_elements_that_are_not_integers() {
    let (_, interpreter) = interpreter();
    let elements = [string("0000000000000008"), buffer(&[8, 0, 0, 0, 0, 0, 0, 0]), integer(8), integer(9)];
    interpreter.load_table(&name("PKG", &package(&elements))).unwrap();

    // Match (PKG, MEQ, 8, MTR, 0, 0)
    let equal = cat(&[&[0x89], &name_string("PKG"), &[1], &integer(8), &[0], &integer(0), &integer(0)]);
    assert_eq!(integer_value(&interpreter.execute_method(&ret(&equal)).unwrap()), 2);

    // Match (PKG, MGT, 8, MLE, 9, 0)
    let between = cat(&[&[0x89], &name_string("PKG"), &[5], &integer(8), &[2], &integer(9), &integer(0)]);
    assert_eq!(integer_value(&interpreter.execute_method(&ret(&between)).unwrap()), 3);

    // Match (PKG, MTR, 0, MTR, 0, 1) only matches integers too
    let any = cat(&[&[0x89], &name_string("PKG"), &[0], &integer(0), &[0], &integer(0), &integer(1)]);
    assert_eq!(integer_value(&interpreter.execute_method(&ret(&any)).unwrap()), 2);
}

#[test]
fn concat_integers_on_old_tables() {
    let handler = TestHandler::new();
    let interpreter = Interpreter::new(handler, 1);

    let result = interpreter.execute_method(&ret(&cat(&[&[0x73], &integer(1), &integer(2), &[0x00]]))).unwrap();
    assert_eq!(result.lock().as_buffer().unwrap(), &[1, 0, 0, 0, 2, 0, 0, 0]);
}

#[test]
fn integers_are_truncated_on_old_tables() {
    let handler = TestHandler::new();
    let interpreter = Interpreter::new(handler, 1);

    let result = interpreter.execute_method(&ret(&[0xff])).unwrap();
    assert_eq!(integer_value(&result), 0xffff_ffff);
}

#[test]
fn store_keeps_type_of_named_integer() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&name("INT", &integer(5))).unwrap();
    interpreter.execute_method(&store(&string("1A"), &name_string("INT"))).unwrap();

    let object = get(&interpreter, "\\INT");
    assert!(matches!(*object.lock(), Object::Integer(0x1a)));
}

#[test]
fn store_to_buffer_keeps_length() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&name("BUF", &buffer(&[1, 2, 3]))).unwrap();

    interpreter.execute_method(&store(&buffer(&[9]), &name_string("BUF"))).unwrap();
    assert_eq!(get(&interpreter, "\\BUF").lock().as_buffer().unwrap(), &[9, 0, 0]);

    interpreter.execute_method(&store(&buffer(&[4, 5, 6, 7, 8]), &name_string("BUF"))).unwrap();
    assert_eq!(get(&interpreter, "\\BUF").lock().as_buffer().unwrap(), &[4, 5, 6]);
}

#[test]
fn store_to_buffer_index() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&name("BUF", &buffer(&[1, 2, 3]))).unwrap();

    let target = cat(&[&[0x88], &name_string("BUF"), &integer(1), &[0x00]]);
    interpreter.execute_method(&store(&integer(0xff), &target)).unwrap();
    assert_eq!(get(&interpreter, "\\BUF").lock().as_buffer().unwrap(), &[1, 0xff, 3]);
}

#[test]
fn references() {
    let (_, interpreter) = interpreter();
    let table = cat(&[
        &name("VAL", &integer(7)),
        &method("SETR", 1, &store(&integer(9), &[ARG0])),
        &method("GETR", 0, &ret(&cat(&[&[0x83, 0x71], &name_string("VAL")]))),
    ]);
    interpreter.load_table(&table).unwrap();

    assert_eq!(integer_value(&interpreter.invoke_method(path("\\GETR"), vec![]).unwrap()), 7);

    // Stores to an argument holding a reference go through to the referenced object
    interpreter.execute_method(&cat(&[&name_string("SETR"), &[0x71], &name_string("VAL")])).unwrap();
    assert_eq!(integer_value(&get(&interpreter, "\\VAL")), 9);
}

#[test]
fn cond_ref_of() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&name("FOO", &integer(1))).unwrap();

    let missing = interpreter.execute_method(&ret(&cat(&[&[0x5b, 0x12], &name_string("NOPE"), &[0x00]]))).unwrap();
    assert_eq!(integer_value(&missing), 0);

    let present = interpreter.execute_method(&ret(&cat(&[&[0x5b, 0x12], &name_string("FOO"), &[0x00]]))).unwrap();
    assert_eq!(integer_value(&present), u64::MAX);
}

#[test]
fn size_and_type() {
    let (_, interpreter) = interpreter();
    let table = cat(&[&name("STR", &string("hello")), &name("PKG", &package(&[integer(1), integer(2)]))]);
    interpreter.load_table(&table).unwrap();

    let size = interpreter.execute_method(&ret(&cat(&[&[0x87], &name_string("STR")]))).unwrap();
    assert_eq!(integer_value(&size), 5);

    let typ = interpreter.execute_method(&ret(&cat(&[&[0x8e], &name_string("PKG")]))).unwrap();
    assert_eq!(integer_value(&typ), 4);
}

#[test]
fn divide() {
    let (_, interpreter) = interpreter();
    // Divide (7, 2, Local0, Local1); Return (Local0 + Local1 * 10)
    let body = cat(&[
        &[0x78],
        &integer(7),
        &integer(2),
        &[LOCAL0, LOCAL1],
        &ret(&cat(&[&[0x72, LOCAL0], &[0x77, LOCAL1], &integer(10), &[0x00], &[0x00]])),
    ]);
    assert_eq!(integer_value(&interpreter.execute_method(&body).unwrap()), 31);

    let by_zero = cat(&[&[0x78], &integer(7), &integer(0), &[0x00, 0x00]]);
    assert_eq!(interpreter.execute_method(&by_zero).err(), Some(AmlError::DivideByZero));
}

#[test]
fn mid_of_string() {
    let (_, interpreter) = interpreter();
    let body = ret(&cat(&[&[0x9e], &string("abcdef"), &integer(2), &integer(3), &[0x00]]));
    assert_eq!(interpreter.execute_method(&body).unwrap().lock().as_string().unwrap(), "cde");
}

#[test]
fn package_name_references() {
    let (_, interpreter) = interpreter();
    let table =
        cat(&[&name("FOO", &integer(1)), &name("PKG", &package(&[name_string("FOO"), name_string("BAR")]))]);
    interpreter.load_table(&table).unwrap();

    let package = get(&interpreter, "\\PKG");
    let Object::Package(ref elements) = *package.lock() else { panic!("PKG isn't a package") };
    assert!(matches!(*elements[0].lock(), Object::Reference { .. }));
    assert!(matches!(*elements[1].lock(), Object::String(_)));
}

#[test]
fn circular_references() {
    let (_, interpreter) = interpreter();
    let table = cat(&[&name("PKGA", &package(&[integer(0)])), &name("PKGB", &package(&[integer(0)]))]);
    interpreter.load_table(&table).unwrap();

    let index = |name: &str| cat(&[&[0x88], &name_string(name), &integer(0), &[0x00]]);
    let body = cat(&[
        &store(&index("PKGB"), &index("PKGA")),
        &store(&index("PKGA"), &index("PKGB")),
        &ret(&cat(&[&[0x83], &index("PKGA")])),
    ]);
    assert_eq!(interpreter.execute_method(&body).err(), Some(AmlError::CircularReference));
}

#[test]
fn self_indexing_package_does_not_hang() {
    let (sender, receiver) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let (_, interpreter) = interpreter();
        interpreter.load_table(&name("PKG", &package(&[integer(0)]))).unwrap();

        // Store (Index (PKG, 0), PKG) leaves PKG holding a reference into itself
        let index = cat(&[&[0x88], &name_string("PKG"), &integer(0), &[0x00]]);
        interpreter.execute_method(&store(&index, &name_string("PKG"))).unwrap();

        let object_type = interpreter.execute_method(&ret(&cat(&[&[0x8e], &name_string("PKG")]))).err();
        let size = interpreter.execute_method(&ret(&cat(&[&[0x87], &name_string("PKG")]))).is_err();
        let deref = interpreter.execute_method(&ret(&cat(&[&[0x83], &name_string("PKG")]))).is_err();
        let _ = sender.send((object_type, size, deref));
    });

    let (object_type, size, deref) = receiver.recv_timeout(Duration::from_secs(5)).expect("interpreter hung");
    assert_eq!(object_type, Some(AmlError::CircularReference));
    assert!(size);
    assert!(deref);
}

#[test]
fn high_bytes_stored_into_strings() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&name("STR", &string("abc"))).unwrap();

    let index = cat(&[&[0x88], &name_string("STR"), &integer(0), &[0x00]]);
    interpreter.execute_method(&store(&integer(0xff), &index)).unwrap();

    let size = ret(&cat(&[&[0x87], &name_string("STR")]));
    assert_eq!(integer_value(&interpreter.execute_method(&size).unwrap()), 3);
    let byte = ret(&cat(&[&[0x83], &index]));
    assert_eq!(integer_value(&interpreter.execute_method(&byte).unwrap()), 0xff);
    assert!(matches!(*get(&interpreter, "\\STR").lock(), Object::String(ref bytes) if bytes == &[0xff, b'b', b'c']));
}

#[test]
fn recovers_from_invalid_opcodes_in_tables() {
    let (_, interpreter) = interpreter();
    let table = cat(&[
        &name("FOO", &integer(1)),
        &[0x03],
        &name("BAR", &integer(2)),
        &scope("\\_SB", &cat(&[&name("X", &integer(3)), &[0x03], &name("Y", &integer(4))])),
    ]);
    interpreter.load_table(&table).unwrap();

    assert_eq!(integer_value(&get(&interpreter, "\\FOO")), 1);
    assert_eq!(integer_value(&get(&interpreter, "\\BAR")), 2);
    assert_eq!(integer_value(&get(&interpreter, "\\_SB.X")), 3);
    assert_eq!(integer_value(&get(&interpreter, "\\_SB.Y")), 4);
}

#[test]
fn invalid_methods_are_rejected() {
    let handler = TestHandler::new();
    let config = InterpreterConfig { parse_policy: ParsePolicy::AtInit, ..InterpreterConfig::default() };
    let interpreter = Interpreter::with_config(handler, 2, config);

    let table = cat(&[&method("BAD_", 0, &[0x03]), &method("GOOD", 0, &ret(&integer(1)))]);
    interpreter.load_table(&table).unwrap();

    assert_eq!(interpreter.invoke_method(path("\\BAD_"), vec![]).err(), Some(AmlError::InvalidMethodBody));
    assert_eq!(integer_value(&interpreter.invoke_method(path("\\GOOD"), vec![]).unwrap()), 1);
}

#[test]
fn invalid_methods_are_rejected_on_first_call() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&method("BAD_", 0, &[0x03])).unwrap();

    assert_eq!(interpreter.invoke_method(path("\\BAD_"), vec![]).err(), Some(AmlError::InvalidMethodBody));
    assert_eq!(interpreter.invoke_method(path("\\BAD_"), vec![]).err(), Some(AmlError::InvalidMethodBody));
}

#[test]
fn method_locals_are_removed() {
    let (_, interpreter) = interpreter();
    let table = method("MAIN", 0, &cat(&[&name("TMP", &integer(5)), &ret(&name_string("TMP"))]));
    interpreter.load_table(&table).unwrap();

    assert_eq!(integer_value(&interpreter.invoke_method(path("\\MAIN"), vec![]).unwrap()), 5);
    assert!(interpreter.namespace.lock().get(path("\\MAIN.TMP")).is_err());
}

#[test]
fn table_buffer_fields() {
    let (_, interpreter) = interpreter();
    let table = cat(&[
        &name("BUF", &buffer(&[1, 2, 3, 4])),
        &[0x8b],
        &name_string("BUF"),
        &integer(1),
        &name_string("WRD"),
    ]);
    interpreter.load_table(&table).unwrap();

    assert_eq!(integer_value(&interpreter.invoke_method(path("\\WRD"), vec![]).unwrap()), 0x0302);

    interpreter.execute_method(&store(&integer(0xbeef), &name_string("WRD"))).unwrap();
    assert_eq!(get(&interpreter, "\\BUF").lock().as_buffer().unwrap(), &[1, 0xef, 0xbe, 4]);
}

#[test]
fn memory_fields() {
    let (handler, interpreter) = interpreter();
    let region = cat(&[&[0x5b, 0x80], &name_string("MEM"), &[0x00], &integer(0x1000), &integer(0x10)]);
    // Field (MEM, ByteAcc, NoLock, Preserve) { FLD1, 4, FLD2, 4, FLD3, 8 }
    let field = pkg(&[0x5b, 0x81], &cat(&[&name_string("MEM"), &[0x01], b"FLD1", &[4], b"FLD2", &[4], b"FLD3", &[8]]));
    interpreter.load_table(&cat(&[&region, &field])).unwrap();

    handler.write_memory(0x1000, &[0xf0, 0x00]);
    interpreter.execute_method(&store(&integer(5), &name_string("FLD1"))).unwrap();
    interpreter.execute_method(&store(&integer(0xab), &name_string("FLD3"))).unwrap();
    assert_eq!(handler.read_memory(0x1000, 2), vec![0xf5, 0xab]);

    assert_eq!(integer_value(&interpreter.invoke_method(path("\\FLD2"), vec![]).unwrap()), 0xf);
}

struct CountingHandler {
    activations: Arc<AtomicUsize>,
    deactivations: Arc<AtomicUsize>,
}

impl RegionHandler for CountingHandler {
    fn setup(&self, _: &Interpreter, _: &OpRegion, function: SetupFunction) -> Result<u64, AmlError> {
        match function {
            SetupFunction::Activate => self.activations.fetch_add(1, Ordering::SeqCst),
            SetupFunction::Deactivate => self.deactivations.fetch_add(1, Ordering::SeqCst),
        };
        Ok(0x40)
    }

    fn read(&self, _: &Interpreter, _: &OpRegion, context: u64, offset: u64, _: u8) -> Result<u64, AmlError> {
        Ok(context + offset + 2)
    }

    fn write(&self, _: &Interpreter, _: &OpRegion, _: u64, _: u64, _: u8, _: u64) -> Result<(), AmlError> {
        Ok(())
    }
}

#[test]
fn region_handlers_and_reg() {
    let (_, interpreter) = interpreter();
    let device_body = cat(&[
        &[0x5b, 0x80],
        &name_string("ECOR"),
        &[0x03],
        &integer(0),
        &integer(0x10),
        &pkg(&[0x5b, 0x81], &cat(&[&name_string("ECOR"), &[0x01], b"FLD0", &[8]])),
        &method("_REG", 2, &store(&[ARG1], &name_string("\\REGV"))),
    ]);
    let table = cat(&[&name("REGV", &integer(0xff)), &device("EC0", &device_body)]);
    interpreter.load_table(&table).unwrap();

    let activations = Arc::new(AtomicUsize::new(0));
    let deactivations = Arc::new(AtomicUsize::new(0));
    let handler = CountingHandler { activations: activations.clone(), deactivations: deactivations.clone() };
    interpreter.install_region_handler(path("\\EC0"), RegionSpace::EmbeddedControl, handler).unwrap();
    assert_eq!(integer_value(&get(&interpreter, "\\REGV")), 1);

    assert_eq!(integer_value(&interpreter.invoke_method(path("\\EC0.FLD0"), vec![]).unwrap()), 0x42);
    assert_eq!(integer_value(&interpreter.invoke_method(path("\\EC0.FLD0"), vec![]).unwrap()), 0x42);
    assert_eq!(activations.load(Ordering::SeqCst), 1);

    interpreter.remove_region_handler(path("\\EC0"), RegionSpace::EmbeddedControl).unwrap();
    assert_eq!(integer_value(&get(&interpreter, "\\REGV")), 0);
    assert_eq!(deactivations.load(Ordering::SeqCst), 1);
}

#[test]
fn mutex_order_is_enforced() {
    let (_, interpreter) = interpreter();
    let acquire = |name: &str| cat(&[&[0x5b, 0x23], &name_string(name), &[0xff, 0xff]]);
    let table = cat(&[
        &[0x5b, 0x01],
        &name_string("MTXA"),
        &[2],
        &[0x5b, 0x01],
        &name_string("MTXB"),
        &[1],
        &method("MAIN", 0, &cat(&[&acquire("MTXA"), &acquire("MTXB")])),
    ]);
    interpreter.load_table(&table).unwrap();

    assert_eq!(interpreter.invoke_method(path("\\MAIN"), vec![]).err(), Some(AmlError::MutexOrder));

    // Mutexes left held are released when the invocation returns
    let mutex = get(&interpreter, "\\MTXA");
    let Object::Mutex(ref inner) = *mutex.lock() else { panic!("MTXA isn't a mutex") };
    assert!(inner.owner().is_none());
}

#[test]
fn serialized_methods() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&method_with_flags("SER", 0x08, &ret(&integer(1)))).unwrap();

    for _ in 0..2 {
        assert_eq!(integer_value(&interpreter.invoke_method(path("\\SER"), vec![]).unwrap()), 1);
    }

    let method = get(&interpreter, "\\SER");
    let Object::Method(ref inner) = *method.lock() else { panic!("SER isn't a method") };
    let serialization = inner.serialization.clone().unwrap();
    let Object::Mutex(ref mutex) = *serialization.lock() else { panic!("not a mutex") };
    assert!(mutex.owner().is_none());
}

#[test]
fn events_across_threads() {
    let (_, interpreter) = interpreter();
    let table = cat(&[
        &[0x5b, 0x02],
        &name_string("EVT"),
        &method("WAIT", 0, &ret(&cat(&[&[0x5b, 0x25], &name_string("EVT"), &integer(0xffff)]))),
        &method("SIGN", 0, &cat(&[&[0x5b, 0x24], &name_string("EVT")])),
    ]);
    interpreter.load_table(&table).unwrap();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| interpreter.invoke_method(path("\\WAIT"), vec![]));
        std::thread::sleep(Duration::from_millis(20));
        interpreter.invoke_method(path("\\SIGN"), vec![]).unwrap();

        let result = waiter.join().unwrap().unwrap();
        assert_eq!(integer_value(&result), 0);
    });
}

#[test]
fn notify_device() {
    let (_, interpreter) = interpreter();
    interpreter
        .load_table(&cat(&[&scope("\\_SB", &device("DEV0", &[])), &name("INT", &integer(0))]))
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    interpreter
        .install_notify_handler(path("\\_SB.DEV0"), move |target: &AmlName, value: u64| {
            record.lock().unwrap().push((target.as_string(), value));
        })
        .unwrap();

    interpreter.execute_method(&cat(&[&[0x86], &name_string("\\_SB.DEV0"), &integer(0x80)])).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(String::from("\\_SB_.DEV0"), 0x80)]);

    let bad_target = cat(&[&[0x86], &name_string("INT"), &integer(0x80)]);
    assert_eq!(interpreter.execute_method(&bad_target).err(), Some(AmlError::InvalidNotifyTarget));
}

#[test]
fn gpe_methods() {
    let (_, interpreter) = interpreter();
    let table = cat(&[&name("GPEF", &integer(0)), &scope("\\_GPE", &method("_L05", 0, &store(&[0x01], &name_string("\\GPEF"))))]);
    interpreter.load_table(&table).unwrap();

    interpreter.handle_gpe(5, GpeTrigger::Level).unwrap();
    assert_eq!(integer_value(&get(&interpreter, "\\GPEF")), 1);

    assert_eq!(interpreter.handle_gpe(6, GpeTrigger::Level), Err(AmlError::NoSuchHandler));
}

#[test]
fn gpe_handlers_take_priority() {
    let (_, interpreter) = interpreter();
    let handled = Arc::new(AtomicUsize::new(0));
    let count = handled.clone();
    interpreter
        .install_gpe_handler(9, move |_: u8| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    interpreter.handle_gpe(9, GpeTrigger::Edge).unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
fn host_global_lock() {
    let handler = TestHandler::with_global_lock();
    let interpreter = Interpreter::new(handler.clone(), 2);

    interpreter.acquire_global_lock(0xffff).unwrap();
    assert_eq!(handler.global_lock_field() & 0b10, 0b10);

    interpreter.release_global_lock().unwrap();
    assert_eq!(handler.global_lock_field(), 0);
}

#[test]
fn global_lock_waits_are_bounded() {
    let handler = TestHandler::with_global_lock();
    let interpreter = Interpreter::new(handler.clone(), 2);
    // Firmware owns the lock and never gives it up
    handler.set_global_lock_field(0b10);

    let done = std::sync::atomic::AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| {
            // Spurious wakeups, each a millisecond apart
            while !done.load(Ordering::Relaxed) {
                interpreter.handle_global_lock_interrupt();
                handler.stall(1000);
                std::thread::yield_now();
            }
        });

        assert_eq!(interpreter.acquire_global_lock(5), Err(AmlError::Timeout));
        done.store(true, Ordering::Relaxed);
    });
}

#[test]
fn debug_and_fatal() {
    let (handler, interpreter) = interpreter();

    interpreter.execute_method(&store(&string("hi"), &[0x5b, 0x31])).unwrap();
    let output = handler.debug_output();
    assert_eq!(output.len(), 1);
    assert!(output[0].contains("hi"));

    let fatal = cat(&[&[0x5b, 0x32, 1], &[2, 0, 0, 0], &integer(3)]);
    assert_eq!(interpreter.execute_method(&fatal).err(), Some(AmlError::FatalError));
    assert_eq!(handler.fatal_errors(), vec![(1, 2, 3)]);
}

#[test]
fn sleep_drops_to_the_host() {
    let (handler, interpreter) = interpreter();
    interpreter.execute_method(&cat(&[&[0x5b, 0x22], &integer(5)])).unwrap();
    assert_eq!(handler.slept(), 5);
}

#[test]
fn infinite_loops_are_stopped() {
    let handler = TestHandler::new();
    let config = InterpreterConfig { max_loop_iterations: 100, ..InterpreterConfig::default() };
    let interpreter = Interpreter::with_config(handler, 2, config);

    assert_eq!(interpreter.execute_method(&while_loop(&[0x01], &[])).err(), Some(AmlError::InfiniteLoop));
}

#[test]
fn runaway_recursion_is_stopped() {
    let (_, interpreter) = interpreter();
    interpreter.load_table(&method("RECU", 0, &name_string("RECU"))).unwrap();

    assert_eq!(interpreter.invoke_method(path("\\RECU"), vec![]).err(), Some(AmlError::CallDepthExceeded));
}

#[test]
fn processors() {
    let (_, interpreter) = interpreter();
    let table = pkg(&[0x5b, 0x83], &cat(&[&name_string("CPU0"), &[1], &[0x10, 0x04, 0, 0], &[6]]));
    interpreter.load_table(&table).unwrap();

    let cpu = get(&interpreter, "\\CPU0");
    assert!(matches!(*cpu.lock(), Object::Processor { proc_id: 1, pblk_address: 0x410, pblk_length: 6 }));
}

#[derive(Clone, Debug)]
enum Tree {
    Leaf(u64),
    Node(Vec<Tree>),
}

fn tree() -> impl Strategy<Value = Tree> {
    let leaf = any::<u64>().prop_map(Tree::Leaf);
    leaf.prop_recursive(4, 32, 4, |inner| prop::collection::vec(inner, 0..4).prop_map(Tree::Node))
}

fn build(tree: &Tree, weak: &mut Vec<WeakObject>) -> WrappedObject {
    let object = match tree {
        Tree::Leaf(value) => Object::Integer(*value).wrap(),
        Tree::Node(children) => {
            Object::Package(children.iter().map(|child| build(child, weak)).collect()).wrap()
        }
    };
    weak.push(object.downgrade());
    object
}

fn check_counts(object: &WrappedObject) {
    assert_eq!(object.ref_count(), 1);
    if let Object::Package(ref elements) = *object.lock() {
        for element in elements {
            check_counts(element);
        }
    }
}

proptest! {
    #[test]
    fn deep_copies_are_independent(tree in tree()) {
        let mut weak = Vec::new();
        let root = build(&tree, &mut weak);

        let copy = root.deep_copy().unwrap();
        prop_assert!(!copy.ptr_eq(&root));
        check_counts(&root);
        check_counts(&copy);

        drop(root);
        prop_assert!(weak.iter().all(|weak| weak.upgrade().is_none()));
    }
}
