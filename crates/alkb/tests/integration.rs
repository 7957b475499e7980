use alkb_bytecode::{loader, writer, Constant, Function, Insn, Module, Opcode, REG_NONE};
use alkb_vm::{Value, Vm, VmConfig, VmError};

fn func(
    name: &str,
    num_params: u32,
    reg_count: u16,
    consts: Vec<Constant>,
    code: Vec<Insn>,
) -> Function {
    Function {
        name: name.to_string(),
        num_params,
        reg_count,
        consts,
        code,
    }
}

fn run(module: &Module, entry: &str) -> Result<Value, VmError> {
    let mut vm = Vm::new();
    vm.bind_module(module);
    vm.run(entry, &[])
}

fn run_no_jit(module: &Module, entry: &str) -> Result<Value, VmError> {
    let mut vm = Vm::with_config(VmConfig {
        jit: false,
        ..Default::default()
    });
    vm.bind_module(module);
    vm.run(entry, &[])
}

/// Counting loop: sum = 1 + 2 + ... + (limit - 1).
fn sum_loop_module(limit: i32) -> Module {
    Module::new(vec![func(
        "main",
        0,
        6,
        vec![Constant::Int(0), Constant::Int(1), Constant::Int(limit)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0), // r0 = sum = 0
            Insn::abx(Opcode::LoadK, 1, 1), // r1 = i = 1
            Insn::abx(Opcode::LoadK, 2, 1), // r2 = 1
            Insn::abx(Opcode::LoadK, 3, 2), // r3 = limit
            Insn::abc(Opcode::LtI, 4, 1, 3),
            Insn::asbx(Opcode::JmpF, 4, 3), // exit -> 9
            Insn::abc(Opcode::AddI, 0, 0, 1),
            Insn::abc(Opcode::AddI, 1, 1, 2),
            Insn::asbx(Opcode::Jmp, 0, -5), // back to 4
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )])
}

// ---
// Arithmetic, branches and the hot path
// ---

#[test]
fn sum_loop_returns_5050() {
    let result = run(&sum_loop_module(101), "main").unwrap();
    assert!(matches!(result, Value::Int(5050)));
}

#[test]
fn sum_loop_matches_without_jit() {
    let result = run_no_jit(&sum_loop_module(101), "main").unwrap();
    assert!(matches!(result, Value::Int(5050)));
}

#[test]
fn hot_region_is_promoted_past_the_threshold() {
    // 200 loop iterations: the back-edge is observed 200 times, the
    // region is compiled on observation 101 and entered afterwards.
    let module = sum_loop_module(201);
    let mut vm = Vm::new();
    vm.bind_module(&module);
    let result = vm.run("main", &[]).unwrap();
    assert!(matches!(result, Value::Int(20100)));

    let stats = vm.jit_stats();
    assert_eq!(stats.regions_compiled, 1);
    assert_eq!(stats.regions_rejected, 0);
    assert_eq!(stats.region_invocations, 99);
}

#[test]
fn promotion_needs_threshold_plus_one_observations() {
    // Exactly 100 back-edge observations: still cold.
    let module = sum_loop_module(101);
    let mut vm = Vm::new();
    vm.bind_module(&module);
    vm.run("main", &[]).unwrap();
    assert_eq!(vm.jit_stats().regions_compiled, 0);
}

#[test]
fn jmp_zero_advances_one_step() {
    let module = Module::new(vec![func(
        "main",
        0,
        1,
        vec![Constant::Int(7)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::asbx(Opcode::Jmp, 0, 0),
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Int(7)));
}

#[test]
fn integer_division_by_zero_fails() {
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![Constant::Int(10), Constant::Int(0)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::DivI, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::DivisionByZero)
    ));
}

#[test]
fn integer_arithmetic_wraps() {
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![Constant::Int(i32::MAX), Constant::Int(1)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::AddI, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main").unwrap(),
        Value::Int(i32::MIN)
    ));
}

#[test]
fn float_pipeline() {
    // (1.5 + 2.25) * float(3) = 11.25
    let module = Module::new(vec![func(
        "main",
        0,
        5,
        vec![
            Constant::Float(1.5),
            Constant::Float(2.25),
            Constant::Int(3),
        ],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::AddF, 2, 0, 1),
            Insn::abx(Opcode::LoadK, 3, 2),
            Insn::abc(Opcode::I2F, 4, 3, 0),
            Insn::abc(Opcode::MulF, 2, 2, 4),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Float(f) if f == 11.25));
}

#[test]
fn float_remainder_is_towards_zero() {
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![Constant::Float(5.5), Constant::Float(2.0)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::ModF, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Float(f) if f == 1.5));
}

#[test]
fn boolean_operators() {
    // !(true && false) || false = true
    let module = Module::new(vec![func(
        "main",
        0,
        4,
        vec![Constant::Bool(true), Constant::Bool(false)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::And, 2, 0, 1),
            Insn::abc(Opcode::Not, 2, 2, 0),
            Insn::abc(Opcode::Or, 3, 2, 1),
            Insn::abc(Opcode::Ret, 3, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Bool(true)));
}

#[test]
fn conditional_jump_requires_bool() {
    let module = Module::new(vec![func(
        "main",
        0,
        1,
        vec![Constant::Int(1)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::asbx(Opcode::JmpT, 0, 1),
            Insn::abc(Opcode::Ret, REG_NONE, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::Type { expected: "bool", .. })
    ));
}

#[test]
fn string_equality_is_by_content() {
    // Two distinct string objects with equal bytes compare equal.
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![
            Constant::Str("hello".to_string()),
            Constant::Str("hello".to_string()),
        ],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::Eq, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Bool(true)));
}

// ---
// Arrays and natives
// ---

#[test]
fn array_swap_via_native() {
    // arr = [42, 7, 99]; Swap(arr, 0, 2); return arr[0]
    let module = Module::new(vec![func(
        "main",
        0,
        8,
        vec![
            Constant::Int(3),
            Constant::Int(0),
            Constant::Int(42),
            Constant::Int(1),
            Constant::Int(7),
            Constant::Int(2),
            Constant::Int(99),
        ],
        vec![
            Insn::abx(Opcode::LoadK, 3, 0),
            Insn::abc(Opcode::NewArr, 0, 3, 0),
            Insn::abx(Opcode::LoadK, 4, 1),
            Insn::abx(Opcode::LoadK, 5, 2),
            Insn::abc(Opcode::SetElem, 0, 4, 5),
            Insn::abx(Opcode::LoadK, 4, 3),
            Insn::abx(Opcode::LoadK, 5, 4),
            Insn::abc(Opcode::SetElem, 0, 4, 5),
            Insn::abx(Opcode::LoadK, 4, 5),
            Insn::abx(Opcode::LoadK, 5, 6),
            Insn::abc(Opcode::SetElem, 0, 4, 5),
            // stage Swap(arr, 0, 2) in R0..R2
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abx(Opcode::LoadK, 2, 5),
            Insn::abc(Opcode::CallNative, 6, 3, 3),
            Insn::abx(Opcode::LoadK, 4, 1),
            Insn::abc(Opcode::GetElem, 7, 0, 4),
            Insn::abc(Opcode::Ret, 7, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Int(99)));
}

#[test]
fn max_and_min_natives_promote_to_float() {
    // Max(3, 2.5) staged in R0, R1
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![Constant::Int(3), Constant::Float(2.5)],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::CallNative, 2, 4, 2),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Float(f) if f == 3.0));
}

#[test]
fn unknown_native_id_is_a_link_error() {
    let module = Module::new(vec![func(
        "main",
        0,
        1,
        vec![],
        vec![
            Insn::abc(Opcode::CallNative, 0, 200, 0),
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::UnknownNative(200))
    ));
}

#[test]
fn empty_array_access_is_a_bounds_error() {
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![Constant::Int(0)],
        vec![
            Insn::abx(Opcode::LoadK, 1, 0),
            Insn::abc(Opcode::NewArr, 0, 1, 0),
            Insn::abc(Opcode::GetElem, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::IndexOutOfBounds { index: 0, len: 0 })
    ));
}

#[test]
fn negative_array_length_is_rejected() {
    let module = Module::new(vec![func(
        "main",
        0,
        2,
        vec![Constant::Int(-1)],
        vec![
            Insn::abx(Opcode::LoadK, 1, 0),
            Insn::abc(Opcode::NewArr, 0, 1, 0),
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::NegativeArrayLength(-1))
    ));
}

// ---
// Objects and the field-slot registry
// ---

#[test]
fn object_field_roundtrip() {
    let module = Module::new(vec![func(
        "main",
        0,
        4,
        vec![
            Constant::ClassRef {
                name: "Pair".to_string(),
            },
            Constant::FieldRef {
                class_name: "Pair".to_string(),
                field_name: "x".to_string(),
            },
            Constant::Int(17),
        ],
        vec![
            Insn::abx(Opcode::NewObj, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abx(Opcode::LoadK, 2, 2),
            Insn::abc(Opcode::SetField, 0, 1, 2),
            Insn::abc(Opcode::GetField, 3, 0, 1),
            Insn::abc(Opcode::Ret, 3, 0, 0),
        ],
    )]);

    let mut vm = Vm::new();
    vm.bind_module(&module);
    let result = vm.run("main", &[]).unwrap();
    assert!(matches!(result, Value::Int(17)));
    assert_eq!(vm.field_slot("Pair", "x"), Some(0));
    assert_eq!(vm.field_slot("Pair", "y"), None);
}

#[test]
fn unwritten_field_reads_nil() {
    let module = Module::new(vec![func(
        "main",
        0,
        3,
        vec![
            Constant::ClassRef {
                name: "Box".to_string(),
            },
            Constant::FieldRef {
                class_name: "Box".to_string(),
                field_name: "value".to_string(),
            },
        ],
        vec![
            Insn::abx(Opcode::NewObj, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::GetField, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Nil));
}

#[test]
fn field_slots_are_per_vm() {
    let mut vm1 = Vm::new();
    let mut vm2 = Vm::new();

    // vm1 resolves y first, vm2 resolves x first.
    let make = |first: &str| {
        Module::new(vec![func(
            "main",
            0,
            3,
            vec![
                Constant::ClassRef {
                    name: "Pair".to_string(),
                },
                Constant::FieldRef {
                    class_name: "Pair".to_string(),
                    field_name: first.to_string(),
                },
            ],
            vec![
                Insn::abx(Opcode::NewObj, 0, 0),
                Insn::abx(Opcode::LoadK, 1, 1),
                Insn::abc(Opcode::GetField, 2, 0, 1),
                Insn::abc(Opcode::Ret, 2, 0, 0),
            ],
        )])
    };

    let m1 = make("y");
    let m2 = make("x");
    vm1.bind_module(&m1);
    vm2.bind_module(&m2);
    vm1.run("main", &[]).unwrap();
    vm2.run("main", &[]).unwrap();

    assert_eq!(vm1.field_slot("Pair", "y"), Some(0));
    assert_eq!(vm1.field_slot("Pair", "x"), None);
    assert_eq!(vm2.field_slot("Pair", "x"), Some(0));
}

// ---
// Calls
// ---

fn square() -> Function {
    func(
        "square",
        1,
        2,
        vec![],
        vec![
            Insn::abc(Opcode::MulI, 1, 0, 0),
            Insn::abc(Opcode::Ret, 1, 0, 0),
        ],
    )
}

#[test]
fn cross_function_call_through_pool() {
    let main = func(
        "main",
        0,
        2,
        vec![
            Constant::Int(5),
            Constant::FuncRef {
                name: "square".to_string(),
                arity: 1,
            },
        ],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::CallK, 1, 1),
            Insn::abc(Opcode::Ret, 1, 0, 0),
        ],
    );
    let module = Module::new(vec![main, square()]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Int(25)));
}

#[test]
fn direct_call_through_register() {
    let main = func(
        "main",
        0,
        3,
        vec![
            Constant::Int(6),
            Constant::FuncRef {
                name: "square".to_string(),
                arity: 1,
            },
        ],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::LoadK, 1, 1),
            Insn::abc(Opcode::Call, 2, 1, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ],
    );
    let module = Module::new(vec![main, square()]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Int(36)));
}

#[test]
fn recursion_nests_frames() {
    let fact = func(
        "fact",
        1,
        6,
        vec![
            Constant::Int(1),
            Constant::FuncRef {
                name: "fact".to_string(),
                arity: 1,
            },
        ],
        vec![
            Insn::abx(Opcode::LoadK, 1, 0),
            Insn::abc(Opcode::LeI, 2, 0, 1),
            Insn::asbx(Opcode::JmpF, 2, 1),
            Insn::abc(Opcode::Ret, 1, 0, 0),
            Insn::abc(Opcode::SubI, 3, 0, 1),
            Insn::abc(Opcode::Mov, 4, 0, 0),
            Insn::abc(Opcode::Mov, 0, 3, 0),
            Insn::abx(Opcode::CallK, 5, 1),
            Insn::abc(Opcode::MulI, 5, 4, 5),
            Insn::abc(Opcode::Ret, 5, 0, 0),
        ],
    );
    let main = func(
        "main",
        0,
        2,
        vec![
            Constant::Int(5),
            Constant::FuncRef {
                name: "fact".to_string(),
                arity: 1,
            },
        ],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abx(Opcode::CallK, 1, 1),
            Insn::abc(Opcode::Ret, 1, 0, 0),
        ],
    );
    let module = Module::new(vec![main, fact]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Int(120)));
}

#[test]
fn unknown_function_is_a_link_error() {
    let module = Module::new(vec![func(
        "main",
        0,
        1,
        vec![Constant::FuncRef {
            name: "missing".to_string(),
            arity: 0,
        }],
        vec![
            Insn::abx(Opcode::CallK, 0, 0),
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::UnknownFunction(name)) if name == "missing"
    ));
}

#[test]
fn missing_entry_is_a_link_error() {
    let module = Module::new(vec![square()]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::MissingEntry(_))
    ));
}

#[test]
fn entry_arguments_are_bounded_by_the_window() {
    let module = Module::new(vec![square()]);
    let mut vm = Vm::new();
    vm.bind_module(&module);
    let err = vm.run("square", &[Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(matches!(err, Err(VmError::TooManyArgs { argc: 3, regs: 2 })));
}

#[test]
fn entry_arguments_land_in_low_registers() {
    let module = Module::new(vec![square()]);
    let mut vm = Vm::new();
    vm.bind_module(&module);
    let result = vm.run("square", &[Value::Int(9)]).unwrap();
    assert!(matches!(result, Value::Int(81)));
}

#[test]
fn ret_sentinel_returns_nil() {
    let module = Module::new(vec![func(
        "main",
        0,
        0,
        vec![],
        vec![Insn::abc(Opcode::Ret, REG_NONE, 0, 0)],
    )]);
    assert!(matches!(run(&module, "main").unwrap(), Value::Nil));
}

#[test]
fn running_off_the_end_is_a_runtime_error() {
    let module = Module::new(vec![func(
        "main",
        0,
        1,
        vec![],
        vec![Insn::abc(Opcode::Nop, 0, 0, 0)],
    )]);
    assert!(matches!(
        run(&module, "main"),
        Err(VmError::PcOutOfBounds(1))
    ));
}

#[test]
fn unknown_opcode_is_a_runtime_error() {
    let module = Module::new(vec![func("main", 0, 1, vec![], vec![Insn(99)])]);
    assert!(matches!(run(&module, "main"), Err(VmError::UnknownOpcode(99))));
}

// ---
// Garbage collection
// ---

#[test]
fn gc_reclaims_unreachable_allocations() {
    // Allocate 10,000 throwaway arrays, each discarded on the next
    // iteration by overwriting its only reference.
    let module = Module::new(vec![func(
        "main",
        0,
        6,
        vec![
            Constant::Int(0),
            Constant::Int(1),
            Constant::Int(10_000),
            Constant::Int(4),
        ],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0), // r0 = i = 0
            Insn::abx(Opcode::LoadK, 1, 1), // r1 = 1
            Insn::abx(Opcode::LoadK, 2, 2), // r2 = 10000
            Insn::abx(Opcode::LoadK, 3, 3), // r3 = 4
            Insn::abc(Opcode::LtI, 5, 0, 2),
            Insn::asbx(Opcode::JmpF, 5, 3), // exit -> 9
            Insn::abc(Opcode::NewArr, 4, 3, 0),
            Insn::abc(Opcode::AddI, 0, 0, 1),
            Insn::asbx(Opcode::Jmp, 0, -5),
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )]);

    let mut vm = Vm::new();
    vm.bind_module(&module);
    let result = vm.run("main", &[]).unwrap();
    assert!(matches!(result, Value::Int(10_000)));

    let stats = vm.gc_stats();
    assert!(stats.collections >= 1, "no collection ran");
    assert!(
        stats.total_bytes_freed > alkb_vm::INITIAL_GC_THRESHOLD,
        "freed only {} bytes",
        stats.total_bytes_freed
    );
    // Everything except interned constants is garbage by now.
    vm.collect_garbage();
    assert!(vm.live_objects() <= 4);
}

#[test]
fn force_collect_keeps_bound_constants() {
    let module = Module::new(vec![func(
        "main",
        0,
        1,
        vec![Constant::Str("still here".to_string())],
        vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abc(Opcode::Ret, 0, 0, 0),
        ],
    )]);
    let mut vm = Vm::new();
    vm.bind_module(&module);

    // A collection before the first frame must not sweep pool objects.
    vm.collect_garbage();
    let result = vm.run("main", &[]).unwrap();
    match result {
        Value::Obj(o) => assert_eq!(o.as_str(), Some("still here")),
        other => panic!("expected a string, got {other}"),
    }
}

// ---
// Loader end-to-end
// ---

#[test]
fn module_survives_encode_and_reload() {
    let module = sum_loop_module(101);
    let bytes = writer::encode(&module, 2);
    let reloaded = loader::parse(&bytes).unwrap();
    assert_eq!(reloaded, module);
    assert!(matches!(run(&reloaded, "main").unwrap(), Value::Int(5050)));
}

#[test]
fn corrupt_function_header_never_executes() {
    let module = sum_loop_module(101);
    let mut bytes = writer::encode(&module, 1);
    // Break the FH size field (right after magic, version, FN, count
    // and the FH tag).
    let fh_size_at = 4 + 2 + 2 + 4 + 2;
    bytes[fh_size_at + 3] ^= 0x40;
    assert!(loader::parse(&bytes).is_err());
}

#[test]
fn legacy_module_runs_end_to_end() {
    // A bare code section after the version word: one anonymous entry
    // function with inferred registers.
    let code = [
        Insn::abx(Opcode::LoadK, 0, 0).word(),
        Insn::abc(Opcode::Ret, 0, 0, 0).word(),
    ];
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"ALKB");
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(b"CD");
    bytes.extend_from_slice(&(code.len() as u32 * 4).to_be_bytes());
    for w in code {
        bytes.extend_from_slice(&w.to_be_bytes());
    }

    let module = loader::parse(&bytes).unwrap();
    // The legacy pool is empty, so LOADK faults at run time; the module
    // itself binds and starts.
    let mut vm = Vm::new();
    vm.bind_module(&module);
    assert!(matches!(
        vm.run("main", &[]),
        Err(VmError::ConstOutOfBounds(0))
    ));
}

#[test]
fn jit_and_interpreter_agree_on_object_loops() {
    // A hot loop whose body allocates and mutates through runtime
    // helpers: arr = [i, _]; acc += arr[0]; 300 iterations.
    let make = || {
        Module::new(vec![func(
            "main",
            0,
            9,
            vec![
                Constant::Int(0),
                Constant::Int(1),
                Constant::Int(300),
                Constant::Int(2),
            ],
            vec![
                Insn::abx(Opcode::LoadK, 0, 0),      // r0 = i = 0
                Insn::abx(Opcode::LoadK, 1, 1),      // r1 = 1
                Insn::abx(Opcode::LoadK, 2, 2),      // r2 = 300
                Insn::abx(Opcode::LoadK, 3, 3),      // r3 = 2
                Insn::abx(Opcode::LoadK, 6, 0),      // r6 = acc = 0
                Insn::abx(Opcode::LoadK, 8, 0),      // r8 = 0
                Insn::abc(Opcode::LtI, 5, 0, 2),
                Insn::asbx(Opcode::JmpF, 5, 6),      // exit -> 14
                Insn::abc(Opcode::NewArr, 4, 3, 0),
                Insn::abc(Opcode::SetElem, 4, 8, 0), // arr[0] = i
                Insn::abc(Opcode::GetElem, 7, 4, 8),
                Insn::abc(Opcode::AddI, 6, 6, 7),
                Insn::abc(Opcode::AddI, 0, 0, 1),
                Insn::asbx(Opcode::Jmp, 0, -8),      // back to 6
                Insn::abc(Opcode::Ret, 6, 0, 0),
            ],
        )])
    };

    let mut vm = Vm::new();
    let m = make();
    vm.bind_module(&m);
    let jit_result = vm.run("main", &[]).unwrap();
    assert!(matches!(jit_result, Value::Int(44850)));
    assert_eq!(vm.jit_stats().regions_compiled, 1);
    assert_eq!(vm.jit_stats().region_invocations, 199);

    let plain = run_no_jit(&make(), "main").unwrap();
    assert!(matches!(plain, Value::Int(44850)));
}
