#![allow(dead_code)]

//! Common test utilities shared across integration tests

use ghostscope_dwarf_emit::constants::*;
use ghostscope_dwarf_emit::core::{
    Callee, CompileUnitMeta, DbgOperand, DbgValue, DebugLoc, Expression, FileEntry,
    ForwardedArg, GlobalVariableMeta, LoadedValue, LocalVariable, Register, SubprogramFlags,
    SubprogramMeta, TypeMeta, ValueDescription,
};
use ghostscope_dwarf_emit::{
    DebugModule, DwarfDebug, EmitterConfig, GenericTarget, MachineFunction, MachineInstr,
    MemorySink, SinkOutput,
};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize logging for tests (call once per test)
pub fn init() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("off")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct Fixture {
    pub module: DebugModule,
    pub functions: Vec<MachineFunction>,
}

/// One C unit with a global, `add(x)` whose parameter moves from rdi to
/// rbx halfway through, and `caller` which calls `add(7)`
pub fn sample_module() -> Fixture {
    let mut module = DebugModule::new();
    let file = module.add_file(FileEntry::new("main.c", "/src"));
    let mut meta = CompileUnitMeta::new(file, DW_LANG_C99, "ghostscope-test");
    meta.optimized = true;
    let (cu, cu_scope) = module.add_compile_unit(meta);
    let int = module.add_type(TypeMeta::basic("int", DW_ATE_signed, 32));

    let counter = module.add_global(GlobalVariableMeta {
        name: "counter".to_string(),
        linkage_name: None,
        unit: cu,
        scope: None,
        file: Some(file),
        line: 3,
        ty: Some(int),
        is_local: false,
        symbol: Some("counter".to_string()),
        expr: Expression::new(),
        tls: false,
    });
    module.compile_units[cu.index()].globals.push(counter);

    let add = module.add_subprogram(SubprogramMeta {
        name: "add".to_string(),
        linkage_name: None,
        unit: cu,
        scope: cu_scope,
        parent: cu_scope,
        file: Some(file),
        line: 10,
        scope_line: 10,
        ty: Some(int),
        is_definition: true,
        declaration: None,
        flags: SubprogramFlags {
            external: true,
            prototyped: true,
            ..SubprogramFlags::default()
        },
        retained_nodes: Vec::new(),
    });
    let add_scope = module.subprogram(add).map(|sp| sp.scope).unwrap();
    let x = module.add_variable(LocalVariable {
        name: "x".to_string(),
        scope: add_scope,
        file: Some(file),
        line: 10,
        ty: Some(int),
        arg: Some(1),
        artificial: false,
    });

    let caller = module.add_subprogram(SubprogramMeta {
        name: "caller".to_string(),
        linkage_name: None,
        unit: cu,
        scope: cu_scope,
        parent: cu_scope,
        file: Some(file),
        line: 20,
        scope_line: 20,
        ty: Some(int),
        is_definition: true,
        declaration: None,
        flags: SubprogramFlags {
            external: true,
            all_calls_described: true,
            ..SubprogramFlags::default()
        },
        retained_nodes: Vec::new(),
    });
    let caller_scope = module.subprogram(caller).map(|sp| sp.scope).unwrap();

    let mut add_fn = MachineFunction::new("add", Some(add));
    add_fn.add_block(0);
    let loc = |line| Some(DebugLoc::new(line, 3, add_scope));
    add_fn
        .push(MachineInstr::debug_value(
            DbgValue::new(x, DbgOperand::Register(Register(5))),
            loc(10),
        ))
        .unwrap();
    add_fn
        .push(MachineInstr {
            defs: vec![Register(5)],
            ..MachineInstr::regular(4, loc(11))
        })
        .unwrap();
    add_fn
        .push(MachineInstr::debug_value(
            DbgValue::new(x, DbgOperand::Register(Register(3))),
            loc(11),
        ))
        .unwrap();
    add_fn.push(MachineInstr::regular(2, loc(12))).unwrap();

    let mut caller_fn = MachineFunction::new("caller", Some(caller));
    caller_fn.add_block(0);
    let loc = |line| Some(DebugLoc::new(line, 5, caller_scope));
    caller_fn.push(MachineInstr::regular(4, loc(20))).unwrap();
    caller_fn
        .push(MachineInstr {
            defs: vec![Register(5)],
            describes: Some(ValueDescription {
                dest: Register(5),
                value: LoadedValue::Immediate(7),
                offset: 0,
            }),
            ..MachineInstr::regular(5, loc(21))
        })
        .unwrap();
    let call = caller_fn
        .push(MachineInstr::call(5, loc(21), Callee::Function(add)))
        .unwrap();
    caller_fn.push(MachineInstr::regular(1, loc(22))).unwrap();
    caller_fn.call_site_args.insert(
        call,
        vec![ForwardedArg {
            register: Register(5),
            arg_no: 1,
        }],
    );

    Fixture {
        module,
        functions: vec![add_fn, caller_fn],
    }
}

/// Runs the whole pipeline over the fixture
pub fn emit(fixture: &Fixture, config: &EmitterConfig) -> anyhow::Result<SinkOutput> {
    let target = Arc::new(GenericTarget::x86_64());
    let mut debug = DwarfDebug::new(config, target)?;
    let mut sink = MemorySink::new(debug.options().endian);
    debug.begin_module(&fixture.module)?;
    for func in &fixture.functions {
        debug.emit_function(&fixture.module, func, &mut sink)?;
    }
    debug.end_module(&fixture.module, &mut sink)?;
    sink.finish()
}
