//! IR builders and probes for coroutine lowering tests.
//!
//! The emulated builders mimic a coroutine-unaware front end: the whole
//! protocol is spelled as plain `__coro_*` calls in one straight-line
//! block, and bootstrap normalization is expected to do the rest.

use spindle_core::ir::{
    Block, Body, BlockId, Constant, CoroInst, Function, InstId, InstKind, Module, Signature,
    Terminator, Ty, Value,
};
use spindle_core::Name;

pub fn call(body: &mut Body, bb: BlockId, name: &str, args: Vec<Value>, ty: Ty) -> InstId {
    body.push_inst(
        bb,
        InstKind::Call {
            callee: Value::Function(Name::new(name)),
            args,
        },
        ty,
    )
}

#[derive(Default)]
pub struct EmulatedOptions {
    /// Non-final suspend points, each followed by a use of the spilled value.
    pub suspends: usize,
    /// Append a final suspend and a destroy region (free + release).
    pub with_final: bool,
    /// Query the frame size and feed it to `consume_size`.
    pub with_size_query: bool,
}

/// One generator-style coroutine in the emulated convention.
pub fn emulated_generator(name: &str, opts: &EmulatedOptions) -> Function {
    let mut f = Function::new(
        name,
        Signature {
            params: vec![],
            return_type: Ty::Void,
        },
    );
    let body = &mut f.body;
    let raw = call(body, 0, "__coro_alloc", vec![], Ty::byte_ptr());
    let hdl = call(
        body,
        0,
        "__coro_begin",
        vec![
            Value::Inst(raw),
            Value::Inst(raw),
            Value::int(8, Ty::I32),
            Value::Null(Ty::byte_ptr()),
            Value::Null(Ty::byte_ptr()),
        ],
        Ty::byte_ptr(),
    );
    if opts.with_size_query {
        let size = call(body, 0, "__coro_size", vec![], Ty::I64);
        call(body, 0, "consume_size", vec![Value::Inst(size)], Ty::Void);
    }
    let state = call(body, 0, "compute", vec![], Ty::I64);
    for _ in 0..opts.suspends {
        call(
            body,
            0,
            "__coro_save",
            vec![Value::int(0, Ty::I1)],
            Ty::byte_ptr(),
        );
        call(body, 0, "__coro_suspend", vec![], Ty::I8);
        call(body, 0, "use_value", vec![Value::Inst(state)], Ty::Void);
    }
    if opts.with_final {
        call(
            body,
            0,
            "__coro_save",
            vec![Value::int(1, Ty::I1)],
            Ty::byte_ptr(),
        );
        call(body, 0, "__coro_suspend", vec![], Ty::I8);
    }
    let mem = call(
        body,
        0,
        "__coro_free",
        vec![Value::Inst(hdl)],
        Ty::byte_ptr(),
    );
    call(body, 0, "release", vec![Value::Inst(mem)], Ty::Void);
    call(body, 0, "__coro_end", vec![Value::int(0, Ty::I1)], Ty::Void);
    call(body, 0, "__coro_return", vec![Value::Inst(hdl)], Ty::Void);
    body.block_mut(0).terminator = Terminator::Return(None);
    f
}

pub fn module_with(functions: Vec<Function>) -> Module {
    let mut module = Module::new();
    module.functions = functions;
    module
}

/// Argument lists of every call to `name`, in arena order.
pub fn calls_to(body: &Body, name: &str) -> Vec<Vec<Value>> {
    body.insts
        .iter()
        .filter_map(|inst| match &inst.kind {
            InstKind::Call { callee: Value::Function(callee), args }
                if callee.as_str() == name =>
            {
                Some(args.clone())
            }
            _ => None,
        })
        .collect()
}

pub fn coro_markers(body: &Body, pred: impl Fn(&CoroInst) -> bool) -> Vec<InstId> {
    (0..body.insts.len() as InstId)
        .filter(|&id| match &body.inst(id).kind {
            InstKind::Coro(coro) => pred(coro),
            _ => false,
        })
        .filter(|&id| body.block_of(id).is_some())
        .collect()
}

/// The unique dispatch switch of a clone, as (holding block, cases).
pub fn dispatch_switch(body: &Body) -> Option<(BlockId, Vec<(i64, BlockId)>)> {
    let mut found = None;
    for bb in body.block_ids() {
        if let Terminator::Switch { cases, .. } = &body.block(bb).terminator {
            assert!(found.is_none(), "more than one dispatch switch");
            found = Some((bb, cases.clone()));
        }
    }
    found
}

pub fn entry_block(body: &Body) -> &Block {
    body.block(body.entry)
}

/// The coroutine frame record bound by the frame builder, recovered from
/// the typed frame-pointer cast.
pub fn frame_struct(f: &Function) -> Option<Ty> {
    f.body.insts.iter().find_map(|inst| match &inst.ty {
        Ty::Ptr(inner) => match inner.as_ref() {
            Ty::Struct { name: Some(name), .. } if name.ends_with(".frame") => {
                Some(inner.as_ref().clone())
            }
            _ => None,
        },
        _ => None,
    })
}

pub fn info_table_entries(module: &Module, name: &str) -> Vec<Name> {
    let Some(global) = module.global(name) else {
        return Vec::new();
    };
    match &global.initializer {
        Some(Constant::Array(elems, _)) => elems
            .iter()
            .filter_map(|c| match c {
                Constant::FunctionRef(part) => Some(part.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
