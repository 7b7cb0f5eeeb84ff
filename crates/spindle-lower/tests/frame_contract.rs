//! Contract tests for frame construction and its interaction with the
//! suspend-point simplifier.

mod support;

use spindle_core::ir::{
    CoroInst, Function, InstKind, Signature, Terminator, Ty, Value,
};
use spindle_lower::passes::split_coroutine;
use spindle_lower::DefaultFrameLowering;
use support::ir::{call, calls_to, frame_struct};

/// Canonical (already bootstrapped) coroutine whose single suspend either
/// matches the synchronous-forwarding pattern or has it broken by a
/// second call site.
fn canonical_forwarder(name: &str, forwarding: bool, with_promise: bool) -> Function {
    let mut f = Function::new(
        name,
        Signature {
            params: vec![],
            return_type: Ty::Void,
        },
    );
    let body = &mut f.body;
    let promise = with_promise.then(|| body.push_inst(0, InstKind::Alloca { ty: Ty::I32 }, Ty::ptr_to(Ty::I32)));
    let alloc = body.push_inst(0, CoroInst::Alloc, Ty::byte_ptr());
    let begin = body.push_inst(
        0,
        CoroInst::Begin {
            mem: Value::Inst(alloc),
            alloc: Value::Inst(alloc),
            align: Value::int(8, Ty::I32),
            promise: promise
                .map(Value::Inst)
                .unwrap_or(Value::Null(Ty::byte_ptr())),
            info: Value::Null(Ty::byte_ptr()),
        },
        Ty::byte_ptr(),
    );
    let state = call(body, 0, "compute", vec![], Ty::I64);
    let save = body.push_inst(0, CoroInst::Save { is_final: false }, Ty::Token);
    let fn_ptr_ty = Ty::ptr_to(Ty::function(Ty::Void, vec![Ty::byte_ptr()]));
    let subfn = body.push_inst(
        0,
        CoroInst::SubFn {
            frame: Value::Inst(begin),
            index: Value::int(0, Ty::I8),
        },
        fn_ptr_ty.clone(),
    );
    let cast = body.push_inst(
        0,
        InstKind::Bitcast {
            value: Value::Inst(subfn),
        },
        fn_ptr_ty,
    );
    body.push_inst(
        0,
        InstKind::Call {
            callee: Value::Inst(cast),
            args: vec![Value::Inst(begin)],
        },
        Ty::Void,
    );
    if !forwarding {
        call(body, 0, "observe", vec![], Ty::Void);
    }
    body.push_inst(
        0,
        CoroInst::Suspend {
            save: Value::Inst(save),
        },
        Ty::I8,
    );

    let resume_bb = body.new_block("resume.0");
    let end_bb = body.new_block("coro.end");
    let ret_bb = body.new_block("coro.ret");
    body.block_mut(0).terminator = Terminator::Br(resume_bb);
    call(body, resume_bb, "use_value", vec![Value::Inst(state)], Ty::Void);
    body.block_mut(resume_bb).terminator = Terminator::Br(end_bb);
    body.push_inst(end_bb, CoroInst::End { unwind: false }, Ty::Void);
    body.block_mut(end_bb).terminator = Terminator::Br(ret_bb);
    body.push_inst(
        ret_bb,
        CoroInst::Return {
            frame: Value::Inst(begin),
        },
        Ty::Void,
    );
    body.block_mut(ret_bb).terminator = Terminator::Return(None);
    f.is_coroutine = true;
    f
}

fn frame_field_count(f: &Function) -> usize {
    frame_struct(f)
        .and_then(|ty| ty.struct_fields().map(|fields| fields.len()))
        .expect("frame record")
}

#[test]
fn collapsed_suspend_saves_exactly_one_spill_slot() {
    let mut forwarding = canonical_forwarder("fwd", true, false);
    let outcome = split_coroutine(&mut forwarding, &DefaultFrameLowering, &[], &[])
        .expect("split forwarding variant");
    assert!(outcome.new_functions.is_empty());

    let mut broken = canonical_forwarder("plain", false, false);
    let outcome =
        split_coroutine(&mut broken, &DefaultFrameLowering, &[], &[]).expect("split broken variant");
    assert_eq!(outcome.new_functions.len(), 3);

    assert_eq!(frame_field_count(&broken), frame_field_count(&forwarding) + 1);
}

#[test]
fn cross_suspend_values_reload_from_the_frame() {
    let mut f = canonical_forwarder("gen", false, false);
    split_coroutine(&mut f, &DefaultFrameLowering, &[], &[]).expect("split");

    let args = calls_to(&f.body, "use_value");
    assert_eq!(args.len(), 1);
    match &args[0][0] {
        Value::Inst(id) => assert!(
            matches!(f.body.inst(*id).kind, InstKind::Load { .. }),
            "expected a frame reload, got {:?}",
            f.body.inst(*id).kind
        ),
        other => panic!("expected a reloaded value, got {:?}", other),
    }
}

#[test]
fn promise_slot_sits_between_header_and_spills() {
    let mut f = canonical_forwarder("gen", false, true);
    split_coroutine(&mut f, &DefaultFrameLowering, &[], &[]).expect("split");

    let frame = frame_struct(&f).expect("frame record");
    let fields = frame.struct_fields().expect("struct frame");
    assert_eq!(fields.len(), 5);
    assert_eq!(fields[3], Ty::I32);
    assert_eq!(fields[4], Ty::I64);

    // the promise now lives in the frame; the begin marker holds a null
    let begin = f
        .body
        .insts
        .iter()
        .find_map(|inst| match &inst.kind {
            InstKind::Coro(CoroInst::Begin { promise, .. }) => Some(promise.clone()),
            _ => None,
        })
        .expect("begin marker survives in the ramp");
    assert!(begin.is_null());
}
