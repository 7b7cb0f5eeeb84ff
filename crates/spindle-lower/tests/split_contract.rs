//! Contract tests for the state-machine splitter, driven through the full
//! lowering pipeline on emulated-convention input.

mod support;

use pretty_assertions::assert_eq;
use spindle_core::ir::{CoroInst, InstKind, Terminator, Ty, Value};
use spindle_core::Name;
use spindle_lower::CoroLowering;
use support::ir::{
    calls_to, coro_markers, dispatch_switch, emulated_generator, frame_struct, info_table_entries,
    module_with, EmulatedOptions,
};

#[test]
fn zero_suspend_coroutines_degrade_to_plain_functions() {
    let f = emulated_generator("gen", &EmulatedOptions::default());
    let mut module = module_with(vec![f]);
    CoroLowering::new().run(&mut module).expect("lowering");

    // no clones
    assert_eq!(module.functions.len(), 1);
    let gen = module.function("gen").expect("gen");

    // no residual begin/alloc/free markers
    let residual = coro_markers(&gen.body, |coro| {
        matches!(
            coro,
            CoroInst::Begin { .. } | CoroInst::Alloc | CoroInst::Free { .. }
        )
    });
    assert_eq!(residual, vec![]);

    // the frame now lives in transient storage
    let transient = gen.body.insts.iter().any(|inst| {
        matches!(
            &inst.kind,
            InstKind::Alloca { ty: Ty::Struct { name: Some(name), .. } }
                if name.ends_with(".frame")
        )
    });
    assert!(transient, "expected a transient frame slot");

    // dropping the deallocation marker nulls out the released pointer
    let release_args = calls_to(&gen.body, "release");
    assert_eq!(release_args, vec![vec![Value::Null(Ty::byte_ptr())]]);
}

#[test]
fn suspending_coroutines_split_into_exactly_three_clones() {
    let f = emulated_generator(
        "gen",
        &EmulatedOptions {
            suspends: 2,
            ..Default::default()
        },
    );
    let mut module = module_with(vec![f]);
    CoroLowering::new().run(&mut module).expect("lowering");

    assert_eq!(module.functions.len(), 4);
    let resume = module.function("gen.resume").expect("resume clone");
    let destroy = module.function("gen.destroy").expect("destroy clone");
    let cleanup = module.function("gen.cleanup").expect("cleanup clone");

    for clone in [resume, destroy, cleanup] {
        assert_eq!(clone.sig.params, vec![Ty::byte_ptr()]);
        assert_eq!(clone.sig.return_type, Ty::Void);
        assert_eq!(clone.linkage, spindle_core::ir::Linkage::Internal);
        assert_eq!(
            clone.calling_convention,
            spindle_core::ir::CallingConvention::Fast
        );
    }

    // no final suspend: both dispatch switches carry one case per suspend
    let (_, resume_cases) = dispatch_switch(&resume.body).expect("resume dispatch");
    assert_eq!(resume_cases.len(), 2);
    let (_, destroy_cases) = dispatch_switch(&destroy.body).expect("destroy dispatch");
    assert_eq!(destroy_cases.len(), 2);

    // the info table is the handle to all three parts
    assert_eq!(
        info_table_entries(&module, "gen.parts"),
        vec![
            Name::new("gen.resume"),
            Name::new("gen.destroy"),
            Name::new("gen.cleanup"),
        ]
    );

    // the ramp publishes resume and destroy in the frame header
    let gen = module.function("gen").expect("ramp");
    let published: Vec<&Value> = gen
        .body
        .insts
        .iter()
        .filter_map(|inst| match &inst.kind {
            InstKind::Store {
                value: value @ Value::Function(_),
                ..
            } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(
        published,
        vec![
            &Value::Function(Name::new("gen.resume")),
            &Value::Function(Name::new("gen.destroy")),
        ]
    );
}

#[test]
fn final_suspend_elides_the_resume_case_and_guards_destroy() {
    let f = emulated_generator(
        "gen",
        &EmulatedOptions {
            suspends: 1,
            with_final: true,
            ..Default::default()
        },
    );
    let mut module = module_with(vec![f]);
    CoroLowering::new().run(&mut module).expect("lowering");

    // resume: the final case is gone, one ordinary case stays
    let resume = module.function("gen.resume").expect("resume clone");
    let (_, resume_cases) = dispatch_switch(&resume.body).expect("resume dispatch");
    assert_eq!(resume_cases.len(), 1);
    assert!(resume_cases.iter().all(|&(key, _)| key != -1));

    // destroy: dispatch is guarded by a null test on the resume pointer.
    // Null means "parked at final suspend" and jumps straight to the
    // final-suspend block; anything else falls through to the switch.
    let destroy = module.function("gen.destroy").expect("destroy clone");
    let (switch_bb, destroy_cases) = dispatch_switch(&destroy.body).expect("destroy dispatch");
    let final_case = destroy_cases
        .iter()
        .find(|&&(key, _)| key == -1)
        .map(|&(_, bb)| bb)
        .expect("destroy keeps the final case");

    let guard = destroy
        .body
        .block_ids()
        .find_map(|bb| match &destroy.body.block(bb).terminator {
            Terminator::CondBr {
                cond,
                if_true,
                if_false,
            } if *if_false == switch_bb => Some((cond.clone(), *if_true)),
            _ => None,
        })
        .expect("destroy guards its dispatch");
    assert_eq!(guard.1, final_case);
    match guard.0 {
        Value::Inst(cond) => match &destroy.body.inst(cond).kind {
            InstKind::Eq { rhs, .. } => assert!(rhs.is_null()),
            other => panic!("expected a null compare, got {:?}", other),
        },
        other => panic!("expected an instruction condition, got {:?}", other),
    }
}

#[test]
fn destroy_frees_the_frame_and_cleanup_leaves_it_to_the_caller() {
    let f = emulated_generator(
        "gen",
        &EmulatedOptions {
            suspends: 1,
            with_final: true,
            ..Default::default()
        },
    );
    let mut module = module_with(vec![f]);
    CoroLowering::new().run(&mut module).expect("lowering");

    let destroy = module.function("gen.destroy").expect("destroy clone");
    assert_eq!(
        calls_to(&destroy.body, "release"),
        vec![vec![Value::Arg(0)]]
    );
    assert!(coro_markers(&destroy.body, |c| matches!(c, CoroInst::Free { .. })).is_empty());

    let cleanup = module.function("gen.cleanup").expect("cleanup clone");
    assert_eq!(
        calls_to(&cleanup.body, "release"),
        vec![vec![Value::Null(Ty::byte_ptr())]]
    );
    assert!(coro_markers(&cleanup.body, |c| matches!(c, CoroInst::Free { .. })).is_empty());
}

#[test]
fn size_queries_become_the_exact_frame_size() {
    // header (8 + 8 + 1, padded to 8) + one 8-byte spill = 32 bytes
    let f = emulated_generator(
        "gen",
        &EmulatedOptions {
            suspends: 1,
            with_size_query: true,
            ..Default::default()
        },
    );
    let mut module = module_with(vec![f]);
    CoroLowering::new().run(&mut module).expect("lowering");

    let gen = module.function("gen").expect("ramp");
    let frame = frame_struct(gen).expect("frame record");
    assert_eq!(frame.struct_fields().map(|fields| fields.len()), Some(4));
    assert_eq!(
        calls_to(&gen.body, "consume_size"),
        vec![vec![Value::int(32, Ty::I64)]]
    );
}

#[test]
fn coroutine_without_begin_marker_is_fatal() {
    let mut f = emulated_generator("gen", &EmulatedOptions::default());
    f.is_coroutine = true;
    f.body = {
        let mut body = spindle_core::ir::Body::new();
        body.block_mut(0).terminator = Terminator::Return(None);
        body
    };
    let mut module = module_with(vec![f]);
    assert!(CoroLowering::new().run(&mut module).is_err());
}
