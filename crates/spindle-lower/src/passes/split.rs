//! Splits a coroutine into a ramp plus the resume/destroy/cleanup clones
//! driving its state machine.
//!
//! The ramp keeps the code up to the first suspend and returns to the
//! caller; the clones re-enter the body through a dispatch switch on the
//! frame's suspend-index field. A coroutine with no suspends left after
//! simplification degenerates to an ordinary function over transient
//! storage and produces no clones at all.

use spindle_core::error::Result;
use spindle_core::ident::Name;
use spindle_core::ir::{
    layout, Body, BlockId, CallingConvention, Constant, CoroInst, Function, Global, InstId,
    InstKind, Linkage, Signature, Terminator, Ty, Value,
};
use tracing::debug;

use crate::error::{lowering_error, malformed_coroutine};
use crate::lower_ensure;
use crate::frame::{
    resume_fn_ptr_ty, FrameInfo, FrameLowering, DESTROY_FIELD, INDEX_FIELD, RESUME_FIELD,
};
use crate::passes::cleanup::{run_passes, FunctionPass};
use crate::passes::simplify::simplify_suspend_points;
use crate::shape::{Shape, UnwindKind};
use crate::utils::{block_and_pos, replace_and_remove, replace_coro_free};

pub struct SplitOutcome {
    /// Zero new functions for the no-suspend fast path, exactly three
    /// (resume, destroy, cleanup) otherwise.
    pub new_functions: Vec<Function>,
    pub new_globals: Vec<Global>,
    pub new_callees: Vec<Name>,
}

struct DispatchInfo {
    entry: BlockId,
    /// Case block of the final suspend, when one exists.
    final_case: Option<BlockId>,
}

pub fn split_coroutine(
    f: &mut Function,
    frame: &dyn FrameLowering,
    pre_split: &[Box<dyn FunctionPass>],
    post_split: &[Box<dyn FunctionPass>],
) -> Result<SplitOutcome> {
    run_passes(pre_split, f)?;

    // After the split the original is an ordinary function.
    f.is_coroutine = false;
    let mut shape = Shape::build(f)?;
    shape.dump(&f.name);
    let begin = shape.begin()?;

    simplify_suspend_points(&mut f.body, &mut shape);

    let info = frame.build(f, &shape)?;
    shape.frame_ty = Some(info.frame_ty.clone());
    shape.frame_ptr = Some(info.frame_ptr);
    shape.spill_block = Some(info.spill_block);

    replace_frame_size(&mut f.body, &shape, &info);
    replace_and_remove(&mut f.body, &shape.frames, &Value::Inst(begin));

    if shape.suspends.is_empty() {
        handle_no_suspend(f, begin, &info)?;
        run_passes(post_split, f)?;
        debug!(function = %f.name, "coroutine never suspends; split elided");
        return Ok(SplitOutcome {
            new_functions: Vec::new(),
            new_globals: Vec::new(),
            new_callees: Vec::new(),
        });
    }

    let dispatch = create_resume_entry(&mut f.body, &shape, &info)?;
    let mut resume = create_clone(f, "resume", &shape, &info, &dispatch, RESUME_FIELD)?;
    let mut destroy = create_clone(f, "destroy", &shape, &info, &dispatch, DESTROY_FIELD)?;

    run_passes(post_split, f)?;
    run_passes(post_split, &mut resume)?;
    run_passes(post_split, &mut destroy)?;

    let cleanup = create_cleanup_clone(f, &mut destroy);

    let table = build_info_table(f, begin, [&resume.name, &destroy.name, &cleanup.name]);
    let new_callees = vec![resume.name.clone(), destroy.name.clone(), cleanup.name.clone()];
    debug!(
        function = %f.name,
        suspends = shape.suspends.len(),
        "split coroutine into state machine"
    );
    Ok(SplitOutcome {
        new_functions: vec![resume, destroy, cleanup],
        new_globals: vec![table],
        new_callees,
    })
}

/// Size queries become the exact allocation size of the built frame, at
/// each marker's own result type.
fn replace_frame_size(body: &mut Body, shape: &Shape, info: &FrameInfo) {
    if shape.sizes.is_empty() {
        return;
    }
    let size = layout::size_of(&info.frame_ty) as i64;
    for &marker in &shape.sizes {
        let ty = body.inst(marker).ty.clone();
        body.replace_inst_with_value(marker, &Value::int(size, ty));
    }
}

/// A coroutine with no suspends never truly yields: its frame lives in
/// transient storage, the deallocation marker is dropped, and the begin
/// marker's result becomes the storage's address.
fn handle_no_suspend(f: &mut Function, begin: InstId, info: &FrameInfo) -> Result<()> {
    let alloc = match &f.body.inst(begin).kind {
        InstKind::Coro(CoroInst::Begin {
            alloc: Value::Inst(id),
            ..
        }) => *id,
        _ => {
            return Err(malformed_coroutine(
                "begin marker's alloc operand is not an alloc marker",
            ))
        }
    };
    lower_ensure!(
        matches!(f.body.inst(alloc).kind, InstKind::Coro(CoroInst::Alloc)),
        "begin marker's alloc operand is not an alloc marker"
    );

    let slot = f
        .body
        .insert_before(
            alloc,
            InstKind::Alloca {
                ty: info.frame_ty.clone(),
            },
            Ty::ptr_to(info.frame_ty.clone()),
        )
        .ok_or_else(|| lowering_error("alloc marker is detached"))?;
    let vframe = f
        .body
        .insert_after(
            slot,
            InstKind::Bitcast {
                value: Value::Inst(slot),
            },
            Ty::byte_ptr(),
        )
        .ok_or_else(|| lowering_error("transient frame slot is detached"))?;

    f.body.replace_inst_with_value(alloc, &Value::Inst(vframe));
    replace_coro_free(&mut f.body, &Value::Inst(begin), None);
    f.body.replace_inst_with_value(begin, &Value::Inst(vframe));
    Ok(())
}

/// Build the dispatch entry: load the suspend index, switch over it to an
/// unreachable default and one case per suspend. Rewrites every save into
/// its discriminant store and re-terminates every suspend block with a
/// jump to the final end block.
fn create_resume_entry(body: &mut Body, shape: &Shape, info: &FrameInfo) -> Result<DispatchInfo> {
    let final_end = shape.final_end()?;
    let (end_bb, end_pos) = block_and_pos(body, final_end)?;
    lower_ensure!(end_pos == 0, "final end marker must lead its block");

    let entry = body.new_block("resume.entry");
    let unreachable_bb = body.new_block("coro.unreach");
    body.block_mut(unreachable_bb).terminator = Terminator::Unreachable;

    let frame_ptr = Value::Inst(info.frame_ptr);
    let index_addr = body.push_inst(
        entry,
        InstKind::FieldAddr {
            base: frame_ptr.clone(),
            struct_ty: info.frame_ty.clone(),
            field: INDEX_FIELD,
        },
        Ty::ptr_to(Ty::I8),
    );
    let index = body.push_inst(
        entry,
        InstKind::Load {
            addr: Value::Inst(index_addr),
        },
        Ty::I8,
    );

    let mut cases = Vec::new();
    let mut final_case = None;
    let mut case_index: i64 = if shape.has_final_suspend() { -2 } else { -1 };
    for &suspend in &shape.suspends {
        case_index += 1;
        let save = shape.save_of(body, suspend)?;
        let (save_bb, save_pos) = block_and_pos(body, save)?;
        if case_index == -1 {
            // Parked at the final suspend is observable as a cleared
            // resume pointer, not as a stored index.
            let addr = body.insert_inst(
                save_bb,
                save_pos,
                InstKind::FieldAddr {
                    base: frame_ptr.clone(),
                    struct_ty: info.frame_ty.clone(),
                    field: RESUME_FIELD,
                },
                Ty::ptr_to(resume_fn_ptr_ty()),
            );
            body.insert_inst(
                save_bb,
                save_pos + 1,
                InstKind::Store {
                    value: Value::Null(resume_fn_ptr_ty()),
                    addr: Value::Inst(addr),
                },
                Ty::Void,
            );
        } else {
            let addr = body.insert_inst(
                save_bb,
                save_pos,
                InstKind::FieldAddr {
                    base: frame_ptr.clone(),
                    struct_ty: info.frame_ty.clone(),
                    field: INDEX_FIELD,
                },
                Ty::ptr_to(Ty::I8),
            );
            body.insert_inst(
                save_bb,
                save_pos + 1,
                InstKind::Store {
                    value: Value::int(case_index, Ty::I8),
                    addr: Value::Inst(addr),
                },
                Ty::Void,
            );
        }
        body.replace_inst_with_value(save, &Value::token_none());

        // The suspend becomes the first instruction of its case block and
        // its block falls through to the final end.
        let (suspend_bb, suspend_pos) = block_and_pos(body, suspend)?;
        let case_name = if case_index < 0 {
            "resume.final".to_string()
        } else {
            format!("resume.{}", case_index)
        };
        let case_bb = body.split_block(suspend_bb, suspend_pos, case_name);
        body.block_mut(suspend_bb).terminator = Terminator::Br(end_bb);
        if case_index == -1 {
            final_case = Some(case_bb);
        }
        cases.push((case_index, case_bb));
    }

    body.block_mut(entry).terminator = Terminator::Switch {
        value: Value::Inst(index),
        default: unreachable_bb,
        cases,
    };
    Ok(DispatchInfo { entry, final_case })
}

fn create_clone(
    f: &mut Function,
    suffix: &str,
    shape: &Shape,
    info: &FrameInfo,
    dispatch: &DispatchInfo,
    fn_index: u32,
) -> Result<Function> {
    let begin = shape.begin()?;
    let mut clone = f.clone_with_undef_args(format!("{}.{}", f.name, suffix));
    clone.sig = Signature {
        params: vec![Ty::byte_ptr()],
        return_type: Ty::Void,
    };
    clone.linkage = Linkage::Internal;
    clone.calling_convention = CallingConvention::Fast;
    clone.is_coroutine = false;
    clone.ready_for_split = false;

    // The raw frame handle is the clone's only argument; the typed frame
    // pointer is re-derived from it at the top of the spill block.
    clone
        .body
        .replace_all_uses(&Value::Inst(begin), &Value::Arg(0));
    let typed_ptr = clone.body.insert_inst(
        info.spill_block,
        0,
        InstKind::Bitcast {
            value: Value::Arg(0),
        },
        Ty::ptr_to(info.frame_ty.clone()),
    );
    clone
        .body
        .replace_all_uses(&Value::Inst(info.frame_ptr), &Value::Inst(typed_ptr));

    // Spill initialization runs ahead of dispatch.
    clone.body.entry = info.spill_block;
    clone.body.block_mut(info.spill_block).terminator = Terminator::Br(dispatch.entry);

    // Every remaining suspend yields the clone's own index.
    let index_value = Value::int(fn_index as i64, Ty::I8);
    for &suspend in &shape.suspends {
        clone.body.replace_inst_with_value(suspend, &index_value);
    }

    replace_final_end(&mut clone.body, shape)?;
    replace_unwind_ends(&mut clone.body, shape)?;

    if let Some(final_bb) = dispatch.final_case {
        adjust_final_dispatch(&mut clone.body, info, dispatch, final_bb, fn_index, typed_ptr);
    }

    // Publish the clone's address in the ramp's frame header right after
    // the frame pointer bind, so the first resume finds it.
    let addr = f
        .body
        .insert_after(
            info.frame_ptr,
            InstKind::FieldAddr {
                base: Value::Inst(info.frame_ptr),
                struct_ty: info.frame_ty.clone(),
                field: fn_index,
            },
            Ty::ptr_to(resume_fn_ptr_ty()),
        )
        .ok_or_else(|| lowering_error("frame pointer is detached"))?;
    f.body
        .insert_after(
            addr,
            InstKind::Store {
                value: Value::Function(clone.name.clone()),
                addr: Value::Inst(addr),
            },
            Ty::Void,
        )
        .ok_or_else(|| lowering_error("frame header slot is detached"))?;

    Ok(clone)
}

/// The final end marker becomes a true return; the marker and whatever
/// trails it are split off as unreachable for later marker cleanup.
fn replace_final_end(body: &mut Body, shape: &Shape) -> Result<()> {
    let end = shape.final_end()?;
    let (bb, pos) = block_and_pos(body, end)?;
    body.split_block(bb, pos, "coro.end.dead");
    body.block_mut(bb).terminator = Terminator::Return(None);
    Ok(())
}

/// Non-final unwind ends turn into the transfer their landing context
/// calls for, resolved once at shape-extraction time.
fn replace_unwind_ends(body: &mut Body, shape: &Shape) -> Result<()> {
    for &(end, kind) in &shape.unwind_ends {
        let (bb, pos) = block_and_pos(body, end)?;
        let pad = *body
            .block(bb)
            .insts
            .first()
            .ok_or_else(|| malformed_coroutine("unwind pad block is empty"))?;
        body.split_block(bb, pos, "coro.end.unwind.dead");
        body.block_mut(bb).terminator = match kind {
            UnwindKind::Propagate => Terminator::Resume(Value::Inst(pad)),
            UnwindKind::CleanupReturn => Terminator::CleanupRet {
                pad: Value::Inst(pad),
                unwind: None,
            },
        };
    }
    Ok(())
}

/// Resume drops the final-suspend case: resuming a finished coroutine is
/// a contract violation and behaves as unreachable. Destroy instead tests
/// the stored resume pointer ahead of the switch; destroying a coroutine
/// parked at its final suspend must not re-enter the dispatch table.
fn adjust_final_dispatch(
    body: &mut Body,
    info: &FrameInfo,
    dispatch: &DispatchInfo,
    final_bb: BlockId,
    fn_index: u32,
    typed_ptr: InstId,
) {
    if fn_index == RESUME_FIELD {
        if let Terminator::Switch { cases, .. } = &mut body.block_mut(dispatch.entry).terminator {
            cases.retain(|&(key, _)| key != -1);
        }
        return;
    }

    let switch_bb = body.new_block("coro.switch");
    let old = std::mem::replace(
        &mut body.block_mut(dispatch.entry).terminator,
        Terminator::Unreachable,
    );
    body.block_mut(switch_bb).terminator = old;

    let addr = body.push_inst(
        dispatch.entry,
        InstKind::FieldAddr {
            base: Value::Inst(typed_ptr),
            struct_ty: info.frame_ty.clone(),
            field: RESUME_FIELD,
        },
        Ty::ptr_to(resume_fn_ptr_ty()),
    );
    let resume_fn = body.push_inst(
        dispatch.entry,
        InstKind::Load {
            addr: Value::Inst(addr),
        },
        resume_fn_ptr_ty(),
    );
    let is_parked = body.push_inst(
        dispatch.entry,
        InstKind::Eq {
            lhs: Value::Inst(resume_fn),
            rhs: Value::Null(resume_fn_ptr_ty()),
        },
        Ty::I1,
    );
    body.block_mut(dispatch.entry).terminator = Terminator::CondBr {
        cond: Value::Inst(is_parked),
        if_true: final_bb,
        if_false: switch_bb,
    };
}

/// Cleanup is destroy minus frame disposal: destroy's free markers
/// resolve to the real frame handle, cleanup's to null, because cleanup's
/// caller owns disposal.
fn create_cleanup_clone(f: &Function, destroy: &mut Function) -> Function {
    let mut cleanup = destroy.clone();
    cleanup.name = Name::new(format!("{}.cleanup", f.name));
    let vframe = Value::Arg(0);
    replace_coro_free(&mut destroy.body, &vframe, Some(&vframe));
    replace_coro_free(&mut cleanup.body, &vframe, None);
    cleanup
}

/// Pack the three clone addresses into the `<fn>.parts` constant table and
/// hang it off the begin marker's info operand, the sole handle later
/// stages use to discover the state machine.
fn build_info_table(f: &mut Function, begin: InstId, parts: [&Name; 3]) -> Global {
    let name = Name::new(format!("{}.parts", f.name));
    let element = resume_fn_ptr_ty();
    let initializer = Constant::Array(
        parts
            .iter()
            .map(|part| Constant::FunctionRef((*part).clone()))
            .collect(),
        element.clone(),
    );
    if let InstKind::Coro(CoroInst::Begin { info, .. }) = &mut f.body.inst_mut(begin).kind {
        *info = Value::Global(name.clone());
    }
    Global {
        name,
        ty: Ty::Array(Box::new(element), 3),
        initializer: Some(initializer),
        is_constant: true,
        linkage: Linkage::Private,
    }
}
