//! Early normalization of emulated coroutine markers.
//!
//! Coroutine-unaware front ends emit the protocol as plain calls to a
//! fixed table of `__coro_*` names. This pass rewrites each such call into
//! the canonical marker instruction, operand-for-operand, then finalizes
//! every function in which a begin marker was recognized.

use spindle_core::error::Result;
use spindle_core::ir::{CoroInst, Function, InstId, InstKind, Module, Terminator, Ty, Value};
use tracing::debug;

use crate::error::{lowering_error, malformed_coroutine};
use crate::lower_ensure;
use crate::shape::Shape;
use crate::utils::{block_and_pos, split_block_if_not_first};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emulated {
    Alloc,
    Begin,
    Save,
    Suspend,
    Free,
    Size,
    Frame,
    End,
    Return,
}

fn emulated_kind(name: &str) -> Option<Emulated> {
    match name {
        "__coro_alloc" => Some(Emulated::Alloc),
        "__coro_begin" => Some(Emulated::Begin),
        "__coro_save" => Some(Emulated::Save),
        "__coro_suspend" => Some(Emulated::Suspend),
        "__coro_free" => Some(Emulated::Free),
        "__coro_size" => Some(Emulated::Size),
        "__coro_frame" => Some(Emulated::Frame),
        "__coro_end" => Some(Emulated::End),
        "__coro_return" => Some(Emulated::Return),
        _ => None,
    }
}

fn is_nonzero(value: &Value) -> bool {
    value.as_const_int().map(|v| v != 0).unwrap_or(false)
}

pub fn normalize_module(module: &mut Module) -> Result<bool> {
    let mut changed = false;
    for function in &mut module.functions {
        changed |= normalize_function(function)?;
    }
    Ok(changed)
}

pub fn normalize_function(f: &mut Function) -> Result<bool> {
    let mut changed = false;
    let mut has_begin = false;
    // The save feeding the next suspend, in scan order.
    let mut rolling_save: Option<InstId> = None;

    for bb in f.body.block_ids() {
        let ids = f.body.block(bb).insts.clone();
        for id in ids {
            let (name, args) = match &f.body.inst(id).kind {
                InstKind::Call {
                    callee: Value::Function(name),
                    args,
                } => (name.clone(), args.clone()),
                _ => continue,
            };
            let Some(kind) = emulated_kind(name.as_str()) else {
                continue;
            };
            match kind {
                Emulated::Begin => {
                    lower_ensure!(
                        args.len() == 5,
                        "emulated begin marker in `{}` expects 5 operands, found {}",
                        f.name,
                        args.len()
                    );
                    replace_call(f, id, CoroInst::Begin {
                        mem: args[0].clone(),
                        alloc: args[1].clone(),
                        align: args[2].clone(),
                        promise: args[3].clone(),
                        info: args[4].clone(),
                    }, Ty::byte_ptr())?;
                    has_begin = true;
                }
                Emulated::Save => {
                    lower_ensure!(
                        args.len() == 1,
                        "emulated save marker in `{}` expects 1 operand, found {}",
                        f.name,
                        args.len()
                    );
                    // The save does not survive as a call: the canonical
                    // marker takes its place and the call's result becomes
                    // a null placeholder token.
                    let save = f
                        .body
                        .insert_before(
                            id,
                            CoroInst::Save {
                                is_final: is_nonzero(&args[0]),
                            },
                            Ty::Token,
                        )
                        .ok_or_else(|| lowering_error("emulated save call is detached"))?;
                    f.body
                        .replace_inst_with_value(id, &Value::Null(Ty::byte_ptr()));
                    rolling_save = Some(save);
                }
                Emulated::Suspend => {
                    lower_ensure!(
                        args.is_empty(),
                        "emulated suspend marker in `{}` takes no operands",
                        f.name
                    );
                    let save = rolling_save.take().ok_or_else(|| {
                        malformed_coroutine(format!(
                            "emulated suspend in `{}` has no preceding save",
                            f.name
                        ))
                    })?;
                    replace_call(f, id, CoroInst::Suspend {
                        save: Value::Inst(save),
                    }, Ty::I8)?;
                }
                Emulated::Free => {
                    lower_ensure!(
                        args.len() == 1,
                        "emulated free marker in `{}` expects 1 operand, found {}",
                        f.name,
                        args.len()
                    );
                    replace_call(f, id, CoroInst::Free {
                        frame: args[0].clone(),
                    }, Ty::byte_ptr())?;
                }
                Emulated::End => {
                    lower_ensure!(
                        args.len() == 1,
                        "emulated end marker in `{}` expects 1 operand, found {}",
                        f.name,
                        args.len()
                    );
                    replace_call(f, id, CoroInst::End {
                        unwind: is_nonzero(&args[0]),
                    }, Ty::Void)?;
                }
                Emulated::Return => {
                    lower_ensure!(
                        args.len() == 1,
                        "emulated return marker in `{}` expects 1 operand, found {}",
                        f.name,
                        args.len()
                    );
                    replace_call(f, id, CoroInst::Return {
                        frame: args[0].clone(),
                    }, Ty::Void)?;
                }
                Emulated::Alloc => {
                    lower_ensure!(
                        args.is_empty(),
                        "emulated alloc marker in `{}` takes no operands",
                        f.name
                    );
                    replace_call(f, id, CoroInst::Alloc, Ty::byte_ptr())?;
                }
                Emulated::Size => {
                    lower_ensure!(
                        args.is_empty(),
                        "emulated size marker in `{}` takes no operands",
                        f.name
                    );
                    // Size queries keep whatever integer type the call had.
                    let ty = f.body.inst(id).ty.clone();
                    replace_call(f, id, CoroInst::Size, ty)?;
                }
                Emulated::Frame => {
                    lower_ensure!(
                        args.is_empty(),
                        "emulated frame marker in `{}` takes no operands",
                        f.name
                    );
                    replace_call(f, id, CoroInst::Frame, Ty::byte_ptr())?;
                }
            }
            changed = true;
        }
    }

    if has_begin {
        finalize_coroutine(f)?;
        changed = true;
    }
    Ok(changed)
}

fn replace_call(f: &mut Function, call: InstId, marker: CoroInst, ty: Ty) -> Result<InstId> {
    f.body
        .replace_inst_with(call, marker, ty)
        .ok_or_else(|| lowering_error("emulated marker call is detached"))
}

/// The emulated convention returns an integer code from each suspend
/// instead of branching; rewrite that into a real conditional branch on
/// the stop sentinel, targeting the return-marker block, and canonicalize
/// the end-region blocks while at it.
fn finalize_coroutine(f: &mut Function) -> Result<()> {
    f.is_coroutine = true;
    let shape = Shape::build(f)?;
    shape.dump(&f.name);
    if shape.suspends.is_empty() {
        return Ok(());
    }

    let ret = *shape.returns.last().ok_or_else(|| {
        malformed_coroutine(format!("coroutine `{}` has no return marker", f.name))
    })?;
    let ret_bb = split_block_if_not_first(&mut f.body, ret, "coro.ret")?;
    let end = shape.final_end()?;
    split_block_if_not_first(&mut f.body, end, "coro.end")?;

    for &suspend in &shape.suspends {
        let (bb, pos) = block_and_pos(&f.body, suspend)?;
        let resume_bb = f.body.split_block(bb, pos + 1, "resume.next");
        let cond = f.body.push_inst(
            bb,
            InstKind::Lt {
                lhs: Value::Inst(suspend),
                rhs: Value::int(0, Ty::I8),
            },
            Ty::I1,
        );
        f.body.block_mut(bb).terminator = Terminator::CondBr {
            cond: Value::Inst(cond),
            if_true: ret_bb,
            if_false: resume_bb,
        };
    }
    debug!(function = %f.name, suspends = shape.suspends.len(), "finalized coroutine");
    Ok(())
}
