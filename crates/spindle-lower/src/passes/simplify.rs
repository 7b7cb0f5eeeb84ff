//! Suspend points that only forward to a known subfunction collapse away.
//!
//! The pattern is narrow on purpose:
//!
//! ```text
//!     save
//!     <no other calls>
//!     indirect call through a subfn lookup with a constant index
//!     suspend
//! ```
//!
//! When it matches, the suspend never reaches the caller: the result is
//! the looked-up index and the whole group is deleted. Declining to fire
//! only costs an optimization, never correctness.

use spindle_core::ir::{Body, CoroInst, InstId, InstKind, Value};
use tracing::debug;

use crate::shape::Shape;
use crate::utils::strip_pointer_casts;

pub fn simplify_suspend_points(body: &mut Body, shape: &mut Shape) {
    let before = shape.suspends.len();
    shape.suspends.retain(|&s| !simplify_suspend_point(body, s));
    if let Some(final_suspend) = shape.final_suspend {
        if !shape.suspends.contains(&final_suspend) {
            shape.final_suspend = None;
        }
    }
    let removed = before - shape.suspends.len();
    if removed > 0 {
        debug!(removed, "simplified suspend points");
    }
}

fn simplify_suspend_point(body: &mut Body, suspend: InstId) -> bool {
    let save = match &body.inst(suspend).kind {
        InstKind::Coro(CoroInst::Suspend {
            save: Value::Inst(save),
        }) => *save,
        _ => return false,
    };
    let Some(bb) = body.block_of(suspend) else {
        return false;
    };
    if body.block_of(save) != Some(bb) {
        return false;
    }
    let Some(save_pos) = body.position(bb, save) else {
        return false;
    };
    let Some(suspend_pos) = body.position(bb, suspend) else {
        return false;
    };

    // Exactly one call site between save and suspend; frame queries and
    // subfn lookups do not count.
    let mut single_call: Option<InstId> = None;
    for &id in &body.block(bb).insts[save_pos + 1..suspend_pos] {
        match &body.inst(id).kind {
            InstKind::Coro(CoroInst::Frame) | InstKind::Coro(CoroInst::SubFn { .. }) => continue,
            InstKind::Call { .. } => {
                if single_call.is_some() {
                    return false;
                }
                single_call = Some(id);
            }
            _ => {}
        }
    }
    let Some(call) = single_call else {
        return false;
    };

    let callee = match &body.inst(call).kind {
        InstKind::Call { callee, .. } => callee.clone(),
        _ => return false,
    };
    if matches!(callee, Value::Function(_)) {
        return false;
    }
    let resolved = strip_pointer_casts(body, &callee).clone();
    let Value::Inst(subfn) = resolved else {
        return false;
    };
    let index = match &body.inst(subfn).kind {
        InstKind::Coro(CoroInst::SubFn { index, .. }) => index.clone(),
        _ => return false,
    };
    if index.as_const_int().is_none() {
        return false;
    }
    let subfn_ty = body.inst(subfn).ty.clone();

    body.replace_inst_with_value(suspend, &index);
    body.erase_inst(save);
    body.replace_inst_with_value(subfn, &Value::Null(subfn_ty));
    body.erase_inst(call);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::ir::{Function, Signature, Terminator, Ty};
    use spindle_core::Name;

    fn forwarding_coroutine(split_call: bool) -> (Function, InstId) {
        let mut f = Function::new(
            "fwd",
            Signature {
                params: vec![],
                return_type: Ty::Void,
            },
        );
        let body = &mut f.body;
        let alloc = body.push_inst(0, CoroInst::Alloc, Ty::byte_ptr());
        let begin = body.push_inst(
            0,
            CoroInst::Begin {
                mem: Value::Inst(alloc),
                alloc: Value::Inst(alloc),
                align: Value::int(8, Ty::I32),
                promise: Value::Null(Ty::byte_ptr()),
                info: Value::Null(Ty::byte_ptr()),
            },
            Ty::byte_ptr(),
        );
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
        if split_call {
            body.push_inst(
                0,
                InstKind::Call {
                    callee: Value::Function(Name::new("observe")),
                    args: vec![],
                },
                Ty::Void,
            );
        }
        let suspend = body.push_inst(
            0,
            CoroInst::Suspend {
                save: Value::Inst(save),
            },
            Ty::I8,
        );
        body.block_mut(0).terminator = Terminator::Return(None);
        (f, suspend)
    }

    #[test]
    fn forwarding_pattern_collapses() {
        let (mut f, suspend) = forwarding_coroutine(false);
        let mut shape = Shape::build(&f).expect("shape");
        simplify_suspend_points(&mut f.body, &mut shape);

        assert!(shape.suspends.is_empty());
        assert_eq!(f.body.inst(suspend).kind, InstKind::Nop);
        let leftover_calls = f
            .body
            .insts
            .iter()
            .filter(|inst| matches!(inst.kind, InstKind::Call { .. }))
            .count();
        assert_eq!(leftover_calls, 0);
    }

    #[test]
    fn second_call_site_blocks_the_peephole() {
        let (mut f, suspend) = forwarding_coroutine(true);
        let mut shape = Shape::build(&f).expect("shape");
        simplify_suspend_points(&mut f.body, &mut shape);

        assert_eq!(shape.suspends, vec![suspend]);
        assert!(matches!(
            f.body.inst(suspend).kind,
            InstKind::Coro(CoroInst::Suspend { .. })
        ));
    }
}
