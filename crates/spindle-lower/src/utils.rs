//! Shared graph-surgery helpers for the coroutine passes.

use spindle_core::error::Result;
use spindle_core::ir::{Body, BlockId, CoroInst, InstId, InstKind, Ty, Value};

use crate::error::lowering_error;

/// Block and in-block position of an attached instruction.
pub fn block_and_pos(body: &Body, inst: InstId) -> Result<(BlockId, usize)> {
    let block = body
        .block_of(inst)
        .ok_or_else(|| lowering_error(format!("instruction %{} is detached", inst)))?;
    let pos = body
        .position(block, inst)
        .ok_or_else(|| lowering_error(format!("instruction %{} lost its slot", inst)))?;
    Ok((block, pos))
}

/// Ensure `inst` is the first instruction of a block, splitting its block
/// in front of it if necessary. Returns the block that now starts with it.
pub fn split_block_if_not_first(body: &mut Body, inst: InstId, name: &str) -> Result<BlockId> {
    let (block, pos) = block_and_pos(body, inst)?;
    if pos == 0 {
        Ok(block)
    } else {
        Ok(body.split_block(block, pos, name))
    }
}

/// Replace all uses of each instruction with `value`, then erase it.
pub fn replace_and_remove(body: &mut Body, insts: &[InstId], value: &Value) {
    for &inst in insts {
        body.replace_inst_with_value(inst, value);
    }
}

/// Resolve free markers whose frame operand is `frame`: their result
/// becomes `replacement` when given, or a null handle otherwise, and the
/// marker itself is erased. Deallocation code downstream of a null handle
/// degenerates to a no-op free.
pub fn replace_coro_free(body: &mut Body, frame: &Value, replacement: Option<&Value>) {
    let frees: Vec<InstId> = (0..body.insts.len() as InstId)
        .filter(|&id| match &body.inst(id).kind {
            InstKind::Coro(CoroInst::Free { frame: operand }) => operand == frame,
            _ => false,
        })
        .collect();
    let null = Value::Null(Ty::byte_ptr());
    let value = replacement.unwrap_or(&null);
    replace_and_remove(body, &frees, value);
}

/// Strip lifetime markers from the whole body.
pub fn remove_lifetime_markers(body: &mut Body) {
    let doomed: Vec<InstId> = (0..body.insts.len() as InstId)
        .filter(|&id| {
            matches!(
                body.inst(id).kind,
                InstKind::LifetimeStart { .. } | InstKind::LifetimeEnd { .. }
            )
        })
        .collect();
    for inst in doomed {
        body.erase_inst(inst);
    }
}

/// Look through pointer casts to the underlying value.
pub fn strip_pointer_casts<'a>(body: &'a Body, value: &'a Value) -> &'a Value {
    let mut current = value;
    while let Value::Inst(id) = current {
        match &body.inst(*id).kind {
            InstKind::Bitcast { value } => current = value,
            _ => break,
        }
    }
    current
}
