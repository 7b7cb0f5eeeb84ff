//! Per-function catalog of coroutine protocol markers.
//!
//! The Shape is rebuilt from scratch by a single linear scan every time a
//! pass needs it; it is never updated incrementally. Structural mismatches
//! found during the scan are fatal: a conformant front end never produces
//! them, so recovery would only hide a miscompile.

use spindle_core::error::Result;
use spindle_core::ident::Name;
use spindle_core::ir::{
    Body, BlockId, Constant, CoroInst, Function, InstId, InstKind, Module, Terminator, Ty, Value,
};
use tracing::debug;

use crate::error::malformed_coroutine;
use crate::utils::strip_pointer_casts;

/// How an unwind end marker leaves the function, resolved once from its
/// landing context during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum UnwindKind {
    /// Exception-landing block: propagate the in-flight exception.
    Propagate,
    /// Structured-cleanup block: return to the cleanup driver.
    CleanupReturn,
}

/// Split-state of a begin marker, parsed from its info operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitStatus {
    NotYetProcessed,
    Outlined(Name),
    PostSplit(Name),
}

#[derive(Debug, Default, PartialEq)]
pub struct Shape {
    pub begins: Vec<InstId>,
    pub allocs: Vec<InstId>,
    pub frees: Vec<InstId>,
    pub saves: Vec<InstId>,
    /// Suspend markers in scan order, except that a final suspend is
    /// always ordered first.
    pub suspends: Vec<InstId>,
    pub sizes: Vec<InstId>,
    pub frames: Vec<InstId>,
    /// End markers in scan order, except that the final end is always
    /// ordered first.
    pub ends: Vec<InstId>,
    pub returns: Vec<InstId>,
    /// Blocks terminated by a plain function return.
    pub plain_returns: Vec<BlockId>,
    /// Non-final unwind ends with their resolved landing context.
    pub unwind_ends: Vec<(InstId, UnwindKind)>,
    pub final_suspend: Option<InstId>,
    /// Promise stack slot named by the begin marker, if any.
    pub promise: Option<InstId>,

    // Derived by frame construction, absent until then.
    pub frame_ty: Option<Ty>,
    pub frame_ptr: Option<InstId>,
    pub spill_block: Option<BlockId>,
}

impl Shape {
    pub fn build(f: &Function) -> Result<Shape> {
        let body = &f.body;
        let mut shape = Shape::default();

        for bb in body.block_ids() {
            for &id in &body.block(bb).insts {
                let InstKind::Coro(coro) = &body.inst(id).kind else {
                    continue;
                };
                match coro {
                    CoroInst::Begin { .. } => shape.begins.push(id),
                    CoroInst::Alloc => shape.allocs.push(id),
                    CoroInst::Free { .. } => shape.frees.push(id),
                    CoroInst::Save { .. } => shape.saves.push(id),
                    CoroInst::Suspend { save } => {
                        validate_save(body, id, save, bb)?;
                        shape.suspends.push(id);
                    }
                    CoroInst::Size => shape.sizes.push(id),
                    CoroInst::Frame => shape.frames.push(id),
                    CoroInst::End { .. } => shape.ends.push(id),
                    CoroInst::Return { .. } => shape.returns.push(id),
                    // Subfunction lookups are chased through operands by
                    // the simplifier, never cataloged.
                    CoroInst::SubFn { .. } => {}
                }
            }
            if matches!(body.block(bb).terminator, Terminator::Return(_)) {
                shape.plain_returns.push(bb);
            }
        }

        shape.order_final_suspend(body)?;
        shape.order_final_end(body)?;
        shape.classify_unwind_ends(body)?;
        shape.resolve_promise(body)?;
        Ok(shape)
    }

    fn order_final_suspend(&mut self, body: &Body) -> Result<()> {
        let finals: Vec<usize> = self
            .suspends
            .iter()
            .enumerate()
            .filter(|(_, &s)| is_final_suspend(body, s))
            .map(|(i, _)| i)
            .collect();
        if finals.len() > 1 {
            return Err(malformed_coroutine("more than one final suspend point"));
        }
        if let Some(&pos) = finals.first() {
            let s = self.suspends.remove(pos);
            self.suspends.insert(0, s);
            self.final_suspend = Some(s);
        }
        Ok(())
    }

    fn order_final_end(&mut self, body: &Body) -> Result<()> {
        if self.ends.is_empty() {
            return Ok(());
        }
        let finals: Vec<usize> = self
            .ends
            .iter()
            .enumerate()
            .filter(|(_, &e)| !is_unwind_end(body, e))
            .map(|(i, _)| i)
            .collect();
        if finals.len() != 1 {
            return Err(malformed_coroutine(format!(
                "expected exactly one final end marker, found {}",
                finals.len()
            )));
        }
        let e = self.ends.remove(finals[0]);
        self.ends.insert(0, e);
        Ok(())
    }

    fn classify_unwind_ends(&mut self, body: &Body) -> Result<()> {
        for &end in self.ends.iter().skip(1) {
            let block = body.block_of(end).ok_or_else(|| {
                malformed_coroutine(format!("unwind end marker %{} is detached", end))
            })?;
            let first = *body.block(block).insts.first().ok_or_else(|| {
                malformed_coroutine(format!("unwind end marker %{} leads an empty block", end))
            })?;
            let kind = match &body.inst(first).kind {
                InstKind::LandingPad { cleanup: true } => UnwindKind::Propagate,
                InstKind::CleanupPad => UnwindKind::CleanupReturn,
                _ => {
                    return Err(malformed_coroutine(format!(
                        "unwind end marker %{} is not inside an unwind pad",
                        end
                    )))
                }
            };
            self.unwind_ends.push((end, kind));
        }
        Ok(())
    }

    fn resolve_promise(&mut self, body: &Body) -> Result<()> {
        let Some(&begin) = self.begins.last() else {
            return Ok(());
        };
        let InstKind::Coro(CoroInst::Begin { promise, .. }) = &body.inst(begin).kind else {
            unreachable!("cataloged begin marker changed kind");
        };
        if promise.is_null() {
            return Ok(());
        }
        match strip_pointer_casts(body, promise) {
            Value::Inst(id) if matches!(body.inst(*id).kind, InstKind::Alloca { .. }) => {
                self.promise = Some(*id);
            }
            _ => {
                return Err(malformed_coroutine(
                    "begin marker's promise operand is not a stack slot",
                ))
            }
        }
        Ok(())
    }

    pub fn begin(&self) -> Result<InstId> {
        self.begins
            .last()
            .copied()
            .ok_or_else(|| malformed_coroutine("coroutine has no begin marker"))
    }

    pub fn final_end(&self) -> Result<InstId> {
        self.ends
            .first()
            .copied()
            .ok_or_else(|| malformed_coroutine("coroutine has no end marker"))
    }

    pub fn save_of(&self, body: &Body, suspend: InstId) -> Result<InstId> {
        let InstKind::Coro(CoroInst::Suspend { save }) = &body.inst(suspend).kind else {
            return Err(malformed_coroutine(format!(
                "%{} is not a suspend marker",
                suspend
            )));
        };
        match save {
            Value::Inst(id) => Ok(*id),
            _ => Err(malformed_coroutine(format!(
                "suspend %{} lost its save marker",
                suspend
            ))),
        }
    }

    pub fn has_final_suspend(&self) -> bool {
        self.final_suspend.is_some()
    }

    pub fn dump(&self, name: &Name) {
        debug!(
            function = %name,
            begins = self.begins.len(),
            suspends = self.suspends.len(),
            saves = self.saves.len(),
            ends = self.ends.len(),
            frees = self.frees.len(),
            sizes = self.sizes.len(),
            frames = self.frames.len(),
            returns = self.returns.len(),
            "coroutine shape"
        );
    }

    /// Total number of cataloged markers, across every bucket.
    pub fn marker_count(&self) -> usize {
        self.begins.len()
            + self.allocs.len()
            + self.frees.len()
            + self.saves.len()
            + self.suspends.len()
            + self.sizes.len()
            + self.frames.len()
            + self.ends.len()
            + self.returns.len()
    }
}

fn validate_save(body: &Body, suspend: InstId, save: &Value, block: BlockId) -> Result<()> {
    let Value::Inst(save_id) = save else {
        return Err(malformed_coroutine(format!(
            "suspend %{} has no save marker operand",
            suspend
        )));
    };
    let is_save = matches!(body.inst(*save_id).kind, InstKind::Coro(CoroInst::Save { .. }));
    if !is_save {
        return Err(malformed_coroutine(format!(
            "suspend %{} paired with %{}, which is not a save marker",
            suspend, save_id
        )));
    }
    let save_pos = body.position(block, *save_id);
    let suspend_pos = body.position(block, suspend);
    match (save_pos, suspend_pos) {
        (Some(s), Some(u)) if s < u => Ok(()),
        _ => Err(malformed_coroutine(format!(
            "suspend %{} is not dominated by its save in the same block",
            suspend
        ))),
    }
}

fn is_final_suspend(body: &Body, suspend: InstId) -> bool {
    let InstKind::Coro(CoroInst::Suspend { save }) = &body.inst(suspend).kind else {
        return false;
    };
    match save {
        Value::Inst(id) => {
            matches!(
                body.inst(*id).kind,
                InstKind::Coro(CoroInst::Save { is_final: true })
            )
        }
        _ => false,
    }
}

fn is_unwind_end(body: &Body, end: InstId) -> bool {
    matches!(
        body.inst(end).kind,
        InstKind::Coro(CoroInst::End { unwind: true })
    )
}

/// Split-state of a begin marker, decoded from its info operand.
pub fn split_status(module: &Module, body: &Body, begin: InstId) -> SplitStatus {
    let InstKind::Coro(CoroInst::Begin { info, .. }) = &body.inst(begin).kind else {
        return SplitStatus::NotYetProcessed;
    };
    let Value::Global(name) = info else {
        return SplitStatus::NotYetProcessed;
    };
    match module.global(name.as_str()).and_then(|g| g.initializer.as_ref()) {
        Some(Constant::Struct(..)) => SplitStatus::Outlined(name.clone()),
        Some(Constant::Array(..)) => SplitStatus::PostSplit(name.clone()),
        _ => SplitStatus::NotYetProcessed,
    }
}
