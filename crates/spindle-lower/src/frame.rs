//! Activation-frame construction.
//!
//! The splitter delegates layout to this collaborator and consumes only
//! the resulting frame type, the bound frame pointer, and the
//! spill-initialization block; it never decides the spill set itself.

use std::collections::HashSet;

use itertools::Itertools;
use spindle_core::error::Result;
use spindle_core::ir::{
    Body, BlockId, CoroInst, Function, InstId, InstKind, Terminator, Ty, Value,
};
use tracing::debug;

use crate::error::lowering_error;
use crate::shape::Shape;
use crate::utils::{block_and_pos, remove_lifetime_markers};

/// Fixed frame header: resume pointer, destroy pointer, suspend index.
pub const RESUME_FIELD: u32 = 0;
pub const DESTROY_FIELD: u32 = 1;
pub const INDEX_FIELD: u32 = 2;

/// Type of the state-machine entry points stored in the frame header.
/// They take the raw frame handle; each clone re-derives the typed frame
/// pointer itself, which keeps the frame record non-recursive.
pub fn resume_fn_ty() -> Ty {
    Ty::function(Ty::Void, vec![Ty::byte_ptr()])
}

pub fn resume_fn_ptr_ty() -> Ty {
    Ty::ptr_to(resume_fn_ty())
}

#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub frame_ty: Ty,
    pub frame_ptr: InstId,
    pub spill_block: BlockId,
    pub spill_count: usize,
}

pub trait FrameLowering {
    /// Compute the frame layout for `f` and rewrite its body to access
    /// spilled storage through the frame. Invoked exactly once per split,
    /// after suspend simplification, before dispatch construction.
    fn build(&self, f: &mut Function, shape: &Shape) -> Result<FrameInfo>;
}

/// Frame construction with a straightforward cross-suspend liveness scan.
pub struct DefaultFrameLowering;

impl FrameLowering for DefaultFrameLowering {
    fn build(&self, f: &mut Function, shape: &Shape) -> Result<FrameInfo> {
        remove_lifetime_markers(&mut f.body);
        let begin = shape.begin()?;

        let reach = block_reachability(&f.body);
        let suspend_sites = sites_of(&f.body, &shape.suspends)?;

        // Stack slots and SSA values that must live in the frame.
        let alloca_spills = collect_alloca_spills(&f.body, shape, &reach, &suspend_sites);
        let ssa_spills = collect_ssa_spills(&f.body, &reach, &suspend_sites);

        let mut fields = vec![resume_fn_ptr_ty(), resume_fn_ptr_ty(), Ty::I8];
        let promise_field = shape.promise.map(|p| {
            fields.push(allocated_ty(&f.body, p));
            (fields.len() - 1) as u32
        });
        let alloca_fields: Vec<(InstId, u32)> = alloca_spills
            .iter()
            .map(|&a| {
                fields.push(allocated_ty(&f.body, a));
                (a, (fields.len() - 1) as u32)
            })
            .collect();
        let ssa_fields: Vec<(InstId, u32)> = ssa_spills
            .iter()
            .map(|&v| {
                fields.push(f.body.inst(v).ty.clone());
                (v, (fields.len() - 1) as u32)
            })
            .collect();

        let frame_ty = Ty::Struct {
            fields,
            packed: false,
            name: Some(format!("{}.frame", f.name)),
        };
        debug!(
            function = %f.name,
            spills = alloca_fields.len() + ssa_fields.len(),
            promise = promise_field.is_some(),
            "built coroutine frame"
        );

        // The promise slot moves into the frame; the begin marker keeps a
        // null in its promise operand from here on.
        if shape.promise.is_some() {
            clear_promise_operand(&mut f.body, begin);
        }

        // Bind the typed frame pointer right after the begin marker and
        // open the spill-initialization block between the begin block and
        // its continuation.
        let frame_ptr = f
            .body
            .insert_after(
                begin,
                InstKind::Bitcast {
                    value: Value::Inst(begin),
                },
                Ty::ptr_to(frame_ty.clone()),
            )
            .ok_or_else(|| lowering_error("begin marker is detached"))?;
        let (begin_bb, fp_pos) = block_and_pos(&f.body, frame_ptr)?;
        let continuation = f.body.split_block(begin_bb, fp_pos + 1, "coro.start");
        let spill_block = f.body.new_block("alloca.spill");
        f.body.block_mut(begin_bb).terminator = Terminator::Br(spill_block);
        f.body.block_mut(spill_block).terminator = Terminator::Br(continuation);

        // Stack slots collapse to frame-field addresses in the spill block.
        let mut slot_rewrites: Vec<(InstId, u32)> = Vec::new();
        if let (Some(promise), Some(field)) = (shape.promise, promise_field) {
            slot_rewrites.push((promise, field));
        }
        slot_rewrites.extend(alloca_fields.iter().copied());
        for (alloca, field) in slot_rewrites {
            let elem = allocated_ty(&f.body, alloca);
            let addr = f.body.push_inst(
                spill_block,
                InstKind::FieldAddr {
                    base: Value::Inst(frame_ptr),
                    struct_ty: frame_ty.clone(),
                    field,
                },
                Ty::ptr_to(elem),
            );
            f.body.replace_inst_with_value(alloca, &Value::Inst(addr));
        }

        // SSA spills: store right after the definition, reload in front of
        // every use the store does not dominate without crossing a suspend.
        let mut spill_stores: HashSet<InstId> = HashSet::new();
        for &(value, field) in &ssa_fields {
            let elem = f.body.inst(value).ty.clone();
            let addr = f
                .body
                .insert_after(
                    value,
                    InstKind::FieldAddr {
                        base: Value::Inst(frame_ptr),
                        struct_ty: frame_ty.clone(),
                        field,
                    },
                    Ty::ptr_to(elem),
                )
                .ok_or_else(|| lowering_error("spilled value is detached"))?;
            let store = f
                .body
                .insert_after(
                    addr,
                    InstKind::Store {
                        value: Value::Inst(value),
                        addr: Value::Inst(addr),
                    },
                    Ty::Void,
                )
                .ok_or_else(|| lowering_error("spill address is detached"))?;
            spill_stores.insert(store);
        }
        for &(value, field) in &ssa_fields {
            insert_reloads(&mut f.body, value, field, &frame_ty, frame_ptr, &spill_stores)?;
        }

        Ok(FrameInfo {
            frame_ty,
            frame_ptr,
            spill_block,
            spill_count: alloca_fields.len() + ssa_fields.len(),
        })
    }
}

fn allocated_ty(body: &Body, alloca: InstId) -> Ty {
    match &body.inst(alloca).kind {
        InstKind::Alloca { ty } => ty.clone(),
        _ => Ty::I8,
    }
}

fn clear_promise_operand(body: &mut Body, begin: InstId) {
    if let InstKind::Coro(CoroInst::Begin { promise, .. }) = &mut body.inst_mut(begin).kind {
        *promise = Value::Null(Ty::byte_ptr());
    }
}

/// (block, position) of one program point. Terminators sit past the last
/// instruction of their block.
type Site = (BlockId, usize);

fn sites_of(body: &Body, insts: &[InstId]) -> Result<Vec<Site>> {
    insts.iter().map(|&i| block_and_pos(body, i)).collect()
}

/// Blocks reachable from each block through at least one control edge.
fn block_reachability(body: &Body) -> Vec<HashSet<BlockId>> {
    let block_count = body.blocks.len();
    let mut reach = Vec::with_capacity(block_count);
    for bb in body.block_ids() {
        let mut seen: HashSet<BlockId> = HashSet::new();
        let mut work: Vec<BlockId> = body.block(bb).terminator.successors();
        while let Some(next) = work.pop() {
            if seen.insert(next) {
                work.extend(body.block(next).terminator.successors());
            }
        }
        reach.push(seen);
    }
    reach
}

/// Can control flow from `from` to `to`? Same-block queries compare
/// positions only; loop paths re-entering the block are not chased, which
/// keeps the scan linear and errs on the side of fewer spills.
fn reaches(reach: &[HashSet<BlockId>], from: Site, to: Site) -> bool {
    if from.0 == to.0 {
        from.1 < to.1
    } else {
        reach[from.0 as usize].contains(&to.0)
    }
}

fn crosses_suspend(
    body: &Body,
    reach: &[HashSet<BlockId>],
    def: Site,
    value: InstId,
    suspend_sites: &[Site],
    skip: &HashSet<InstId>,
) -> bool {
    let mut crossing = false;
    for_each_use(body, value, skip, &mut |use_site| {
        for &s in suspend_sites {
            if reaches(reach, def, s) && reaches(reach, s, use_site) {
                crossing = true;
            }
        }
    });
    crossing
}

/// Visit the site of every use of `value`, instructions and terminators
/// alike, skipping instructions in `skip`.
fn for_each_use(
    body: &Body,
    value: InstId,
    skip: &HashSet<InstId>,
    visit: &mut impl FnMut(Site),
) {
    let needle = Value::Inst(value);
    for bb in body.block_ids() {
        let block = body.block(bb);
        for (pos, &id) in block.insts.iter().enumerate() {
            if skip.contains(&id) {
                continue;
            }
            let mut used = false;
            body.inst(id).kind.for_each_value(&mut |v| {
                if v == &needle {
                    used = true;
                }
            });
            if used {
                visit((bb, pos));
            }
        }
        let mut used = false;
        block.terminator.for_each_value(&mut |v| {
            if v == &needle {
                used = true;
            }
        });
        if used {
            visit((bb, block.insts.len()));
        }
    }
}

fn collect_alloca_spills(
    body: &Body,
    shape: &Shape,
    reach: &[HashSet<BlockId>],
    suspend_sites: &[Site],
) -> Vec<InstId> {
    let skip = HashSet::new();
    (0..body.insts.len() as InstId)
        .filter(|&id| {
            if Some(id) == shape.promise {
                return false;
            }
            if !matches!(body.inst(id).kind, InstKind::Alloca { .. }) {
                return false;
            }
            let Some(block) = body.block_of(id) else {
                return false;
            };
            let Some(pos) = body.position(block, id) else {
                return false;
            };
            crosses_suspend(body, reach, (block, pos), id, suspend_sites, &skip)
        })
        .collect()
}

fn collect_ssa_spills(
    body: &Body,
    reach: &[HashSet<BlockId>],
    suspend_sites: &[Site],
) -> Vec<InstId> {
    let skip = HashSet::new();
    (0..body.insts.len() as InstId)
        .filter(|&id| {
            let inst = body.inst(id);
            if matches!(inst.ty, Ty::Void | Ty::Token) {
                return false;
            }
            if matches!(
                inst.kind,
                InstKind::Coro(_)
                    | InstKind::Alloca { .. }
                    | InstKind::LandingPad { .. }
                    | InstKind::CleanupPad
                    | InstKind::Nop
            ) {
                return false;
            }
            let Some(block) = body.block_of(id) else {
                return false;
            };
            let Some(pos) = body.position(block, id) else {
                return false;
            };
            crosses_suspend(body, reach, (block, pos), id, suspend_sites, &skip)
        })
        .collect()
}

/// Insert a frame reload in front of every use of `value` that is not
/// served by the in-block definition: uses in other blocks, and same-block
/// uses with a suspend in between.
fn insert_reloads(
    body: &mut Body,
    value: InstId,
    field: u32,
    frame_ty: &Ty,
    frame_ptr: InstId,
    spill_stores: &HashSet<InstId>,
) -> Result<()> {
    let (def_block, def_pos) = block_and_pos(body, value)?;
    let same_block_suspends: Vec<usize> = body
        .block(def_block)
        .insts
        .iter()
        .enumerate()
        .filter(|(_, &id)| matches!(body.inst(id).kind, InstKind::Coro(CoroInst::Suspend { .. })))
        .map(|(pos, _)| pos)
        .collect();

    let mut use_sites: Vec<(BlockId, usize, Option<InstId>)> = Vec::new();
    {
        let needle = Value::Inst(value);
        for bb in body.block_ids() {
            let block = body.block(bb);
            for (pos, &id) in block.insts.iter().enumerate() {
                if spill_stores.contains(&id) {
                    continue;
                }
                let mut used = false;
                body.inst(id).kind.for_each_value(&mut |v| {
                    if v == &needle {
                        used = true;
                    }
                });
                if used {
                    use_sites.push((bb, pos, Some(id)));
                }
            }
            let mut used = false;
            block.terminator.for_each_value(&mut |v| {
                if v == &needle {
                    used = true;
                }
            });
            if used {
                use_sites.push((bb, block.insts.len(), None));
            }
        }
    }

    // Highest positions first, so earlier insertions never shift a
    // pending use site.
    let elem = body.inst(value).ty.clone();
    for (bb, pos, user) in use_sites
        .into_iter()
        .sorted_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)))
    {
        let needs_reload = if bb != def_block {
            true
        } else {
            same_block_suspends
                .iter()
                .any(|&s| def_pos < s && s < pos)
        };
        if !needs_reload {
            continue;
        }
        let addr = body.insert_inst(
            bb,
            pos,
            InstKind::FieldAddr {
                base: Value::Inst(frame_ptr),
                struct_ty: frame_ty.clone(),
                field,
            },
            Ty::ptr_to(elem.clone()),
        );
        let reload = body.insert_inst(
            bb,
            pos + 1,
            InstKind::Load {
                addr: Value::Inst(addr),
            },
            elem.clone(),
        );
        let replacement = Value::Inst(reload);
        let needle = Value::Inst(value);
        match user {
            Some(user) => {
                body.inst_mut(user).kind.for_each_value_mut(&mut |v| {
                    if v == &needle {
                        *v = replacement.clone();
                    }
                });
            }
            None => {
                body.block_mut(bb).terminator.for_each_value_mut(&mut |v| {
                    if v == &needle {
                        *v = replacement.clone();
                    }
                });
            }
        }
    }
    Ok(())
}
