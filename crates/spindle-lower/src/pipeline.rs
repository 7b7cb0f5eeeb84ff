//! The lowering pipeline: bootstrap normalization followed by a
//! fixed-point split over call-graph components.
//!
//! Every coroutine is visited twice. The first visit only tags it ready
//! and requests a revisit of its component, leaving a window for
//! interprocedural collaborators to inline into the body before the frame
//! layout is fixed. The second visit performs the split.

use spindle_core::callgraph::CallGraph;
use spindle_core::error::Result;
use spindle_core::ir::{CoroInst, InstKind, Module};
use tracing::debug;

use crate::error::malformed_coroutine;
use crate::frame::{DefaultFrameLowering, FrameLowering};
use crate::passes::bootstrap;
use crate::passes::cleanup::{run_passes, FunctionPass};
use crate::passes::split::split_coroutine;
use crate::shape::{split_status, SplitStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    Done,
    RequestRevisit,
}

pub struct CoroLowering {
    frame: Box<dyn FrameLowering>,
    pre_split: Vec<Box<dyn FunctionPass>>,
    post_split: Vec<Box<dyn FunctionPass>>,
    between_visits: Vec<Box<dyn FunctionPass>>,
}

impl Default for CoroLowering {
    fn default() -> Self {
        CoroLowering::new()
    }
}

impl CoroLowering {
    pub fn new() -> Self {
        CoroLowering {
            frame: Box::new(DefaultFrameLowering),
            pre_split: Vec::new(),
            post_split: Vec::new(),
            between_visits: Vec::new(),
        }
    }

    pub fn with_frame_lowering(mut self, frame: Box<dyn FrameLowering>) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_pre_split_pass(mut self, pass: Box<dyn FunctionPass>) -> Self {
        self.pre_split.push(pass);
        self
    }

    pub fn with_post_split_pass(mut self, pass: Box<dyn FunctionPass>) -> Self {
        self.post_split.push(pass);
        self
    }

    pub fn with_between_visit_pass(mut self, pass: Box<dyn FunctionPass>) -> Self {
        self.between_visits.push(pass);
        self
    }

    pub fn run(&self, module: &mut Module) -> Result<bool> {
        let mut changed = bootstrap::normalize_module(module)?;
        let mut graph = CallGraph::build(module);

        for component in graph.sccs_bottom_up() {
            loop {
                let coroutines: Vec<usize> = module
                    .functions
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| f.is_coroutine && component.contains(&f.name))
                    .map(|(idx, _)| idx)
                    .collect();
                if coroutines.is_empty() {
                    break;
                }

                let mut revisit = false;
                for idx in coroutines {
                    changed = true;
                    match self.visit(module, idx, &mut graph)? {
                        VisitOutcome::RequestRevisit => revisit = true,
                        VisitOutcome::Done => {}
                    }
                }
                if !revisit {
                    break;
                }

                // Interprocedural collaborators converge on the tagged
                // component before any frame layout is fixed.
                for name in &component {
                    if let Some(f) = module.function_mut(name.as_str()) {
                        run_passes(&self.between_visits, f)?;
                    }
                }
            }
        }
        Ok(changed)
    }

    fn visit(&self, module: &mut Module, idx: usize, graph: &mut CallGraph) -> Result<VisitOutcome> {
        if !module.functions[idx].ready_for_split {
            module.functions[idx].ready_for_split = true;
            debug!(function = %module.functions[idx].name, "tagged coroutine ready for split");
            return Ok(VisitOutcome::RequestRevisit);
        }

        // Bodies inlined from already-split coroutines carry post-split
        // begin markers; those are not ours to split again.
        let statuses = begin_statuses(module, idx);
        if statuses.is_empty() {
            return Err(malformed_coroutine(format!(
                "coroutine `{}` has no begin marker",
                module.functions[idx].name
            )));
        }
        if statuses
            .iter()
            .all(|status| matches!(status, SplitStatus::PostSplit(_)))
        {
            module.functions[idx].is_coroutine = false;
            return Ok(VisitOutcome::Done);
        }

        let outcome = split_coroutine(
            &mut module.functions[idx],
            self.frame.as_ref(),
            &self.pre_split,
            &self.post_split,
        )?;
        let caller = module.functions[idx].name.clone();
        graph.update(&caller, &outcome.new_callees);
        module.globals.extend(outcome.new_globals);
        module.functions.extend(outcome.new_functions);
        Ok(VisitOutcome::Done)
    }
}

fn begin_statuses(module: &Module, idx: usize) -> Vec<SplitStatus> {
    let function = &module.functions[idx];
    let mut statuses = Vec::new();
    for (id, inst) in function.body.insts.iter().enumerate() {
        if matches!(inst.kind, InstKind::Coro(CoroInst::Begin { .. })) {
            statuses.push(split_status(module, &function.body, id as u32));
        }
    }
    statuses
}
