//! Seam for the generic cleanup collaborators run around the split.
//!
//! The lowering treats these as black-box semantics-preserving passes; it
//! never depends on what they simplify, only that they keep the marker
//! contract intact.

use spindle_core::error::Result;
use spindle_core::ir::Function;
use tracing::trace;

pub trait FunctionPass {
    fn name(&self) -> &str;

    fn run(&self, f: &mut Function) -> Result<bool>;
}

pub struct NoopPass;

impl FunctionPass for NoopPass {
    fn name(&self) -> &str {
        "noop"
    }

    fn run(&self, _f: &mut Function) -> Result<bool> {
        Ok(false)
    }
}

pub fn run_passes(passes: &[Box<dyn FunctionPass>], f: &mut Function) -> Result<bool> {
    let mut changed = false;
    for pass in passes {
        let fired = pass.run(f)?;
        trace!(pass = pass.name(), function = %f.name, fired, "cleanup pass");
        changed |= fired;
    }
    Ok(changed)
}
