// spindle-lower: coroutine lowering passes for the spindle middle end
//
// Architecture:
// - shape: per-function catalog of protocol markers
// - passes: bootstrap normalization, suspend simplification, the splitter
// - frame: activation-frame construction (collaborator seam)
// - pipeline: SCC fixed-point driver tying the stages together

pub mod error;
pub mod frame;
pub mod passes;
pub mod pipeline;
pub mod shape;
pub mod utils;

// Re-export key types for convenience
pub use frame::{DefaultFrameLowering, FrameInfo, FrameLowering};
pub use passes::{split_coroutine, FunctionPass, NoopPass, SplitOutcome};
pub use pipeline::{CoroLowering, VisitOutcome};
pub use shape::{Shape, SplitStatus, UnwindKind};
