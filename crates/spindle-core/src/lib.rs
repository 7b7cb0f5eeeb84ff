// spindle-core: shared IR substrate for the spindle middle end
//
// Architecture:
// - ir: low-level IR (functions, blocks, instruction arena, values, types)
// - callgraph: whole-program call graph and SCC scheduling order
// - error: the error type shared by every pass

#[macro_use]
pub mod macros;

pub mod callgraph;
pub mod error;
pub mod ident;
pub mod ir;

// Re-export commonly used items for convenience
pub use tracing;

pub use ident::Name;

// Alias for error types
pub type Error = crate::error::Error;
pub type Result<T> = crate::error::Result<T>;
