//! Template pipeline
//!
//! ```text
//! raw text -> scanner -> condition records -> compiler -> CompiledProgram
//!                                                            |
//!                               usage state -> assembler -> SQL text
//! ```

pub mod assembler;
pub mod compiler;
pub mod handler;
pub mod keyword;
pub mod program;
pub mod registry;
pub mod scanner;
pub mod usage;

pub use assembler::{assemble, assemble_with};
pub use compiler::{compile, CompileOptions};
pub use handler::{
    HandlerFactory, HandlerSet, MultiValueHandler, NumericHandler, QuoteHandler, RawHandler, SegmentHandler, Value,
};
pub use program::{CompiledProgram, Condition, Segment, SizeEstimator};
pub use registry::{NameRegistry, Tier, TierBounds};
pub use usage::{Bindings, UsageState};
