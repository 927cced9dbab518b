pub mod controller;
pub mod react;

pub use controller::{run_stage, StageOutcome, ToolDispatcher, DEFAULT_MAX_ITERATIONS};
pub use react::{is_done_sentinel, parse_react, Directive};
