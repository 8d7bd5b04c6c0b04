//! Task lifecycle: statuses, task types and their steps, the orchestrator
//! that drives them, and the local document analyzer.

pub mod analyzer;
mod orchestrator;
mod task_state;
mod workflow;

pub use analyzer::{AnalysisError, Analyzer, TextAnalyzer};
pub use orchestrator::Orchestrator;
pub use task_state::*;
pub use workflow::*;
