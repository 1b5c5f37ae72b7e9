//! Producer/consumer work pipeline.
//!
//! Decouples fetching (I/O bound, externally rate limited) from analysis
//! (logic bound, driven by an injected strategy) so the two sides can be
//! scaled independently. Fetch-side pressure on the external resource is
//! bounded by a counting semaphore regardless of worker count.

mod hooks;
mod runner;

pub use hooks::{Decision, Evaluation, Evaluator, FetchError, Fetcher};
pub use runner::{PipelineConfig, PipelineReport, SubjectPipeline, CHECKPOINT_KEY};
