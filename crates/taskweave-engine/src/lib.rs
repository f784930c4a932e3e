pub mod aggregator;
mod dispatch;
pub mod engine;
pub mod instantiator;
pub mod journal;
pub mod merge;
pub mod subdivision;
pub mod tracker;

pub use aggregator::{AggregateStatus, SubdivisionLink, SubdivisionTree, TreeNode};
pub use engine::{Engine, EngineSettings};
pub use instantiator::TaskInstantiator;
pub use journal::EventJournal;
pub use merge::rewrite::MergeDelta;
pub use merge::{Complexity, MergeCandidate, MergeOptions, MergePreview};
pub use subdivision::{SubWorkflow, SubdivisionRequest};
pub use tracker::DependencyTracker;
