//! Confidence-gated answering, LLM-judged self-play and the scheduler
//! that tunes how hard every other learning component trains.

mod active_learning;
mod meta_learner;
mod self_play;

pub use active_learning::{Action, ActiveLearning, ActiveLearningStats, Assessment, RouteSignal};
pub use meta_learner::{
    AdaptiveLrScheduler, CurriculumScheduler, LearnerProfile, MetaLearner, MetaLearnerStats, PerformanceStats, PerformanceTracker, Trend,
    MANAGED_COMPONENTS,
};
pub use self_play::{Evaluation, ExamResult, SelfPlay};
