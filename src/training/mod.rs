pub mod experience;
pub mod grpo;
pub mod rewards;
pub mod sampler;

pub use experience::{build_experience, ExperienceBatch};
pub use grpo::GrpoTrainer;
pub use rewards::{RewardAggregator, RewardSource};
pub use sampler::{SampleGenerator, SampleGroup, SamplingParams, SYSTEM_PROMPT};
