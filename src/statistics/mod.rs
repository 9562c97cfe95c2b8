mod home_assistant;
mod publisher;
mod types;

pub use home_assistant::HomeAssistantStore;
pub use publisher::{plan_entries, StatisticsPublisher};
pub use types::{
    PublishMode, PublishResult, Resolution, StatisticBatch, StatisticEntry, StatisticMetadata,
};
