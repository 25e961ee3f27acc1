mod aggregator;
pub use aggregator::{COMBINED_TASK_ID, DEFAULT_TASK_ID, DataAggregator};

mod collector;
pub use collector::StatsCollector;
