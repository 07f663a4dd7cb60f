pub use record::{ConsumerRecord, ProducerRecord};
pub use topic_partition::TopicPartition;

mod record;
mod topic_partition;
