pub mod client;
pub mod message;
pub mod metrics;
mod service;
pub mod state;
pub mod task;
pub mod task_manager;
pub mod utils;
pub mod worker;

pub use message::{ConsumerRecord, ProducerRecord, TopicPartition};
pub use service::GLOBAL_CONFIG;
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ProcessingGuarantee,
    StreamsConfig,
};
pub use state::StateDirectory;
pub use task::{Assignment, AssignmentProvider, StaticAssignor, TaskId};
pub use task_manager::TaskManager;
pub use worker::{Worker, WorkerHandle, WorkerState};
