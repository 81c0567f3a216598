pub mod queue_pool;
pub mod segment;
pub mod sending_queue;
