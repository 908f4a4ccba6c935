//! Queue engine: lifecycle controller and worker loop.

pub mod controller;
pub mod diagnostics;
pub mod worker;

pub use controller::QueueController;
pub use worker::{ProcessorRegistry, TaskProcessor, Worker, WorkerConfig};
