pub mod controller;
pub mod orchestrator;
pub mod poller;
pub mod probe;
pub mod result;
pub mod robots;
pub mod scheduler;
pub mod task;
pub mod worker;
