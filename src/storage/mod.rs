pub mod cache;
pub mod queue;
pub mod schedules;
