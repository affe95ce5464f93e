pub mod control;
pub mod runner;
pub mod scheduler;
pub mod types;
pub mod watermark;

pub use control::{ControlError, Controller, StartFrom};
pub use scheduler::ChainScheduler;
