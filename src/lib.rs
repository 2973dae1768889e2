pub mod config;
pub mod coordination;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod util;
pub mod worker;

pub use config::Config;
pub use coordination::{Assignment, Coordinator, NewTask, Refusal, Update};
pub use error::{Error, Result};
