pub mod config;
pub mod container;
pub mod cron_utils;
pub mod errors;
pub mod models;
pub mod registry;
pub mod traits;

pub use config::*;
pub use container::*;
pub use cron_utils::CronScheduler;
pub use errors::*;
pub use models::*;
pub use registry::*;
pub use traits::*;
