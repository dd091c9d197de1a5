pub mod daily_summary;
pub mod service;
pub mod types;

pub use daily_summary::DailySummaryService;
pub use service::{CronJobCallback, CronService};
pub use types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore};
