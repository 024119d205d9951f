pub mod job;
pub mod selector;

pub use job::{format_env, new_job_id, CompositeJobId, JobSummary, NewJob};
pub use selector::{HostSelector, LeastLoaded, RandomHost};
