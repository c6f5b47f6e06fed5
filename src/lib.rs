pub mod clock;
pub mod config;
pub mod error;
pub mod group;
pub mod job;
pub mod limiter;
pub mod reservoir;
pub mod sender;
pub mod throttler;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{LimiterConfig, ThrottlerConfig};
pub use error::{LimiterError, SendError, ThrottlerError, ThrottlerResult};
pub use group::LimiterGroup;
pub use job::{Job, JobHandle, JobId, JobResult, SendResponse, SmsMessage};
pub use limiter::{Limiter, LimiterCounts, LimiterEvent};
pub use reservoir::Reservoir;
pub use sender::{DryRunSender, SmsSender};
pub use throttler::{Throttler, ThrottlerStats};
