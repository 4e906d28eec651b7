pub mod external;
pub mod quota;
pub mod rate_limit;
pub mod recorder;

pub use external::{ExternalEventInput, ExternalSubmitter, SubmitOutcome};
pub use quota::{QuotaChecker, QuotaDecision, month_bounds};
pub use rate_limit::{Admission, RateLimiter};
pub use recorder::{RecorderConfig, RecorderStats, UsageRecorder};
