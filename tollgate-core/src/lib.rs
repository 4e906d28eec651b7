pub mod config;
pub mod error;
pub mod key;
pub mod plan;
pub mod route;
pub mod router;
pub mod upstream;
pub mod usage;
pub mod user;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use key::{ApiKey, Principal};
pub use plan::Plan;
pub use route::Route;
pub use router::{RouteMatch, Snapshot};
pub use upstream::Upstream;
pub use usage::{UsageEvent, UsageSummary};
pub use user::User;
