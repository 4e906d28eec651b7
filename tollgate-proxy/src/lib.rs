pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod pipeline;
pub mod worker;

pub use auth::Authenticator;
pub use pipeline::{Pipeline, PipelineOutcome};
pub use worker::{SharedState, spawn_workers};
