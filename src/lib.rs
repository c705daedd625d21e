pub mod api;
pub mod client;
pub mod config;
pub mod decision_log;
pub mod domain;
pub mod engine;
pub mod error;
pub mod kpi;
pub mod mitigation;
pub mod observability;
pub mod policy;
pub mod predicate;

pub use config::Config;
pub use domain::{Action, Decision, RequestDescriptor};
pub use engine::RuleMatcher;
pub use error::{ConflictError, ValidationError};
pub use policy::{PolicySet, PolicyStore};
