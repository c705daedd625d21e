pub mod decision;
pub mod policy;
pub mod request;

pub use decision::{Action, Decision, DecisionStage, DEFAULT_ACTION_LABEL};
pub use policy::{PolicyDoc, RuleDef, RuleSource};
pub use request::{RequestDescriptor, RequestSummary};
