//! Emergency mitigation rules pushed outside the policy file lifecycle.

pub mod indicator;
pub mod publisher;
pub mod sweeper;

pub use indicator::{Indicator, IndicatorType};
pub use publisher::{
    MitigationConfig, MitigationError, MitigationOutcome, MitigationPublisher, MitigationRequest,
};
pub use sweeper::ExpirySweeper;
