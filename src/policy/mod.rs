pub mod gate;
pub mod hot_reload;
pub mod loader;
pub mod retry;
pub mod snapshot;
pub mod store;

pub use gate::{ApprovalToken, GateError, PromotionGate, StagedSummary};
pub use hot_reload::{PolicyWatcher, ReloadError};
pub use loader::{parse_policy, LoadedPolicy, PolicyError, PolicyLoader};
pub use retry::RetryPolicy;
pub use snapshot::{PolicyDraft, PolicySet, PolicySummary, Rule, DEFAULT_MITIGATION_BAND};
pub use store::{PolicyStore, StoreError, DEFAULT_HISTORY_LIMIT};
