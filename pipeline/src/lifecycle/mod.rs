//! Lifecycle (retention) policy management for remote repositories.

pub mod backend;
pub mod evaluate;
pub mod manager;
pub mod policy;

pub use backend::{AwsCliBackend, InMemoryBackend, LifecycleBackend, RemoteImage};
pub use evaluate::{evaluate, ExpiringImage};
pub use manager::{ApplyOutcome, LifecycleManager, PolicyState};
pub use policy::{
    Action, ActionType, CountType, CountUnit, LifecyclePolicy, Rule, Selection, TagStatus,
};
