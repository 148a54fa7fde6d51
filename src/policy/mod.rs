//! Policy: YAML-driven routing rules, atomic snapshots, and the decision
//! engine that fuses classification, risk, and budget into one route.

pub mod engine;
pub mod loader;
pub mod store;
pub mod types;

pub use engine::{BudgetReading, PolicyEngine, PolicyOutcome, SelectedRoute};
pub use store::{PolicySnapshot, PolicyStore};
pub use types::{
    BudgetControls, DepartmentPolicy, PolicyRule, PolicyTraceEntry, RuleAction, RuleMatch,
    TraceResult,
};
