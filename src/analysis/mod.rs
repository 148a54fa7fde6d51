//! Deterministic request analysis: feature extraction and the risk gate.
//!
//! Both passes are pure functions over the request content. They run before
//! any network call and their outputs are never softened by later stages.

pub mod pre;
pub mod risk;

pub use pre::{analyze, PreAnalysis};
pub use risk::{assess, RiskAssessment, RiskLevel, RiskSignal};
