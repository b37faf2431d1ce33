//! Promotion chains
//!
//! A [`PromotionRequest`] walks one artifact through a plan's environments in
//! order. Every state change is persisted before the next side effect, so a
//! chain suspended at approval can be resumed by a later process.

pub mod approval;
pub mod controller;
pub mod guard;
pub mod importer;
pub mod ledger;
pub mod state;
pub mod store;

pub use approval::{ApprovalDecision, Decision, RejectionPolicy};
pub use controller::{ControllerParts, PromotionController, PromotionReport};
pub use guard::PromotionLocks;
pub use importer::{CommandImporter, ImportReceipt, ImportRequest, Importer};
pub use ledger::{ImportLedger, ImportRecord};
pub use state::{PromotionRequest, PromotionStatus, StageFailure, StageRecord};
pub use store::RequestStore;
