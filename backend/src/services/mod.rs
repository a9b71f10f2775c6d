//! Service layer: lifecycle orchestration and its collaborator seams.

pub mod amendment_history;
pub mod consent_core;
pub mod notifier;
pub mod retention;
pub mod token;
