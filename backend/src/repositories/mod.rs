//! Data access layer for the consent store.
//!
//! Every operation takes an active connection supplied by the caller; the
//! repository never opens or closes transactions itself.

pub mod attribute;
pub mod audit;
pub mod authorization;
pub mod common;
pub mod consent;
pub mod detailed;
pub mod history;
pub mod mapping;
pub mod transaction;
