//! Core types shared by every emitter stage

pub mod config;
pub mod errors;
pub mod expression;
pub mod ir;
pub mod types;

pub use config::*;
pub use errors::*;
pub use expression::*;
pub use ir::*;
pub use types::*;
