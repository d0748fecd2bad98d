// Core types and functionality for the Switchyard session manager

pub mod catalog;
pub mod content;
pub mod conversation;
pub mod cursor;
pub mod elicitation;
pub mod tool;
pub mod types;

pub use types::*;
