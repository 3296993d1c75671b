//! CLI command implementations.

pub mod down;
pub mod status;
pub mod up;
