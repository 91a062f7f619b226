//! API handlers
//!
//! Author: hephaex@gmail.com

pub mod debug;
pub mod health;
pub mod query;
