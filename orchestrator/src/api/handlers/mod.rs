//! API request handlers

pub mod health;
pub mod results;
pub mod sessions;
pub mod systems;
