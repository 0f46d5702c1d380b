//! API request handlers

mod edge;
mod events;
mod health;
mod hosts;
mod rollouts;
mod services;

pub use edge::*;
pub use events::*;
pub use health::*;
pub use hosts::*;
pub use rollouts::*;
pub use services::*;
