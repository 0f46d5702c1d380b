//! API layer for keel-daemon

pub mod rest;

pub use rest::router::create_router;
