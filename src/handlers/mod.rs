//! HTTP handlers: request parsing and response shaping.

pub mod health_handlers;
pub mod photo_handlers;
