//! Core data models for the photo backup service.
//!
//! These entities represent the logical structure of the per-user photo
//! index. They map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod photo;
