//! Core budget logic for CareTrack.
//!
//! This crate contains pure business logic with ZERO web or database dependencies.
//! All domain types, validation rules, and calculations live here.
//!
//! # Modules
//!
//! - `budget` - Patient budget hierarchy, calculations, validation and the
//!   mutation engine that ties them to a document store

pub mod budget;
