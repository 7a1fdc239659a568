//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate registry and repository calls into the public call surface.
//! - Keep callers decoupled from connection and SQL details.

pub mod annotation_service;
