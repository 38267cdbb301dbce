//! Core business logic
//!
//! This module contains the lock synchronization engine and its
//! collaborators. It performs no subprocess or network side effects of its
//! own; everything external goes through the [`gateway::FetchGateway`]
//! trait or the registry/installable resolvers.

pub mod closure;
pub mod flake_ref;
pub mod gateway;
pub mod inputs;
pub mod installable;
pub mod lock;
pub mod profile;
pub mod registry;
pub mod sync;
pub mod update;
