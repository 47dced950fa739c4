//! Shared type definitions for the VSM temporal event processing core.
//!
//! This crate provides the identifier and subsystem-tag types used across the
//! clock, bus, store, detector and integrator crates. No business logic — just types.

pub mod ids;
pub mod subsystem;

pub use ids::{EventId, NodeId, PatternName, SubscriptionId};
pub use subsystem::Subsystem;
