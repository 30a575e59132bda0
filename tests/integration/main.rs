//! Integration tests, consolidated into a single binary.
//!
//! Each module drives a full session through `MainCoordinator` with scripted
//! recognition, generation and synthesis.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod helpers;

mod barge_in;
mod resilience;
mod turns;
