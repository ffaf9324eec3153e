//! Shared utilities for the orchestration core.

pub mod ring;

pub use ring::RingBuffer;
