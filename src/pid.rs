// src/pid.rs

//! # PID Control Module
//!
//! This module provides the loop PID controller used by both stabilizers
//! and the relay-feedback auto-tuner that discovers its gains.

pub mod controller;
pub use controller::*;
pub mod tuner;
pub use tuner::*;
