//! Integration test suite for gemini-agent.
//!
//! These tests drive the built binary the way a container runtime would:
//! environment variables in, exit status and files out.
//!
//! # Test Categories
//!
//! - `dispatch`: startup, validation, usage and `task` mode exit statuses
//! - `shutdown`: SIGTERM handling for the long-running modes
//! - `worker`: the task-processing programs end to end
//!
//! # CI Compatibility
//!
//! Child programs are `/bin/sh` stubs and the backend is a mock script, so
//! no network access or real credentials are needed.

mod fixtures;

mod dispatch;
mod shutdown;
mod worker;
