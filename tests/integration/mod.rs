//! Integration test suite for netgauge.
//!
//! These tests wire the real worker, orchestrator, lifecycle and bus
//! together and drive whole runs through them.
//!
//! # Test Categories
//!
//! - `run_lifecycle`: phase sequencing and event publication for full runs
//! - `worker_ordering`: FIFO processing, reply routing and drain-on-stop
//! - `tcp_exchange`: the line-delimited JSON transport against a local server
//!
//! Nothing here leaves the loopback interface.

mod fixtures;

mod run_lifecycle;
