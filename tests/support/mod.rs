//! Helpers shared by integration tests.

#![allow(dead_code)]

pub mod range_server;
pub mod socket_guard;
pub mod tus_server;
