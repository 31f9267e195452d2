//! Conformance harness for a request/response RPC messenger.
//!
//! [`calculator`] holds the services that exercise the transport, [`server`] hosts one of
//! them on a listening endpoint and [`driver`] holds the client side checks.

pub mod calculator;
pub mod driver;
pub mod payload;
pub mod rpc;
pub mod server;
