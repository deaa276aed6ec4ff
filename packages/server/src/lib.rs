// Batch workload manager - protocol engine and dispatch core
//
// This crate is the server side of the batch system: it accepts DIS
// batch requests from clients, schedulers and execution daemons (MoMs),
// keeps the durable object state in Postgres, and drives jobs and
// reservations through their state machines.
//
// Request handlers live in dispatch/, per-object logic in domains/*.

pub mod common;
pub mod config;
pub mod dispatch;
pub mod domains;
pub mod exec;
pub mod kernel;
pub mod net;

pub use config::*;
