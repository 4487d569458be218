//! A browsing agent: a polling control loop that observes a live page, asks a
//! reasoning backend for one action at a time and carries it out, with an
//! HTTP surface for starting, stopping and watching it.

pub mod brain;
pub mod config;
pub mod dom;
pub mod face;
pub mod hands;
pub mod orchestrator;
pub mod patcher;
pub mod profile;
pub mod queue;
pub mod state;
pub mod types;
