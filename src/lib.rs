//! Pull-based task dispatch between a central broker and remote agents.
//!
//! The server side is a [`broker::TaskBroker`] holding connected agents and
//! their queues, an HTTP API ([`api`]) through which agents register, stream
//! envelopes and post results, and a [`core::Orchestrator`] that runs each
//! task's steps against the [`db`] store. The agent side is
//! [`agent::AgentRuntime`].

pub mod agent;
pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod db;
pub mod errors;
pub mod event;
pub mod schema;
pub mod utils;
