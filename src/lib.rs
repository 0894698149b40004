//! # Meshagent - Reliable Delivery & Proactive Scheduling for Meshtastic Agents
//!
//! Meshagent is the delivery core of an autonomous agent that bridges a
//! Meshtastic mesh network and conversational AI backends. The radio link
//! carries a few hundred bytes per transmission, drops frames silently, echoes
//! implicit acks for our own packets and can go "zombie" (attachment up,
//! traffic dead) for minutes. This crate makes outbound delivery and
//! proactive notifications dependable on top of that.
//!
//! ## Features
//!
//! - **Outbound Delivery Pipeline**: sentence-aware chunking within the frame
//!   budget, per-destination lanes, class pacing, ack tracking with self-echo
//!   filtering, bounded retries and delivery reports.
//! - **Connection Health Monitor**: silence detection, a single active probe
//!   per silence episode, zombie detection, reconnection with escalation and a
//!   supervisor liveness file.
//! - **Proactive Task Scheduler**: one-shot reminders, recurring pings,
//!   edge-triggered telemetry watchers and deferred telemetry callbacks.
//! - **Response Worker Pool**: bounded background execution of AI replies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshagent::agent::MeshAgent;
//! use meshagent::config::Config;
//! use meshagent::health::ProcessExit;
//! use meshagent::transport::{loopback::LoopbackRadio, Destination};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshagent.toml").await?;
//!     let (radio, events) = LoopbackRadio::new(config.local_node()?);
//!     let agent = MeshAgent::new(config, Arc::new(radio.clone()), Arc::new(ProcessExit::default()))?;
//!     let handle = agent.start(events);
//!     radio.attach();
//!
//!     agent.pipeline().send_notification(&[Destination::Channel(0)], "Agent online");
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - radio adapter seam and the loopback radio
//! - [`delivery`] - chunking, pacing, ack tracking and retries
//! - [`health`] - link state machine, watchdog and liveness file
//! - [`scheduler`] - reminders, watchers and telemetry table
//! - [`workers`] - bounded AI-response pool
//! - [`agent`] - context object wiring everything together
//! - [`config`] - configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  telemetry  ┌─────────────────┐
//! │ Transport events│ ──────────► │   Scheduler     │
//! └─────────────────┘             └─────────────────┘
//!    │ activity/acks                    │ notifications
//! ┌─────────────────┐  link gate  ┌─────────────────┐
//! │ Health Monitor  │ ──────────► │ Delivery lanes  │ ──► Transport
//! └─────────────────┘             └─────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod health;
pub mod logutil;
pub mod metrics;
pub mod scheduler;
pub mod transport;
pub mod workers;
