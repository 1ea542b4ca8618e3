//! # DeCloud Orchestrator
//!
//! The control plane of the DeCloud decentralized VM-hosting network.
//! Untrusted worker hosts (nodes) register here, advertise hardware, run
//! guest VMs on behalf of tenants, and are paid per unit of metered usage.
//!
//! ## Core subsystems
//!
//! - **Node registry** ([`registry`]): registration, auth tokens, heartbeat
//!   ingestion, liveness scanning, VM state reconciliation.
//! - **Scheduler** ([`scheduler`]): benchmark-driven, point-based placement
//!   with overcommit-aware capacity and multi-factor scoring.
//! - **VM lifecycle** ([`lifecycle`]): the single transition authority for
//!   VM status, with idempotent side effects.
//! - **System VMs & mesh** ([`sysvm`]): per-node obligations (DHT, relay),
//!   WireGuard relay deployment and CGNAT enrollment, self-healing.
//! - **Central ingress** ([`ingress`]): subdomain and custom-domain route
//!   registry feeding an external reverse proxy with on-demand TLS.
//! - **Metering** ([`billing`]): attestation-gated usage recording and
//!   batched on-chain settlement.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     DeCloud Control Plane                      │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌────────────────┐  │
//! │  │ API :8181 │ │ Registry  │ │ Scheduler │ │ Lifecycle Mgr  │  │
//! │  └───────────┘ └───────────┘ └───────────┘ └────────────────┘  │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌────────────────┐  │
//! │  │ System VMs│ │ Ingress   │ │ Metering  │ │ Event Bus      │  │
//! │  └───────────┘ └───────────┘ └───────────┘ └────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//!                 │ register / heartbeat / command push
//!       ┌─────────┼──────────┐
//!       ▼         ▼          ▼
//!  ┌─────────┐ ┌─────────┐ ┌─────────┐
//!  │ Node 1  │ │ Node 2  │ │ Node N  │   (untrusted worker hosts)
//!  └─────────┘ └─────────┘ └─────────┘
//! ```
//!
//! Components communicate through the persistence gateway ([`store`]) and
//! the event bus ([`events`]), never via direct shared mutable state; this
//! is what keeps the reconciliation loops sound when individual ticks fail.

pub mod api;
pub mod auth;
pub mod billing;
pub mod commands;
pub mod config;
pub mod events;
pub mod ingress;
pub mod latency;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sysvm;

/// Default control plane API port
pub const CONTROL_PLANE_PORT: u16 = 8181;

/// Heartbeat interval handed to nodes at registration, in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// A node is considered offline after this many seconds without a heartbeat
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 120;
