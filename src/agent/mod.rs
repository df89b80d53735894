//! Multi-datacenter supervision core
//!
//! This module implements the closed control loop of the agent:
//! probe every replica, derive a health verdict, score the sample against a
//! learned anomaly baseline, decide whether traffic should move to another
//! datacenter, and execute that move by rewriting DNS records.
//!
//! # Module Structure
//!
//! * `config` - Configuration loading, environment overrides, validation
//! * `context` - Shared runtime state (health table, active DC authority)
//! * `metrics` - Bounded in-memory sample and feature rings
//! * `probe` - Redis and admin-API probing per replica
//! * `health` - Health verdict model and the sample evaluator
//! * `anomaly` - Isolation-forest anomaly detection with persisted models
//! * `log_evidence` - Client-side log retrieval and error analysis
//! * `advisor` - Optional LLM second opinion for failover verdicts
//! * `decision` - Failover decision engine and post-failover audit
//! * `dns_failover` - Idempotent DNS record rewrites against providers
//! * `alerting` - Typed alert fan-out with deduplication

/// Configuration loading, environment overrides, validation
pub mod config;

/// Shared runtime state across the periodic loops
pub mod context;

/// Bounded in-memory metrics storage
pub mod metrics;

/// Per-replica probing
pub mod probe;

/// Health verdict model and evaluation
pub mod health;

/// Anomaly detection with persisted per-instance models
pub mod anomaly;

/// Client-side log evidence from the search service
pub mod log_evidence;

/// LLM-backed failover advisor
pub mod advisor;

/// Failover decision engine
pub mod decision;

/// DNS failover execution
pub mod dns_failover;

/// Alert management and delivery
pub mod alerting;
