//! Meridian
//!
//! A multi-datacenter health supervisor for replicated Redis deployments.
//! The agent continuously probes every datacenter replica of each logical
//! instance, derives per-replica health verdicts, detects statistical
//! anomalies against learned baselines, and synthesizes cross-datacenter
//! failover decisions. When confidence is high enough it reroutes client
//! traffic by rewriting authoritative DNS records at the configured
//! provider. An optional LLM advisor corroborates failover verdicts with
//! client-side log evidence pulled from Elasticsearch.
//!
//! # Architecture
//!
//! The crate is divided into two main modules:
//! * `agent` - The supervision core: probing, health evaluation, anomaly
//!   detection, decision making, DNS failover, and alerting
//! * `web` - Read-only HTTP API exposing agent state

/// Supervision core: probes, health, anomalies, decisions, failover
pub mod agent;

/// Read-only HTTP API for agent state
pub mod web;
