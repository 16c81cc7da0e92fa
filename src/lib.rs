//! # ToO Marshal
//!
//! Target-of-opportunity follow-up marshal for transient astronomy.
//!
//! This crate ingests GCN/VOEvent notices for multimessenger transients
//! (gravitational waves, neutrinos, gamma-ray bursts), correlates them into
//! events, acquires or synthesizes HEALPix probability maps, and generates
//! observing plans that tile the credible region with telescope fields.
//! Finished plans are submitted to heterogeneous scheduler backends. The
//! marshal exposes a REST API via Axum for operators and bots.
//!
//! ## Features
//!
//! - **Notice Ingestion**: Parse VOEvent XML, correlate notices to events,
//!   derive classification tags
//! - **Localization**: Download multiresolution HEALPix maps or synthesize
//!   them from error cones; extract credible-region contours
//! - **Planning**: Greedy field tiling over the credible region with a
//!   WORKING → READY → SUBMITTED plan lifecycle
//! - **Submission**: Dispatch plans to HTTP queue schedulers or to
//!   file-drop directories, in the queue wire format
//! - **HTTP API**: RESTful endpoints with background jobs and SSE progress
//!   streaming
//!
//! ## Architecture
//!
//! The crate is organized into several logical modules:
//!
//! - [`api`]: Shared value types and wire formats (event keys, filters,
//!   contours, queue exports)
//! - [`voevent`]: VOEvent XML parsing into typed notices
//! - [`correlator`]: Notice-to-event correlation and tagging
//! - [`healpix`]: NESTED-scheme pixelization and multiresolution tiles
//! - [`models`]: Domain types (events, maps, telescopes, plans)
//! - [`db`]: Repository pattern and persistence layer
//! - [`services`]: Acquisition, contouring, tiling, submission and the
//!   background pipeline
//! - [`http`]: Axum-based HTTP server and request handlers

// Allow large error types - RepositoryError contains rich context for debugging
#![allow(clippy::result_large_err)]

pub mod api;
pub mod config;
pub mod correlator;
pub mod healpix;
pub mod voevent;

pub mod db;
pub mod models;

pub mod services;

#[cfg(feature = "http-server")]
pub mod http;
