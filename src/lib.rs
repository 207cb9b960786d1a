//! # opsync
//!
//! Materializes secrets from a 1Password-style secret store onto local disk
//! and reconciles dependent systemd units when secret content changes.
//!
//! ## Overview
//!
//! Each invocation is a single finite batch job:
//!
//! 1. **Pre-flight** - validates the configuration (duplicate keys/paths are
//!    rejected before any network call), the output directory, and token
//!    file hygiene
//! 2. **Authentication** - a service account token file or the signed-in
//!    desktop app, modeled as one tagged credential source
//! 3. **Processing** - bounded-concurrency fetches, SHA-256 change detection
//!    against the files on disk, and atomic temp-file-plus-rename writes
//! 4. **Reconciliation** - an ordered, deduplicated action plan executed
//!    against systemd, collecting per-unit failures without aborting the
//!    remaining units
//!
//! The run holds an exclusive lock on the output directory for its whole
//! duration, so overlapping invocations fail fast instead of interleaving
//! writes. A destination file is always either its previous value or the
//! new one, never a partial write.
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for configuration examples.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod processor;
pub mod reconciler;
pub mod runlock;
pub mod store;
pub mod systemd;
pub mod validation;
