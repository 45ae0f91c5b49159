//! nextcloud-backup: one-shot backup pipeline for a containerized Nextcloud.
//!
//! Puts the application into maintenance mode, captures the database, the
//! data directory and the application volume into a staging directory,
//! ships a single archive to a remote host over SSH, and prunes remote
//! archives past their retention age. Maintenance mode and staging are
//! restored on every exit path.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod executor;
pub mod logging;

pub mod run;
pub mod staging;

pub mod capture;
pub mod maintenance;
pub mod manifest;
pub mod preflight;

pub mod retention;
pub mod transport;

pub mod pipeline;
