//! Stitch Server Library
//!
//! Resumable, content-addressed chunked uploads. Clients split a file into
//! fixed-size chunks, ask which ones the server already holds, upload the
//! rest in any order and ask the server to stitch them back together.
//!
//! # Modules
//!
//! - `upload`: Chunk storage, resume probe, merge engine and reaper
//! - `events`: Per-identity event fan-out for websocket clients
//! - `routes`: HTTP and websocket bindings
//! - `config`: Environment configuration

pub mod config;
pub mod events;
pub mod routes;
pub mod state;
pub mod upload;
