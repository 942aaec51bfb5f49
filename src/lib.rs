//! Frontgate - a pre-forking front-end server for single-page apps
//!
//! A supervisor process keeps a pool of worker processes at the configured
//! size and replaces them one at a time on reload. Each worker:
//! - Listens for HTTP(S), optionally behind a PROXY protocol v1 load balancer
//! - Routes requests to the app mounted at the longest matching basepath
//! - Resolves the user through a remote identity service before rendering
//! - Redirects unauthenticated users to login and pending users to their login action

pub mod config;
pub mod error;
pub mod protocol;
pub mod render;
pub mod session;
pub mod signals;
pub mod supervisor;
pub mod worker;
