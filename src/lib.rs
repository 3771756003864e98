//! Devgate - runs a front-end dev server behind a gating reverse proxy
//!
//! This library:
//! - Launches a package script (`npm run start` and friends) on a free port
//! - Watches its stdout for a readiness marker and captures its stderr
//! - Holds incoming requests until the dev server is ready, sharing one startup
//! - Redirects the root path to the dev server and forwards everything else

pub mod config;
pub mod error;
pub mod gate;
pub mod pool;
pub mod port;
pub mod proxy;
pub mod runner;
pub mod startup;
pub mod stream;
