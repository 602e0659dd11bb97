#![forbid(unsafe_code)]

//! Shared library behind the nicorank binaries: upstream ranking fetchers,
//! the KV cache, NG filtering and the ranking pipeline that ties them
//! together.

pub mod client_state;
pub mod config;
pub mod kv;
pub mod logging;
pub mod ng;
pub mod pipeline;
pub mod ranking;
pub mod refresh;
pub mod security;
pub mod stats;
pub mod tags;
pub mod throttle;
pub mod upstream;
