//! AOT compilation cache for a JIT server and its clients.
//!
//! [`AotCacheServer`] keeps named caches of compiled methods and the
//! records those methods depend on, and answers [`AotCacheRequest`]s with
//! the artifact plus only the records the client lacks. [`AotCacheClient`]
//! builds requests, installs the artifacts it gets back, and reports which
//! ids it now holds.
//!
//! The building blocks are re-exported for embedders that need them
//! directly.

pub mod client;
pub mod config;
pub mod protocol;
pub mod report;
pub mod server;

pub use client::AotCacheClient;
pub use config::AotcConfig;
pub use protocol::{
    AotCacheRequest, AotCacheResponse, ClassDescriptor, MethodDescriptor, PROTOCOL_VERSION,
};
pub use report::{CacheReport, ServerReport, ServerStatistics, ServerStatisticsSnapshot};
pub use server::{AotCacheServer, ClientSession, CompileContext};

pub use aotc_canon;
pub use aotc_client;
pub use aotc_error::{AotError, ErrorCode, Result};
pub use aotc_store;
pub use aotc_types;
