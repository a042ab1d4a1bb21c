//! Source abstraction layer for imageboard-harvester.
//!
//! # Sources
//!
//! A *source* is a remote site plus its API access method. This crate holds
//! everything needed to talk to one: the static [descriptor](descriptor)
//! (API format, auth scheme, endpoints, pacing intervals), the
//! [registry](descriptor::registry) of known sources, the authenticated
//! [client](client) with its per-(site, resource) [rate limiter](client::rate_limit),
//! the format-specific [response parsers](parser) that normalize wire formats
//! into [`Page`](parser::Page)s of [`Post`](ibh_common::post::Post)s, and the
//! [filter engine](filter) that partitions them.
#![deny(clippy::nursery)]

pub mod auth;
pub mod client;
pub mod descriptor;
pub mod filter;
pub mod parser;

pub use client::{ApiClient, ClientError};
pub use descriptor::{registry::SourceRegistry, ApiFormat, ResourceType, SourceDescriptor};
pub use filter::{FilterSet, FilterVerdict};
pub use parser::Page;
