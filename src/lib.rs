//! # proxyhive
//!
//! Finds public proxies from multiple listing sites, concurrently validates
//! their protocols and anonymity against judge servers, keeps the working
//! ones in a health-ranked pool and can serve as a rotating local proxy
//! that forwards client traffic through that pool.
//!
//! The moving parts, in pipeline order: [`providers`] scrape candidate
//! `(host, port)` pairs, the [`Broker`] dedups and resolves them, the
//! [`Checker`] performs per-protocol handshakes and judge probes, and the
//! results land either on a consumer channel (`find`/`grab`) or in a
//! [`ProxyPool`] drained by the [`Server`] (`serve`).

pub mod broker;
pub mod checker;
pub mod errors;
pub mod geolite;
pub mod judge;
pub mod negotiators;
pub mod pool;
pub mod providers;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod utils;

pub use broker::{Broker, FindOptions, GrabOptions, ServeOptions};
pub use checker::Checker;
pub use errors::{Error, Result};
pub use judge::{Judge, JudgeScheme, JudgeSet};
pub use pool::{PoolConfig, ProxyPool};
pub use proxy::{Anonymity, Proto, Proxy, Scheme};
pub use resolver::Resolver;
pub use server::{Server, ServerConfig};
