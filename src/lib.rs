//! keygate - an authenticating proxy gateway.
//!
//! Clients connect over SOCKS5 or HTTP/HTTPS CONNECT and authenticate with a
//! username and password. Each `username:password` identity is bound to its
//! own upstream proxy (or chain of proxies) in a hot-reloadable route table;
//! traffic is tunneled through that upstream to the requested target.

pub mod app_state;
pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod routes;
pub mod session;
pub mod upstream;
