use std::time::Duration;

use crate::config::Config;
use crate::routes::RouteTable;
use crate::session::SessionTracker;
use crate::upstream::Connector;

/// Everything a connection task needs, cloned into each accept.
///
/// The route table and session tracker are shared handles; the rest is
/// plain timeout plumbing from the config.
#[derive(Clone)]
pub struct AppState {
    pub routes: RouteTable,
    pub sessions: SessionTracker,
    pub connector: Connector,
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        AppState {
            routes: RouteTable::new(config.routes_file.clone()),
            sessions: SessionTracker::new(),
            connector: Connector::new(config.dial_timeout(), config.handshake_timeout()),
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}
