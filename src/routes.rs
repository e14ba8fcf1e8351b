//! The identity-to-upstream route table.
//!
//! Keys are the exact `username:password` byte concatenation; values are
//! parsed [`UpstreamSpec`]s. Lookups run concurrently; writers are
//! serialized and, when a snapshot file is configured, durable: the
//! in-memory table only changes after the snapshot write succeeds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::upstream::{SpecError, UpstreamSpec};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route snapshot I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("route snapshot format: {0}")]
    Format(#[from] serde_yaml::Error),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("no snapshot file configured")]
    NoSnapshotPath,
}

/// On-disk snapshot shape:
///
/// ```yaml
/// services:
///   - users:
///       - username: alice
///         password: pw
///         forward: socks5://u:p@hop:1080 -> http://exit:8080
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceEntry {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    username: String,
    password: String,
    forward: String,
}

#[derive(Clone)]
pub struct RouteTable {
    entries: Arc<RwLock<HashMap<String, UpstreamSpec>>>,
    // Serializes mutators so persistence and the in-memory swap stay in
    // step; readers only contend for the brief swap itself.
    write_gate: Arc<Mutex<()>>,
    snapshot_path: Option<PathBuf>,
}

impl RouteTable {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        RouteTable {
            entries: Arc::new(RwLock::new(HashMap::new())),
            write_gate: Arc::new(Mutex::new(())),
            snapshot_path,
        }
    }

    /// The composite routing key.
    pub fn identity(username: &str, password: &str) -> String {
        format!("{}:{}", username, password)
    }

    pub async fn lookup(&self, identity: &str) -> Option<UpstreamSpec> {
        self.entries.read().await.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Inserts or overwrites a single entry, leaving all others intact.
    pub async fn upsert(
        &self,
        identity: impl Into<String>,
        spec: UpstreamSpec,
    ) -> Result<(), RouteError> {
        let identity = identity.into();
        let _gate = self.write_gate.lock().await;

        let mut next = self.entries.read().await.clone();
        next.insert(identity, spec);
        self.persist(&next).await?;

        *self.entries.write().await = next;
        Ok(())
    }

    /// Atomically replaces the whole table with `source`; duplicate
    /// identities keep the last occurrence. Returns the entry count.
    pub async fn replace_from<I>(&self, source: I) -> Result<usize, RouteError>
    where
        I: IntoIterator<Item = (String, UpstreamSpec)>,
    {
        let next: HashMap<String, UpstreamSpec> = source.into_iter().collect();
        let count = next.len();
        let _gate = self.write_gate.lock().await;

        self.persist(&next).await?;
        *self.entries.write().await = next;
        Ok(count)
    }

    /// Replaces the table with the configured snapshot file's contents.
    /// On any read or parse failure the in-memory table is untouched.
    pub async fn reload(&self) -> Result<usize, RouteError> {
        let path = self.snapshot_path.as_ref().ok_or(RouteError::NoSnapshotPath)?;
        let data = tokio::fs::read_to_string(path).await?;
        let parsed = parse_snapshot(&data)?;

        let next: HashMap<String, UpstreamSpec> = parsed.into_iter().collect();
        let count = next.len();
        let _gate = self.write_gate.lock().await;
        *self.entries.write().await = next;
        Ok(count)
    }

    /// The serialized on-disk form of the current table.
    pub async fn snapshot(&self) -> Result<String, RouteError> {
        let entries = self.entries.read().await.clone();
        Ok(render_snapshot(&entries)?)
    }

    async fn persist(&self, entries: &HashMap<String, UpstreamSpec>) -> Result<(), RouteError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let yaml = render_snapshot(entries)?;
        tokio::fs::write(path, yaml).await?;
        Ok(())
    }
}

/// Parses a snapshot document into `(identity, spec)` pairs, merging every
/// `services[].users[]` entry in order.
pub fn parse_snapshot(data: &str) -> Result<Vec<(String, UpstreamSpec)>, RouteError> {
    let file: SnapshotFile = serde_yaml::from_str(data)?;
    let mut pairs = Vec::new();
    for service in file.services {
        for user in service.users {
            let spec = UpstreamSpec::parse(&user.forward)?;
            pairs.push((RouteTable::identity(&user.username, &user.password), spec));
        }
    }
    Ok(pairs)
}

fn render_snapshot(
    entries: &HashMap<String, UpstreamSpec>,
) -> Result<String, serde_yaml::Error> {
    let mut users: Vec<UserEntry> = entries
        .iter()
        .map(|(identity, spec)| {
            let (username, password) = identity
                .split_once(':')
                .unwrap_or((identity.as_str(), ""));
            UserEntry {
                username: username.to_string(),
                password: password.to_string(),
                forward: spec.to_string(),
            }
        })
        .collect();
    users.sort_by(|a, b| a.username.cmp(&b.username));
    serde_yaml::to_string(&SnapshotFile {
        services: vec![ServiceEntry { users }],
    })
}
