//! Metadata Resolver: channel endpoints and node aliases.
//!
//! [`MetadataResolver`] is the seam to the routing node's graph queries.
//! [`Enricher`] wraps a resolver with per-call timeouts and placeholder
//! fallback so that enrichment can never fail a settlement.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ResolveError;

/// The two endpoints of a channel, in the node's own ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoints {
    pub node1_pubkey: String,
    pub node2_pubkey: String,
}

impl ChannelEndpoints {
    /// The endpoint that is not `self_pubkey`.
    ///
    /// For a channel that does not include this node at all the second
    /// endpoint is returned, which is what the node's own ordering makes the
    /// "remote" side.
    #[must_use]
    pub fn counterparty(&self, self_pubkey: &str) -> &str {
        if self.node2_pubkey == self_pubkey {
            &self.node1_pubkey
        } else {
            &self.node2_pubkey
        }
    }
}

/// Request/response access to the node's channel graph.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Identity of the node this process observes. Called once at startup.
    async fn self_identity(&self) -> Result<String, ResolveError>;

    /// Both endpoints of `channel_id`.
    async fn channel_endpoints(&self, channel_id: u64) -> Result<ChannelEndpoints, ResolveError>;

    /// Display alias of `pubkey`.
    async fn alias(&self, pubkey: &str) -> Result<String, ResolveError>;
}

// ---------------------------------------------------------------------------
// Enricher
// ---------------------------------------------------------------------------

/// Counterparty identity and alias for one side of a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterparty {
    pub pubkey: String,
    pub alias: String,
}

/// Bounded, failure-tolerant lookups against a [`MetadataResolver`].
pub struct Enricher {
    resolver: Arc<dyn MetadataResolver>,
    timeout: Duration,
    placeholder: String,
}

impl Enricher {
    #[must_use]
    pub fn new(resolver: Arc<dyn MetadataResolver>, timeout: Duration, placeholder: String) -> Self {
        Self {
            resolver,
            timeout,
            placeholder,
        }
    }

    /// Shared handle to the wrapped resolver.
    #[must_use]
    pub fn resolver(&self) -> Arc<dyn MetadataResolver> {
        Arc::clone(&self.resolver)
    }

    /// Resolve the counterparty on `channel_id`.
    ///
    /// Never fails: an unresolvable channel yields the placeholder identity
    /// and alias; an unresolvable alias falls back to the identity itself.
    pub async fn counterparty(&self, channel_id: u64, self_pubkey: &str) -> Counterparty {
        let endpoints = match tokio::time::timeout(
            self.timeout,
            self.resolver.channel_endpoints(channel_id),
        )
        .await
        {
            Ok(Ok(endpoints)) => endpoints,
            Ok(Err(e)) => {
                warn!(channel_id, error = %e, "Channel lookup failed; using placeholder");
                return self.placeholder_counterparty();
            }
            Err(_elapsed) => {
                warn!(
                    channel_id,
                    timeout_ms = self.timeout_ms(),
                    "Channel lookup timed out; using placeholder"
                );
                return self.placeholder_counterparty();
            }
        };

        let pubkey = endpoints.counterparty(self_pubkey).to_string();
        let alias = match tokio::time::timeout(self.timeout, self.resolver.alias(&pubkey)).await {
            Ok(Ok(alias)) if !alias.is_empty() => alias,
            Ok(Ok(_)) => {
                debug!(pubkey = %pubkey, "Node has no alias; using identity");
                pubkey.clone()
            }
            Ok(Err(e)) => {
                warn!(pubkey = %pubkey, error = %e, "Alias lookup failed; using identity");
                pubkey.clone()
            }
            Err(_elapsed) => {
                warn!(
                    pubkey = %pubkey,
                    timeout_ms = self.timeout_ms(),
                    "Alias lookup timed out; using identity"
                );
                pubkey.clone()
            }
        };

        Counterparty { pubkey, alias }
    }

    fn placeholder_counterparty(&self) -> Counterparty {
        Counterparty {
            pubkey: self.placeholder.clone(),
            alias: self.placeholder.clone(),
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

// ---------------------------------------------------------------------------
// StaticDirectory
// ---------------------------------------------------------------------------

/// JSON shape accepted by [`StaticDirectory::from_json`].
#[derive(Debug, Deserialize)]
struct DirectoryDocument {
    self_pubkey: String,
    #[serde(default)]
    channels: HashMap<u64, (String, String)>,
    #[serde(default)]
    aliases: HashMap<String, String>,
}

/// In-memory resolver over a fixed channel and alias table.
#[derive(Debug)]
pub struct StaticDirectory {
    self_pubkey: String,
    channels: DashMap<u64, ChannelEndpoints>,
    aliases: DashMap<String, String>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new(self_pubkey: impl Into<String>) -> Self {
        Self {
            self_pubkey: self_pubkey.into(),
            channels: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    /// Add or replace a channel.
    pub fn add_channel(
        &self,
        channel_id: u64,
        node1_pubkey: impl Into<String>,
        node2_pubkey: impl Into<String>,
    ) {
        self.channels.insert(
            channel_id,
            ChannelEndpoints {
                node1_pubkey: node1_pubkey.into(),
                node2_pubkey: node2_pubkey.into(),
            },
        );
    }

    /// Add or replace an alias.
    pub fn add_alias(&self, pubkey: impl Into<String>, alias: impl Into<String>) {
        self.aliases.insert(pubkey.into(), alias.into());
    }

    /// Parse a directory document:
    ///
    /// ```json
    /// { "self_pubkey": "02..", "channels": { "10": ["02..", "03.."] }, "aliases": { "03..": "bob" } }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let doc: DirectoryDocument = serde_json::from_str(json)?;
        let directory = Self::new(doc.self_pubkey);
        for (channel_id, (node1, node2)) in doc.channels {
            directory.add_channel(channel_id, node1, node2);
        }
        for (pubkey, alias) in doc.aliases {
            directory.add_alias(pubkey, alias);
        }
        Ok(directory)
    }

    /// Read and parse a directory document from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_json(&json)?)
    }
}

#[async_trait]
impl MetadataResolver for StaticDirectory {
    async fn self_identity(&self) -> Result<String, ResolveError> {
        Ok(self.self_pubkey.clone())
    }

    async fn channel_endpoints(&self, channel_id: u64) -> Result<ChannelEndpoints, ResolveError> {
        self.channels
            .get(&channel_id)
            .map(|entry| entry.value().clone())
            .ok_or(ResolveError::UnknownChannel(channel_id))
    }

    async fn alias(&self, pubkey: &str) -> Result<String, ResolveError> {
        self.aliases
            .get(pubkey)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResolveError::UnknownNode(pubkey.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
