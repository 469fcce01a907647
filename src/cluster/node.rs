//! Node identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a node participating in the cluster.
///
/// Immutable once built. Equality and hashing only consider `id`, so two
/// identifiers for the same node compare equal even if one was built from a
/// stale address announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentifier {
    /// Cluster-unique node ID
    id: String,
    /// Hostname clients use to reach the node's API
    api_address: String,
    /// API port
    api_port: u16,
    /// Address for node-to-node protocol traffic
    socket_address: String,
    /// Port for node-to-node protocol traffic
    socket_port: u16,
    /// Site-to-site address, if the node exposes one
    site_to_site_address: Option<String>,
    /// Site-to-site port, if the node exposes one
    site_to_site_port: Option<u16>,
    /// Whether this identifier describes the process holding it
    #[serde(default)]
    local: bool,
}

impl NodeIdentifier {
    /// Create an identifier whose protocol socket shares the API address and port.
    pub fn new(id: impl Into<String>, api_address: impl Into<String>, api_port: u16) -> Self {
        let api_address = api_address.into();
        Self {
            id: id.into(),
            socket_address: api_address.clone(),
            socket_port: api_port,
            api_address,
            api_port,
            site_to_site_address: None,
            site_to_site_port: None,
            local: false,
        }
    }

    pub fn with_socket(mut self, address: impl Into<String>, port: u16) -> Self {
        self.socket_address = address.into();
        self.socket_port = port;
        self
    }

    pub fn with_site_to_site(mut self, address: impl Into<String>, port: u16) -> Self {
        self.site_to_site_address = Some(address.into());
        self.site_to_site_port = Some(port);
        self
    }

    /// Mark this identifier as describing the current process.
    pub fn as_local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn api_address(&self) -> &str {
        &self.api_address
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn socket_address(&self) -> &str {
        &self.socket_address
    }

    pub fn socket_port(&self) -> u16 {
        self.socket_port
    }

    pub fn site_to_site_address(&self) -> Option<&str> {
        self.site_to_site_address.as_deref()
    }

    pub fn site_to_site_port(&self) -> Option<u16> {
        self.site_to_site_port
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// `host:port` of the node's API
    pub fn api_endpoint(&self) -> String {
        format!("{}:{}", self.api_address, self.api_port)
    }
}

impl PartialEq for NodeIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentifier {}

impl Hash for NodeIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.api_address, self.api_port, self.id)
    }
}
