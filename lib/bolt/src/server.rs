//! Server identity: the address actually connected to, the negotiated
//! protocol version, and whatever the server said about itself during
//! authentication. Feature support is decided here.

use crate::address::Address;
use crate::value::{Value, ValueMap};

/// Product name feature gates are keyed on.
const EXPECTED_PRODUCT: &str = "Neo4j";

#[derive(Debug, Clone)]
pub struct ServerInfo {
    address: Address,
    protocol_version: u32,
    agent: Option<String>,
    connection_id: Option<String>,
}

impl ServerInfo {
    #[inline]
    pub fn new(address: Address, protocol_version: u32) -> ServerInfo {
        ServerInfo {
            address,
            protocol_version,
            agent: None,
            connection_id: None,
        }
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    #[inline]
    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    #[inline]
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Absorbs the metadata of the authentication summary.
    pub fn update(&mut self, metadata: &ValueMap) {
        if let Some(agent) = metadata.get("server").and_then(Value::as_str) {
            self.agent = Some(agent.to_string());
        }
        if let Some(id) = metadata.get("connection_id").and_then(Value::as_str) {
            self.connection_id = Some(id.to_string());
        }
    }

    pub fn version(&self) -> Option<ServerVersion> {
        self.agent.as_deref().map(ServerVersion::from_agent)
    }

    /// Whether byte arrays may be sent to this server. Protocol 3 clients
    /// may assume support; older protocols need the expected product at
    /// version 3.2 or later.
    pub fn supports_bytes(&self) -> bool {
        if self.protocol_version >= 3 {
            return true;
        }
        match self.version() {
            Some(version) => version.product == EXPECTED_PRODUCT && version.at_least(3, 2),
            None => false,
        }
    }

    /// Whether RUN accepts a trailing metadata map.
    #[inline]
    pub fn supports_run_metadata(&self) -> bool {
        self.protocol_version >= 3
    }
}

/// An agent string such as `Neo4j/3.2.1-alpha01`, parsed into product,
/// numeric version components and trailing tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub product: String,
    pub version: Vec<u32>,
    pub tags: Vec<String>,
}

impl ServerVersion {
    pub fn from_agent(agent: &str) -> ServerVersion {
        let (product, tagged) = match agent.find('/') {
            Some(index) => (&agent[..index], &agent[index + 1..]),
            None => (agent, ""),
        };
        let mut parts = tagged.split('-');
        let version = parts
            .next()
            .unwrap_or("")
            .split('.')
            .filter_map(|part| part.parse().ok())
            .collect();
        let tags = parts.map(str::to_string).collect();
        ServerVersion {
            product: product.to_string(),
            version,
            tags,
        }
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        let version_major = self.version.get(0).copied().unwrap_or(0);
        let version_minor = self.version.get(1).copied().unwrap_or(0);
        (version_major, version_minor) >= (major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(protocol_version: u32, agent: Option<&str>) -> ServerInfo {
        let mut info = ServerInfo::new(Address::new("127.0.0.1", 7687), protocol_version);
        if let Some(agent) = agent {
            let mut metadata = ValueMap::new();
            metadata.insert("server".to_string(), Value::from(agent));
            info.update(&metadata);
        }
        info
    }

    #[test]
    fn test_agent_parsing() {
        let version = ServerVersion::from_agent("Neo4j/3.2.1");
        assert_eq!(version.product, "Neo4j");
        assert_eq!(version.version, vec![3, 2, 1]);
        assert!(version.tags.is_empty());
    }

    #[test]
    fn test_agent_parsing_with_tags() {
        let version = ServerVersion::from_agent("Neo4j/3.5.0-alpha01");
        assert_eq!(version.version, vec![3, 5, 0]);
        assert_eq!(version.tags, vec!["alpha01".to_string()]);
    }

    #[test]
    fn test_at_least() {
        let version = ServerVersion::from_agent("Neo4j/3.2.1");
        assert!(version.at_least(3, 2));
        assert!(version.at_least(2, 9));
        assert!(!version.at_least(3, 3));
        assert!(!version.at_least(4, 0));
    }

    #[test]
    fn test_bytes_supported_from_protocol_version() {
        assert!(info(3, None).supports_bytes());
    }

    #[test]
    fn test_bytes_gated_on_agent_below_protocol_3() {
        assert!(info(1, Some("Neo4j/3.2.0")).supports_bytes());
        assert!(!info(1, Some("Neo4j/3.1.9")).supports_bytes());
        assert!(!info(1, Some("OtherGraph/9.9.9")).supports_bytes());
        assert!(!info(1, None).supports_bytes());
    }

    #[test]
    fn test_run_metadata_gate() {
        assert!(info(3, None).supports_run_metadata());
        assert!(!info(2, Some("Neo4j/3.4.0")).supports_run_metadata());
    }

    #[test]
    fn test_update_absorbs_connection_id() {
        let mut metadata = ValueMap::new();
        metadata.insert("server".to_string(), Value::from("Neo4j/3.5.0"));
        metadata.insert("connection_id".to_string(), Value::from("bolt-14"));
        let mut info = ServerInfo::new(Address::new("127.0.0.1", 7687), 3);
        info.update(&metadata);
        assert_eq!(info.agent(), Some("Neo4j/3.5.0"));
        assert_eq!(info.connection_id(), Some("bolt-14"));
    }
}
