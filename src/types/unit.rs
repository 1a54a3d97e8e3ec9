//! Remote archiving unit descriptor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A node of the archiving cluster, addressed by host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchivingUnit {
    pub host: String,
    pub port: u16,
}

impl ArchivingUnit {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, the same form used for a server's own host id.
    #[must_use]
    pub fn host_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ArchivingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
