//! Capability flags requested by plugins and enforced by the permission gateway

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

bitflags! {
    /// Set of capabilities a plugin may exercise
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const FILE_READ = 1 << 0;
        const FILE_WRITE = 1 << 1;
        const NETWORK = 1 << 2;
        const PROCESS = 1 << 3;
        const ENVIRONMENT = 1 << 4;
        const SERVICES = 1 << 5;
        const MESSAGE_BUS = 1 << 6;
        const HOST_CONTROL = 1 << 7;
    }
}

const NAMES: &[(&str, Capabilities)] = &[
    ("file_read", Capabilities::FILE_READ),
    ("file_write", Capabilities::FILE_WRITE),
    ("network", Capabilities::NETWORK),
    ("process", Capabilities::PROCESS),
    ("environment", Capabilities::ENVIRONMENT),
    ("services", Capabilities::SERVICES),
    ("message_bus", Capabilities::MESSAGE_BUS),
    ("host_control", Capabilities::HOST_CONTROL),
];

impl Capabilities {
    /// Look up a single capability by its manifest name
    pub fn from_manifest_name(name: &str) -> Option<Self> {
        let name = name.trim();
        NAMES
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, flag)| *flag)
    }

    /// Parse a list of manifest names, failing on the first unknown one
    pub fn parse_names<I, S>(names: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(Self::empty(), |acc, name| {
            let name = name.as_ref();
            Self::from_manifest_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| format!("unknown capability '{}'", name))
        })
    }

    /// Manifest names of the contained capabilities, in declaration order
    pub fn names(&self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.names())
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Self::parse_names(&names).map_err(serde::de::Error::custom)
    }
}
