//! Daemon configuration.
//!
//! Loaded from an optional JSON file; every key has a default so an empty
//! object is a valid configuration.

use crate::filter::{MacAddr, RuleSpec};
use crate::npu::{NpuId, PortId};
use crate::packet_io::{DEFAULT_SAMPLE_DESTINATION, PacketDebug};
use crate::port::DEFAULT_LINK_UP_RETRIES;
use crate::reactor::iface::{BridgeKind, InterfaceInfo, InterfaceTable};
use crate::reactor::{DEFAULT_READ_BATCH, MAX_PACKET_LEN, ReactorConfig};
use crate::tap::{self, DEFAULT_TXQLEN, MAX_QUEUES};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::{fs, io};
use thiserror::Error;

/// Smallest frame buffer the reactor accepts: one Ethernet header.
const MIN_PACKET_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A port created at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub npu: NpuId,
    pub port: PortId,
    /// TAP device name.
    pub name: String,
    /// Bring the link up right after creation.
    #[serde(default = "default_true")]
    pub link_up: bool,
}

fn default_true() -> bool {
    true
}

/// Bridge context of a kernel interface whose flooded ARP/NS copies are
/// reinjected through the NPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub ifindex: u32,
    pub mac: MacAddr,
    /// Tag pushed on rebuilt frames.
    #[serde(default)]
    pub vlan_id: Option<u16>,
    #[serde(default)]
    pub bridge: BridgeKind,
}

impl InterfaceConfig {
    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            mac: self.mac,
            vlan_id: self.vlan_id,
            bridge: self.bridge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// sFlow collector for sampled packets.
    pub sample_destination: SocketAddrV4,
    pub tap_queues: usize,
    pub tap_txqlen: u32,
    pub link_up_retries: u32,
    pub read_batch: usize,
    pub max_packet_len: usize,
    /// NFLOG group carrying flooded ARP/NS copies. Disabled when unset.
    pub nflog_group: Option<u16>,
    pub ports: Vec<PortConfig>,
    pub rules: Vec<RuleSpec>,
    /// Interface context for flood reconstruction.
    pub interfaces: Vec<InterfaceConfig>,
    pub packet_debug: PacketDebug,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_destination: DEFAULT_SAMPLE_DESTINATION,
            tap_queues: 1,
            tap_txqlen: DEFAULT_TXQLEN,
            link_up_retries: DEFAULT_LINK_UP_RETRIES,
            read_batch: DEFAULT_READ_BATCH,
            max_packet_len: MAX_PACKET_LEN,
            nflog_group: None,
            ports: Vec::new(),
            rules: Vec::new(),
            interfaces: Vec::new(),
            packet_debug: PacketDebug::Off,
        }
    }
}

impl Config {
    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tap_queues == 0 || self.tap_queues > MAX_QUEUES {
            return Err(ConfigError::Invalid(format!(
                "tap_queues must be between 1 and {MAX_QUEUES}, got {}",
                self.tap_queues
            )));
        }
        if self.read_batch == 0 {
            return Err(ConfigError::Invalid("read_batch must not be 0".into()));
        }
        if self.max_packet_len < MIN_PACKET_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_packet_len must be at least {MIN_PACKET_LEN}, got {}",
                self.max_packet_len
            )));
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for p in &self.ports {
            tap::check_name(&p.name)
                .map_err(|e| ConfigError::Invalid(format!("port {}:{}: {e}", p.npu, p.port)))?;
            if !names.insert(p.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate port name '{}'",
                    p.name
                )));
            }
            if !ports.insert((p.npu, p.port)) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate port {}:{}",
                    p.npu, p.port
                )));
            }
        }

        let mut ifindexes = HashSet::new();
        for iface in &self.interfaces {
            if iface.ifindex == 0 {
                return Err(ConfigError::Invalid("interface ifindex must not be 0".into()));
            }
            if !ifindexes.insert(iface.ifindex) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate interface {}",
                    iface.ifindex
                )));
            }
            if let Some(vlan) = iface.vlan_id
                && !(1..=4094).contains(&vlan)
            {
                return Err(ConfigError::Invalid(format!(
                    "interface {}: vlan_id must be between 1 and 4094, got {vlan}",
                    iface.ifindex
                )));
            }
        }
        Ok(())
    }

    /// Interface table seeded from `interfaces`. Unlisted interfaces fall
    /// back to their kernel MAC, untagged and outside any bridge.
    pub fn interface_table(&self) -> InterfaceTable {
        let table = InterfaceTable::with_kernel_fallback();
        for iface in &self.interfaces {
            table.set(iface.ifindex, iface.info());
        }
        table
    }

    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            read_batch: self.read_batch,
            max_packet_len: self.max_packet_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Direction;
    use crate::reactor::iface::InterfaceResolver;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sample_destination, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 20001));
        assert_eq!(config.tap_queues, 1);
        assert_eq!(config.tap_txqlen, 1000);
        assert_eq!(config.link_up_retries, 12);
        assert_eq!(config.read_batch, 10);
        assert_eq!(config.max_packet_len, 12000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_empty_object() {
        let file = write_config("{}");
        let config = Config::load(file.path()).unwrap();
        assert!(config.ports.is_empty());
        assert_eq!(config.packet_debug, PacketDebug::Off);
    }

    #[test]
    fn test_load_full() {
        let file = write_config(
            r#"{
                "sample_destination": "10.0.0.9:6343",
                "tap_queues": 4,
                "nflog_group": 5,
                "packet_debug": "both",
                "ports": [
                    {"npu": 0, "port": 1, "name": "e101-001-0"},
                    {"npu": 0, "port": 2, "name": "e101-002-0", "link_up": false}
                ],
                "rules": [
                    {
                        "direction": "ingress",
                        "stop": true,
                        "matches": [{"type": 2, "value": 7}],
                        "actions": [{"type": 3, "value": 12}]
                    }
                ]
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sample_destination, "10.0.0.9:6343".parse().unwrap());
        assert_eq!(config.tap_queues, 4);
        assert_eq!(config.nflog_group, Some(5));
        assert_eq!(config.packet_debug, PacketDebug::Both);
        assert_eq!(config.ports.len(), 2);
        assert!(config.ports[0].link_up);
        assert!(!config.ports[1].link_up);
        assert_eq!(config.rules[0].direction, Direction::Ingress);
        assert!(config.rules[0].stop);
    }

    #[test]
    fn test_load_interfaces() {
        let file = write_config(
            r#"{
                "nflog_group": 5,
                "interfaces": [
                    {
                        "ifindex": 12,
                        "mac": "02:00:00:00:00:12",
                        "vlan_id": 100,
                        "bridge": {"kind": "dot1d", "bridge_id": 38}
                    },
                    {"ifindex": 13, "mac": "02:00:00:00:00:13", "bridge": {"kind": "dot1q"}},
                    {"ifindex": 14, "mac": "02:00:00:00:00:14"}
                ]
            }"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.interfaces.len(), 3);

        let table = config.interface_table();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.interface(12),
            Some(InterfaceInfo {
                mac: MacAddr([0x02, 0, 0, 0, 0, 0x12]),
                vlan_id: Some(100),
                bridge: BridgeKind::Dot1d { bridge_id: 38 },
            })
        );
        assert_eq!(table.interface(13).unwrap().bridge, BridgeKind::Dot1q);
        assert_eq!(
            table.interface(14),
            Some(InterfaceInfo::plain(MacAddr([0x02, 0, 0, 0, 0, 0x14])))
        );
    }

    #[test]
    fn test_rejects_bad_interfaces() {
        for json in [
            r#"{"interfaces": [{"ifindex": 0, "mac": "02:00:00:00:00:01"}]}"#,
            r#"{"interfaces": [{"ifindex": 3, "mac": "02:00:00:00:00:01", "vlan_id": 0}]}"#,
            r#"{"interfaces": [{"ifindex": 3, "mac": "02:00:00:00:00:01", "vlan_id": 4095}]}"#,
            r#"{"interfaces": [
                {"ifindex": 3, "mac": "02:00:00:00:00:01"},
                {"ifindex": 3, "mac": "02:00:00:00:00:02"}
            ]}"#,
        ] {
            let file = write_config(json);
            assert!(
                matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))),
                "accepted {json}"
            );
        }

        for json in [
            r#"{"interfaces": [{"ifindex": 3, "mac": "not-a-mac"}]}"#,
            r#"{"interfaces": [
                {"ifindex": 3, "mac": "02:00:00:00:00:01", "bridge": {"kind": "x"}}
            ]}"#,
        ] {
            let file = write_config(json);
            assert!(
                matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })),
                "parsed {json}"
            );
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        for json in [
            r#"{"tap_queues": 0}"#,
            r#"{"tap_queues": 11}"#,
            r#"{"read_batch": 0}"#,
            r#"{"max_packet_len": 10}"#,
            r#"{"ports": [{"npu": 0, "port": 1, "name": "this-name-is-too-long"}]}"#,
            r#"{"ports": [
                {"npu": 0, "port": 1, "name": "a"},
                {"npu": 0, "port": 2, "name": "a"}
            ]}"#,
            r#"{"ports": [
                {"npu": 0, "port": 1, "name": "a"},
                {"npu": 0, "port": 1, "name": "b"}
            ]}"#,
        ] {
            let file = write_config(json);
            assert!(
                matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))),
                "accepted {json}"
            );
        }
    }

    #[test]
    fn test_parse_errors() {
        let file = write_config(r#"{"no_such_key": 1}"#);
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));

        let missing = Path::new("/nonexistent/pktio.json");
        assert!(matches!(Config::load(missing), Err(ConfigError::Read { .. })));
    }
}
