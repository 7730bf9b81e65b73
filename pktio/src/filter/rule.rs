//! Rule model: match and action entries, their typed values, and the
//! serializable form used by the rule management boundary.

use super::{FilterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddrV4;

/// Packet direction a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

/// Match types, numbered as on the rule management boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MatchType {
    HostifTrapId = 1,
    HostifUserTrapId = 2,
    DstMac = 3,
    EtherType = 4,
}

impl MatchType {
    pub const MAX: u32 = MatchType::EtherType as u32;
}

impl TryFrom<u32> for MatchType {
    type Error = FilterError;

    fn try_from(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(Self::HostifTrapId),
            2 => Ok(Self::HostifUserTrapId),
            3 => Ok(Self::DstMac),
            4 => Ok(Self::EtherType),
            other => Err(FilterError::InvalidMatchType(other)),
        }
    }
}

/// Action types, numbered as on the rule management boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ActionType {
    RedirectSock = 1,
    CopyToSock = 2,
    RedirectIf = 3,
}

impl ActionType {
    pub const MAX: u32 = ActionType::RedirectIf as u32;
}

impl TryFrom<u32> for ActionType {
    type Error = FilterError;

    fn try_from(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(Self::RedirectSock),
            2 => Ok(Self::CopyToSock),
            3 => Ok(Self::RedirectIf),
            other => Err(FilterError::InvalidActionType(other)),
        }
    }
}

/// A MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for MacAddr {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(':');
        for byte in mac.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| FilterError::InvalidValue(format!("bad MAC address '{s}'")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| FilterError::InvalidValue(format!("bad MAC address '{s}'")))?;
        }
        if parts.next().is_some() {
            return Err(FilterError::InvalidValue(format!("bad MAC address '{s}'")));
        }
        Ok(MacAddr(mac))
    }
}

/// Value carried by a match entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchValue {
    Mac(MacAddr),
    U64(u64),
    U32(u32),
}

/// Value carried by an action entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionValue {
    Socket(SocketAddrV4),
    IfIndex(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchEntry {
    pub kind: MatchType,
    pub value: MatchValue,
}

impl MatchEntry {
    /// Builds an entry from a raw type tag, rejecting unknown tags.
    pub fn new(tag: u32, value: MatchValue) -> Result<Self> {
        Ok(Self {
            kind: MatchType::try_from(tag)?,
            value,
        })
    }

    pub fn user_trap_id(id: u64) -> Self {
        Self {
            kind: MatchType::HostifUserTrapId,
            value: MatchValue::U64(id),
        }
    }

    pub fn dst_mac(mac: [u8; 6]) -> Self {
        Self {
            kind: MatchType::DstMac,
            value: MatchValue::Mac(MacAddr(mac)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionEntry {
    pub kind: ActionType,
    pub value: ActionValue,
}

impl ActionEntry {
    /// Builds an entry from a raw type tag, rejecting unknown tags.
    pub fn new(tag: u32, value: ActionValue) -> Result<Self> {
        Ok(Self {
            kind: ActionType::try_from(tag)?,
            value,
        })
    }

    pub fn redirect_sock(dest: SocketAddrV4) -> Self {
        Self {
            kind: ActionType::RedirectSock,
            value: ActionValue::Socket(dest),
        }
    }

    pub fn copy_to_sock(dest: SocketAddrV4) -> Self {
        Self {
            kind: ActionType::CopyToSock,
            value: ActionValue::Socket(dest),
        }
    }

    pub fn redirect_if(ifindex: u32) -> Self {
        Self {
            kind: ActionType::RedirectIf,
            value: ActionValue::IfIndex(ifindex),
        }
    }
}

/// Match entries of one rule, at most one per type, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSet(Vec<MatchEntry>);

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: MatchEntry) -> Result<()> {
        if self.0.iter().any(|e| e.kind == entry.kind) {
            return Err(FilterError::DuplicateMatch(entry.kind));
        }
        self.0.push(entry);
        Ok(())
    }

    pub fn get(&self, kind: MatchType) -> Option<&MatchEntry> {
        self.0.iter().find(|e| e.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<MatchEntry>> for MatchSet {
    type Error = FilterError;

    fn try_from(entries: Vec<MatchEntry>) -> Result<Self> {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry)?;
        }
        Ok(set)
    }
}

/// Action entries of one rule, at most one per type, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSet(Vec<ActionEntry>);

impl ActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: ActionEntry) -> Result<()> {
        if self.0.iter().any(|e| e.kind == entry.kind) {
            return Err(FilterError::DuplicateAction(entry.kind));
        }
        self.0.push(entry);
        Ok(())
    }

    pub fn get(&self, kind: ActionType) -> Option<&ActionEntry> {
        self.0.iter().find(|e| e.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<ActionEntry>> for ActionSet {
    type Error = FilterError;

    fn try_from(entries: Vec<ActionEntry>) -> Result<Self> {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry)?;
        }
        Ok(set)
    }
}

/// Identifier of a live rule.
pub type RuleId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub direction: Direction,
    pub stop: bool,
    pub matches: MatchSet,
    pub actions: ActionSet,
}

// ============================================================================
// Rule management boundary
// ============================================================================

/// Number or text value as received from the rule management boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecValue {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpec {
    #[serde(rename = "type")]
    pub kind: u32,
    pub value: SpecValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub kind: u32,
    pub value: SpecValue,
}

/// Serializable form of a rule.
///
/// `id` is ignored on create and always filled in on describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RuleId>,
    pub direction: Direction,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub matches: Vec<MatchSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl MatchSpec {
    pub fn to_entry(&self) -> Result<MatchEntry> {
        let kind = MatchType::try_from(self.kind)?;
        let value = match (kind, &self.value) {
            (MatchType::DstMac, SpecValue::Text(s)) => MatchValue::Mac(s.parse()?),
            (MatchType::EtherType, SpecValue::Number(n)) => {
                let ethertype = u16::try_from(*n).map_err(|_| {
                    FilterError::InvalidValue(format!("ethertype {n:#x} out of range"))
                })?;
                MatchValue::U32(ethertype as u32)
            }
            (MatchType::HostifTrapId | MatchType::HostifUserTrapId, SpecValue::Number(n)) => {
                MatchValue::U64(*n)
            }
            (kind, value) => {
                return Err(FilterError::InvalidValue(format!(
                    "{value:?} is not a valid {kind:?} value"
                )));
            }
        };
        Ok(MatchEntry { kind, value })
    }

    pub fn from_entry(entry: &MatchEntry) -> Self {
        let value = match entry.value {
            MatchValue::Mac(mac) => SpecValue::Text(mac.to_string()),
            MatchValue::U64(n) => SpecValue::Number(n),
            MatchValue::U32(n) => SpecValue::Number(n as u64),
        };
        Self {
            kind: entry.kind as u32,
            value,
        }
    }
}

impl ActionSpec {
    pub fn to_entry(&self) -> Result<ActionEntry> {
        let kind = ActionType::try_from(self.kind)?;
        let value = match (kind, &self.value) {
            (ActionType::RedirectSock | ActionType::CopyToSock, SpecValue::Text(s)) => {
                ActionValue::Socket(s.parse().map_err(|_| {
                    FilterError::InvalidValue(format!("bad IPv4 socket address '{s}'"))
                })?)
            }
            (ActionType::RedirectIf, SpecValue::Number(n)) => {
                ActionValue::IfIndex(u32::try_from(*n).map_err(|_| {
                    FilterError::InvalidValue(format!("ifindex {n} out of range"))
                })?)
            }
            (kind, value) => {
                return Err(FilterError::InvalidValue(format!(
                    "{value:?} is not a valid {kind:?} value"
                )));
            }
        };
        Ok(ActionEntry { kind, value })
    }

    pub fn from_entry(entry: &ActionEntry) -> Self {
        let value = match entry.value {
            ActionValue::Socket(addr) => SpecValue::Text(addr.to_string()),
            ActionValue::IfIndex(ifindex) => SpecValue::Number(ifindex as u64),
        };
        Self {
            kind: entry.kind as u32,
            value,
        }
    }
}

impl RuleSpec {
    /// Validates every entry, so a bad spec never reaches the table.
    pub fn to_sets(&self) -> Result<(MatchSet, ActionSet)> {
        let matches = self
            .matches
            .iter()
            .map(MatchSpec::to_entry)
            .collect::<Result<Vec<_>>>()?;
        let actions = self
            .actions
            .iter()
            .map(ActionSpec::to_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok((MatchSet::try_from(matches)?, ActionSet::try_from(actions)?))
    }

    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            id: Some(rule.id),
            direction: rule.direction,
            stop: rule.stop,
            matches: rule.matches.iter().map(MatchSpec::from_entry).collect(),
            actions: rule.actions.iter().map(ActionSpec::from_entry).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_match_type_range() {
        assert_eq!(MatchType::try_from(2).unwrap(), MatchType::HostifUserTrapId);
        assert!(matches!(
            MatchType::try_from(0),
            Err(FilterError::InvalidMatchType(0))
        ));
        assert!(matches!(
            MatchType::try_from(MatchType::MAX + 1),
            Err(FilterError::InvalidMatchType(5))
        ));
    }

    #[test]
    fn test_action_type_range() {
        assert_eq!(ActionType::try_from(3).unwrap(), ActionType::RedirectIf);
        assert!(matches!(
            ActionType::try_from(42),
            Err(FilterError::InvalidActionType(42))
        ));
        assert!(ActionEntry::new(0, ActionValue::IfIndex(1)).is_err());
    }

    #[test]
    fn test_match_set_rejects_duplicate_type() {
        let mut set = MatchSet::new();
        set.insert(MatchEntry::user_trap_id(7)).unwrap();
        let err = set.insert(MatchEntry::user_trap_id(8)).unwrap_err();
        assert!(matches!(
            err,
            FilterError::DuplicateMatch(MatchType::HostifUserTrapId)
        ));
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get(MatchType::HostifUserTrapId).unwrap().value,
            MatchValue::U64(7)
        );
    }

    #[test]
    fn test_action_set_keeps_insertion_order() {
        let dest = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000);
        let mut set = ActionSet::new();
        set.insert(ActionEntry::redirect_if(12)).unwrap();
        set.insert(ActionEntry::copy_to_sock(dest)).unwrap();
        assert!(set.insert(ActionEntry::redirect_if(13)).is_err());

        let kinds: Vec<_> = set.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ActionType::RedirectIf, ActionType::CopyToSock]);
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "00:1b:21:aa:BB:0c".parse().unwrap();
        assert_eq!(mac.0, [0x00, 0x1b, 0x21, 0xaa, 0xbb, 0x0c]);
        assert_eq!(mac.to_string(), "00:1b:21:aa:bb:0c");
        assert!("00:1b:21:aa:bb".parse::<MacAddr>().is_err());
        assert!("00:1b:21:aa:bb:0c:01".parse::<MacAddr>().is_err());
        assert!("zz:1b:21:aa:bb:0c".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_rule_spec_from_json() {
        let json = r#"{
            "id": 99,
            "direction": "ingress",
            "stop": true,
            "matches": [
                {"type": 2, "value": 7},
                {"type": 3, "value": "01:80:c2:00:00:0e"}
            ],
            "actions": [
                {"type": 1, "value": "127.0.0.1:7000"},
                {"type": 3, "value": 12}
            ]
        }"#;
        let spec: RuleSpec = serde_json::from_str(json).unwrap();
        let (matches, actions) = spec.to_sets().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(
            matches.get(MatchType::DstMac).unwrap().value,
            MatchValue::Mac(MacAddr([0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e]))
        );
        assert_eq!(
            actions.get(ActionType::RedirectSock).unwrap().value,
            ActionValue::Socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000))
        );
    }

    #[test]
    fn test_rule_spec_rejects_bad_entries() {
        let spec = |matches: Vec<MatchSpec>, actions: Vec<ActionSpec>| RuleSpec {
            id: None,
            direction: Direction::Egress,
            stop: false,
            matches,
            actions,
        };

        let wrong_value = spec(
            vec![MatchSpec {
                kind: MatchType::DstMac as u32,
                value: SpecValue::Number(1),
            }],
            vec![],
        );
        assert!(matches!(
            wrong_value.to_sets(),
            Err(FilterError::InvalidValue(_))
        ));

        let duplicate = spec(
            vec![],
            vec![
                ActionSpec {
                    kind: 3,
                    value: SpecValue::Number(1),
                },
                ActionSpec {
                    kind: 3,
                    value: SpecValue::Number(2),
                },
            ],
        );
        assert!(matches!(
            duplicate.to_sets(),
            Err(FilterError::DuplicateAction(ActionType::RedirectIf))
        ));

        let out_of_range = spec(
            vec![MatchSpec {
                kind: 17,
                value: SpecValue::Number(1),
            }],
            vec![],
        );
        assert!(matches!(
            out_of_range.to_sets(),
            Err(FilterError::InvalidMatchType(17))
        ));
    }

    #[test]
    fn test_rule_spec_from_rule() {
        let rule = Rule {
            id: 4,
            direction: Direction::Ingress,
            stop: true,
            matches: MatchSet::try_from(vec![MatchEntry::dst_mac([1, 2, 3, 4, 5, 6])]).unwrap(),
            actions: ActionSet::try_from(vec![ActionEntry::redirect_if(12)]).unwrap(),
        };
        let spec = RuleSpec::from_rule(&rule);
        assert_eq!(spec.id, Some(4));
        assert_eq!(spec.matches[0].kind, MatchType::DstMac as u32);
        assert_eq!(
            spec.matches[0].value,
            SpecValue::Text("01:02:03:04:05:06".to_string())
        );
        assert_eq!(spec.actions[0].value, SpecValue::Number(12));

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["direction"], "ingress");
        assert_eq!(json["matches"][0]["type"], 3);
    }
}
