//! Control-packet filter.
//!
//! Rules live in two tables (ingress and egress) behind one mutex together
//! with the rule id generator. Evaluation walks a table in insertion order:
//! every match entry of a rule is evaluated (no short-circuit), a full match
//! runs every action in order, and a matching rule with `stop` set ends the
//! walk with "stop further processing".

pub mod dispatch;
pub mod rule;

pub use rule::{
    ActionEntry, ActionSet, ActionSpec, ActionType, ActionValue, Direction, MacAddr, MatchEntry,
    MatchSet, MatchSpec, MatchType, MatchValue, Rule, RuleId, RuleSpec, SpecValue,
};

use crate::meta::MetaError;
use crate::npu::PacketAttrs;
use crate::port::PortResolver;
use dispatch::{ActionContext, Dispatch};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Number of rule ids, and so the maximum number of live rules.
pub const MAX_RULES: usize = 256;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid match type {0}")]
    InvalidMatchType(u32),

    #[error("invalid action type {0}")]
    InvalidActionType(u32),

    #[error("match type {0:?} already present in rule")]
    DuplicateMatch(MatchType),

    #[error("action type {0:?} already present in rule")]
    DuplicateAction(ActionType),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("all {MAX_RULES} rule ids are in use")]
    IdsExhausted,

    #[error("no port for ifindex {0}")]
    UnknownIfIndex(u32),

    #[error("action not supported for {0}")]
    NotSupported(String),

    #[error("failed to send to {0}: {1}")]
    Send(SocketAddrV4, io::Error),

    #[error("failed to create filter socket: {0}")]
    Socket(io::Error),

    #[error(transparent)]
    Meta(#[from] MetaError),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Bounded rule id allocator; never hands out an id that is still live.
#[derive(Debug, Default)]
struct IdGenerator {
    used: [u64; MAX_RULES / 64],
}

impl IdGenerator {
    fn reserve(&mut self) -> Option<RuleId> {
        for (word_idx, word) in self.used.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                *word |= 1 << bit;
                return Some(word_idx as RuleId * 64 + bit);
            }
        }
        None
    }

    fn release(&mut self, id: RuleId) {
        if let Some(word) = self.used.get_mut(id as usize / 64) {
            *word &= !(1 << (id % 64));
        }
    }
}

#[derive(Debug, Default)]
struct FilterTable {
    ingress: Vec<Rule>,
    egress: Vec<Rule>,
    ids: IdGenerator,
}

impl FilterTable {
    fn rules_mut(&mut self, direction: Direction) -> &mut Vec<Rule> {
        match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        }
    }

    fn find(&self, id: RuleId) -> Option<&Rule> {
        self.ingress
            .iter()
            .chain(self.egress.iter())
            .find(|r| r.id == id)
    }
}

/// The packet filter engine.
pub struct PacketFilter {
    table: Mutex<FilterTable>,
    ingress_rules: AtomicUsize,
    egress_rules: AtomicUsize,
    dispatch: Dispatch,
    socket: Socket,
    resolver: Arc<dyn PortResolver>,
}

impl PacketFilter {
    /// Creates an empty filter. `resolver` maps between ifindexes and NPU
    /// ports for the socket and interface redirect actions.
    pub fn new(resolver: Arc<dyn PortResolver>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(FilterError::Socket)?;
        Ok(Self {
            table: Mutex::new(FilterTable::default()),
            ingress_rules: AtomicUsize::new(0),
            egress_rules: AtomicUsize::new(0),
            dispatch: Dispatch::new(),
            socket,
            resolver,
        })
    }

    fn lock(&self) -> MutexGuard<'_, FilterTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counter(&self, direction: Direction) -> &AtomicUsize {
        match direction {
            Direction::Ingress => &self.ingress_rules,
            Direction::Egress => &self.egress_rules,
        }
    }

    /// Appends a rule to the direction's table and returns its new id.
    pub fn add_rule(
        &self,
        direction: Direction,
        matches: MatchSet,
        actions: ActionSet,
        stop: bool,
    ) -> Result<RuleId> {
        let mut table = self.lock();
        let id = table.ids.reserve().ok_or(FilterError::IdsExhausted)?;
        table.rules_mut(direction).push(Rule {
            id,
            direction,
            stop,
            matches,
            actions,
        });
        let count = self.counter(direction).fetch_add(1, Ordering::Release) + 1;
        debug!(rule_id = id, ?direction, count, "Rule added");
        Ok(id)
    }

    /// Removes a rule from whichever table holds it and frees its id.
    pub fn delete_rule(&self, id: RuleId) -> bool {
        let mut table = self.lock();
        for direction in [Direction::Ingress, Direction::Egress] {
            let rules = table.rules_mut(direction);
            if let Some(pos) = rules.iter().position(|r| r.id == id) {
                rules.remove(pos);
                table.ids.release(id);
                let count = self.counter(direction).fetch_sub(1, Ordering::Release) - 1;
                debug!(rule_id = id, ?direction, count, "Rule deleted");
                return true;
            }
        }
        debug!(rule_id = id, "Rule not found");
        false
    }

    /// Snapshot of a live rule.
    pub fn get_rule(&self, id: RuleId) -> Option<Rule> {
        self.lock().find(id).cloned()
    }

    /// Whether the ingress table has at least one rule.
    pub fn ingress_enabled(&self) -> bool {
        self.ingress_rules.load(Ordering::Acquire) > 0
    }

    /// Whether the egress table has at least one rule.
    pub fn egress_enabled(&self) -> bool {
        self.egress_rules.load(Ordering::Acquire) > 0
    }

    pub fn rule_count(&self, direction: Direction) -> usize {
        self.counter(direction).load(Ordering::Acquire)
    }

    /// Runs the direction's rules against a frame.
    ///
    /// Returns true when a matching rule asked to stop further processing.
    /// Actions may rewrite `attrs`; action failures are logged and do not
    /// affect later actions or rules.
    pub fn evaluate(&self, direction: Direction, frame: &[u8], attrs: &mut PacketAttrs) -> bool {
        trace!(
            ?direction,
            len = frame.len(),
            rx_port = attrs.rx_port,
            tx_port = attrs.tx_port,
            trap_id = attrs.trap_id,
            "Evaluating packet filter"
        );

        let ctx = ActionContext {
            socket: &self.socket,
            resolver: self.resolver.as_ref(),
        };

        let table = self.lock();
        let rules = match direction {
            Direction::Ingress => &table.ingress,
            Direction::Egress => &table.egress,
        };

        for rule in rules {
            let matched = rule.matches.iter().fold(true, |acc, entry| {
                self.dispatch.run_match(entry, frame, attrs) & acc
            });
            if !matched {
                continue;
            }

            trace!(rule_id = rule.id, "Rule matched");
            for entry in rule.actions.iter() {
                if let Err(e) = self.dispatch.run_action(&ctx, entry, frame, attrs) {
                    warn!(
                        rule_id = rule.id,
                        action = ?entry.kind,
                        error = %e,
                        "Filter action failed"
                    );
                }
            }
            if rule.stop {
                return true;
            }
        }
        false
    }

    // ========================================================================
    // Rule management boundary
    // ========================================================================

    /// Installs a rule from its serialized form. Any id in the spec is
    /// ignored; an invalid entry rejects the whole rule.
    pub fn create(&self, spec: &RuleSpec) -> Result<RuleId> {
        let (matches, actions) = spec.to_sets()?;
        let id = self.add_rule(spec.direction, matches, actions, spec.stop)?;
        info!(rule_id = id, direction = ?spec.direction, stop = spec.stop, "Filter rule created");
        Ok(id)
    }

    /// Serialized form of a live rule.
    pub fn describe(&self, id: RuleId) -> Option<RuleSpec> {
        self.lock().find(id).map(RuleSpec::from_rule)
    }

    pub fn delete(&self, id: RuleId) -> bool {
        let deleted = self.delete_rule(id);
        if deleted {
            info!(rule_id = id, "Filter rule deleted");
        }
        deleted
    }

    /// Serialized form of every rule, ingress first.
    pub fn describe_all(&self) -> Vec<RuleSpec> {
        let table = self.lock();
        table
            .ingress
            .iter()
            .chain(table.egress.iter())
            .map(RuleSpec::from_rule)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npu::NpuPort;
    use crate::test_util::StaticPorts;
    use std::collections::HashSet;

    fn filter() -> PacketFilter {
        let ports = StaticPorts::new(&[(12, NpuPort::new(0, 5)), (13, NpuPort::new(1, 9))]);
        PacketFilter::new(Arc::new(ports)).unwrap()
    }

    fn trap_rule(trap_id: u64, ifindex: u32) -> (MatchSet, ActionSet) {
        (
            MatchSet::try_from(vec![MatchEntry::user_trap_id(trap_id)]).unwrap(),
            ActionSet::try_from(vec![ActionEntry::redirect_if(ifindex)]).unwrap(),
        )
    }

    #[test]
    fn test_id_generator_lowest_free() {
        let mut ids = IdGenerator::default();
        assert_eq!(ids.reserve(), Some(0));
        assert_eq!(ids.reserve(), Some(1));
        assert_eq!(ids.reserve(), Some(2));
        ids.release(1);
        assert_eq!(ids.reserve(), Some(1));
        assert_eq!(ids.reserve(), Some(3));
    }

    #[test]
    fn test_ids_distinct_until_exhausted() {
        let filter = filter();
        let mut seen = HashSet::new();
        for _ in 0..MAX_RULES {
            let id = filter
                .add_rule(Direction::Ingress, MatchSet::new(), ActionSet::new(), false)
                .unwrap();
            assert!(id < MAX_RULES as RuleId);
            assert!(seen.insert(id), "id {id} issued twice");
        }
        assert!(matches!(
            filter.add_rule(Direction::Egress, MatchSet::new(), ActionSet::new(), false),
            Err(FilterError::IdsExhausted)
        ));

        assert!(filter.delete_rule(17));
        let id = filter
            .add_rule(Direction::Egress, MatchSet::new(), ActionSet::new(), false)
            .unwrap();
        assert_eq!(id, 17);
        assert_eq!(filter.rule_count(Direction::Ingress), MAX_RULES - 1);
        assert_eq!(filter.rule_count(Direction::Egress), 1);
    }

    #[test]
    fn test_delete_and_get() {
        let filter = filter();
        let (m, a) = trap_rule(7, 12);
        let id = filter.add_rule(Direction::Egress, m, a, true).unwrap();

        let rule = filter.get_rule(id).unwrap();
        assert_eq!(rule.direction, Direction::Egress);
        assert!(rule.stop);
        assert!(filter.egress_enabled());
        assert!(!filter.ingress_enabled());

        assert!(filter.delete_rule(id));
        assert!(!filter.delete_rule(id));
        assert!(filter.get_rule(id).is_none());
        assert!(!filter.egress_enabled());
    }

    #[test]
    fn test_redirect_to_interface_and_stop() {
        let filter = filter();
        let (m, a) = trap_rule(7, 12);
        filter.add_rule(Direction::Ingress, m, a, true).unwrap();

        let mut attrs = PacketAttrs {
            npu_id: 0,
            rx_port: 1,
            tx_port: 1,
            trap_id: 7,
        };
        assert!(filter.evaluate(Direction::Ingress, &[0u8; 64], &mut attrs));
        assert_eq!(attrs.rx_port, 5);
        assert_eq!(attrs.tx_port, 5);
    }

    #[test]
    fn test_no_match_continues() {
        let filter = filter();
        let (m, a) = trap_rule(7, 12);
        filter.add_rule(Direction::Ingress, m, a, true).unwrap();

        let mut attrs = PacketAttrs {
            trap_id: 8,
            rx_port: 1,
            ..Default::default()
        };
        assert!(!filter.evaluate(Direction::Ingress, &[0u8; 64], &mut attrs));
        assert_eq!(attrs.rx_port, 1);
        // The egress table is separate.
        attrs.trap_id = 7;
        assert!(!filter.evaluate(Direction::Egress, &[0u8; 64], &mut attrs));
    }

    #[test]
    fn test_all_matches_must_hold() {
        let filter = filter();
        let mac = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x02];
        let matches =
            MatchSet::try_from(vec![MatchEntry::user_trap_id(7), MatchEntry::dst_mac(mac)])
                .unwrap();
        let actions = ActionSet::try_from(vec![ActionEntry::redirect_if(12)]).unwrap();
        filter
            .add_rule(Direction::Ingress, matches, actions, true)
            .unwrap();

        let mut frame = [0u8; 64];
        let mut attrs = PacketAttrs {
            trap_id: 7,
            ..Default::default()
        };
        assert!(!filter.evaluate(Direction::Ingress, &frame, &mut attrs));

        frame[..6].copy_from_slice(&mac);
        assert!(filter.evaluate(Direction::Ingress, &frame, &mut attrs));
    }

    #[test]
    fn test_unsupported_match_fails_closed() {
        let filter = filter();
        let matches = MatchSet::try_from(vec![
            MatchEntry::user_trap_id(7),
            MatchEntry::new(MatchType::EtherType as u32, MatchValue::U32(0x88cc)).unwrap(),
        ])
        .unwrap();
        filter
            .add_rule(Direction::Ingress, matches, ActionSet::new(), true)
            .unwrap();

        let mut attrs = PacketAttrs {
            trap_id: 7,
            ..Default::default()
        };
        assert!(!filter.evaluate(Direction::Ingress, &[0u8; 64], &mut attrs));
    }

    #[test]
    fn test_failed_action_does_not_block_later_actions() {
        let filter = filter();
        let dead = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0);
        let actions = ActionSet::try_from(vec![
            ActionEntry::redirect_sock(dead),
            ActionEntry::redirect_if(13),
        ])
        .unwrap();
        let matches = MatchSet::try_from(vec![MatchEntry::user_trap_id(3)]).unwrap();
        filter
            .add_rule(Direction::Ingress, matches, actions, false)
            .unwrap();

        let mut attrs = PacketAttrs {
            trap_id: 3,
            ..Default::default()
        };
        assert!(!filter.evaluate(Direction::Ingress, &[0u8; 64], &mut attrs));
        assert_eq!(attrs.npu_id, 1);
        assert_eq!(attrs.rx_port, 9);
    }

    #[test]
    fn test_create_ignores_supplied_id() {
        let filter = filter();
        let spec: RuleSpec = serde_json::from_str(
            r#"{"id": 200, "direction": "egress", "stop": false,
                "matches": [{"type": 2, "value": 4}],
                "actions": [{"type": 3, "value": 13}]}"#,
        )
        .unwrap();
        let id = filter.create(&spec).unwrap();
        assert_eq!(id, 0);

        let described = filter.describe(id).unwrap();
        assert_eq!(described.id, Some(0));
        assert_eq!(described.direction, Direction::Egress);
        assert_eq!(described.matches, spec.matches);
        assert_eq!(described.actions, spec.actions);
        assert_eq!(filter.describe_all().len(), 1);

        assert!(filter.delete(id));
        assert!(filter.describe(id).is_none());
    }

    #[test]
    fn test_create_rejects_bad_spec_without_consuming_id() {
        let filter = filter();
        let spec: RuleSpec = serde_json::from_str(
            r#"{"direction": "ingress",
                "matches": [{"type": 2, "value": 4}, {"type": 2, "value": 5}]}"#,
        )
        .unwrap();
        assert!(matches!(
            filter.create(&spec),
            Err(FilterError::DuplicateMatch(MatchType::HostifUserTrapId))
        ));
        assert_eq!(filter.rule_count(Direction::Ingress), 0);

        let (m, a) = trap_rule(1, 12);
        assert_eq!(filter.add_rule(Direction::Ingress, m, a, false).unwrap(), 0);
    }
}
