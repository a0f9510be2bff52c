// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Listener grouper and routing table.
//!
//! Collapses server blocks that share a listening endpoint into one
//! listener with an immutable routing table, built once at startup and
//! never locked afterward.

use std::collections::HashMap;

use crate::config::ServerBlockConfig;
use crate::error::ConfigError;
use crate::plugin::Chain;
use crate::zone_address::Transport;

/// `fqdn → plugin-chain`, longest-suffix lookup.
/// Implemented as a flat table scanned for the longest matching suffix: a
/// reasonable alternative to a reversed-label trie when the zone set per
/// listener is small, which is the common case for a single Corefile
/// listener.
#[derive(Clone, Default)]
pub struct RoutingTable {
    entries: Vec<(String, Chain)>,
}

impl RoutingTable {
    pub fn insert(&mut self, zone: String, chain: Chain) {
        self.entries.push((zone, chain));
    }

    pub fn is_disjoint_from(&self, zone: &str) -> bool {
        !self.entries.iter().any(|(z, _)| z == zone)
    }

    /// Longest-suffix match against `qname`. Falls back to a chain
    /// registered for the root zone `"."`, if any.
    pub fn lookup(&self, qname: &str) -> Option<&Chain> {
        let qname = qname.to_ascii_lowercase();
        let mut best: Option<(&str, &Chain)> = None;
        for (zone, chain) in &self.entries {
            if zone == "." {
                continue; // root handled as an explicit fallback below
            }
            if label_aligned_suffix(&qname, zone) {
                if best.map(|(z, _)| zone.len() > z.len()).unwrap_or(true) {
                    best = Some((zone.as_str(), chain));
                }
            }
        }
        if let Some((_, chain)) = best {
            return Some(chain);
        }
        self.entries
            .iter()
            .find(|(z, _)| z == ".")
            .map(|(_, chain)| chain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether `zone` is a suffix of `qname` on a label boundary: either an
/// exact match, or the byte immediately preceding the matched suffix in
/// `qname` is a label separator (`.`).
fn label_aligned_suffix(qname: &str, zone: &str) -> bool {
    if qname == zone {
        return true;
    }
    qname
        .strip_suffix(zone)
        .is_some_and(|prefix| prefix.ends_with('.'))
}

/// One listener: an endpoint plus the blocks it must serve.
pub struct ListenerGroup {
    pub listener_key: String,
    pub transport: Transport,
    pub listen_host: String,
    pub port: u16,
    pub blocks: Vec<ServerBlockConfig>,
    pub routing_table: RoutingTable,
}

/// Partition completed server blocks into listener groups.
/// Multi-valued `listen_hosts` duplicate the block across each host.
pub fn group(blocks: Vec<ServerBlockConfig>) -> Result<Vec<ListenerGroup>, ConfigError> {
    let mut groups: HashMap<String, ListenerGroup> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for block in blocks {
        let hosts = if block.listen_hosts.is_empty() {
            vec!["0.0.0.0".to_string()]
        } else {
            block.listen_hosts.clone()
        };
        for host in hosts {
            let listener_key = block.zone_address.listener_key(&host);
            let entry = groups.entry(listener_key.clone()).or_insert_with(|| {
                order.push(listener_key.clone());
                ListenerGroup {
                    listener_key: listener_key.clone(),
                    transport: block.zone_address.transport,
                    listen_host: host.clone(),
                    port: block.zone_address.port,
                    blocks: Vec::new(),
                    routing_table: RoutingTable::default(),
                }
            });

            if !entry.routing_table.is_disjoint_from(&block.zone_address.zone) {
                return Err(ConfigError::OverlappingZones {
                    listener_key,
                    zone: block.zone_address.zone.clone(),
                });
            }
            entry
                .routing_table
                .insert(block.zone_address.zone.clone(), block.build_chain());
            entry.blocks.push(block);
        }
    }

    Ok(order
        .into_iter()
        .map(|key| groups.remove(&key).expect("key present"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load, PluginRegistry};

    fn plugin_names_for(group: &ListenerGroup, zone: &str) -> Vec<String> {
        group
            .blocks
            .iter()
            .find(|b| b.zone_address.zone == zone)
            .expect("zone present in group")
            .plugin_names()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn longest_suffix_match_wins() {
        let source = "example.org {\n  whoami\n}\nsub.example.org {\n  loop\n}\n";
        let blocks = load(source, PluginRegistry::with_builtins()).unwrap();
        let groups = group(blocks).unwrap();
        assert_eq!(groups.len(), 1);
        let table = &groups[0].routing_table;
        assert!(table.lookup("host.sub.example.org.").is_some());
        assert!(table.lookup("other.example.org.").is_some());
        assert_eq!(plugin_names_for(&groups[0], "sub.example.org."), vec!["loop"]);
        assert_eq!(plugin_names_for(&groups[0], "example.org."), vec!["whoami"]);
    }

    #[test]
    fn overlapping_zones_in_one_group_is_an_error() {
        let source = "example.org:53 example.org:53 {\n  whoami\n}\n";
        // two identical keys are already rejected at load() as a duplicate
        // key; construct an overlap via distinct raw blocks instead to
        // exercise this module's own check.
        let _ = source;
        let source = "example.org:53 {\n  whoami\n}\nexample.org:53 {\n  loop\n}\n";
        let blocks = load(source, PluginRegistry::with_builtins()).unwrap();
        assert!(matches!(
            group(blocks),
            Err(ConfigError::OverlappingZones { .. })
        ));
    }

    #[test]
    fn routing_miss_with_no_root_fallback_returns_none() {
        let source = "example.org:53 {\n  whoami\n}\n";
        let blocks = load(source, PluginRegistry::with_builtins()).unwrap();
        let groups = group(blocks).unwrap();
        assert!(groups[0].routing_table.lookup("other.test.").is_none());
    }

    #[test]
    fn root_zone_is_used_as_fallback() {
        let source = ".:53 {\n  whoami\n}\nexample.org:53 {\n  loop\n}\n";
        let blocks = load(source, PluginRegistry::with_builtins()).unwrap();
        let groups = group(blocks).unwrap();
        let table = &groups[0].routing_table;
        assert!(table.lookup("example.org.").is_some());
        assert!(table.lookup("anything.else.").is_some());
        assert_eq!(plugin_names_for(&groups[0], "example.org."), vec!["loop"]);
        assert_eq!(plugin_names_for(&groups[0], "."), vec!["whoami"]);
    }
}
