// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Config loader.
//!
//! Drives per-directive plugin setup and materializes each server block's
//! plugin chain. Reserved directives (`bind`, `tls`, `multisocket`, the
//! per-transport cap blocks) are handled directly by the core rather than
//! dispatched to the plugin registry.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::config::block::{ServerBlockConfig, TlsMaterial};
use crate::config::corefile::RawDirective;
use crate::config::corefile::RawServerBlock;
use crate::error::ConfigError;
use crate::plugin::ChainBuilder;
use crate::zone_address::{Transport, ZoneAddress};

/// The arguments and mutable per-block config handed to a directive's setup
/// routine: a controller exposing the directive's arguments and the
/// mutable per-block config being built.
pub struct DirectiveController<'a> {
    pub args: &'a [String],
    pub sub_block: &'a [RawDirective],
    pub block: &'a mut ServerBlockConfig,
}

impl<'a> DirectiveController<'a> {
    pub fn register_chain_builder(&mut self, name: &str, builder: ChainBuilder) {
        self.block.chain_builders.push((name.to_string(), builder));
    }
}

pub type SetupFn = fn(&mut DirectiveController) -> Result<(), String>;

#[derive(Clone, Copy)]
struct PluginEntry {
    setup: SetupFn,
    allow_repetition: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: HashMap<String, PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, directive: &str, setup: SetupFn, allow_repetition: bool) {
        self.entries.insert(
            directive.to_string(),
            PluginEntry {
                setup,
                allow_repetition,
            },
        );
    }

    /// The registry shipped with the core: the two plugins this crate
    /// implements itself; the rest of the plugin ecosystem is treated as
    /// out-of-scope black boxes a Corefile can still name but this crate
    /// does not ship.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("whoami", crate::plugin::whoami::setup, false);
        registry.register("loop", crate::plugin::loop_detect::setup, false);
        registry
    }

    fn lookup(&self, name: &str) -> Option<PluginEntry> {
        self.entries.get(name).copied()
    }
}

pub struct Loader {
    registry: PluginRegistry,
}

impl Loader {
    pub fn new(registry: PluginRegistry) -> Self {
        Loader { registry }
    }

    /// Turn parsed Corefile blocks into fully materialised server blocks,
    /// including the zone-address/duplicate-key tie-break.
    pub fn load(&self, raw_blocks: Vec<RawServerBlock>) -> Result<Vec<ServerBlockConfig>, ConfigError> {
        let mut blocks = Vec::new();
        let mut seen_addresses: HashMap<(Transport, String, u16), String> = HashMap::new();

        for raw in raw_blocks {
            let mut key_addrs = Vec::new();
            for key in &raw.keys {
                let (za, warning) = ZoneAddress::parse(key)?;
                if let Some(w) = warning {
                    tracing::warn!("{w}");
                }
                let canon = za.canonical();
                let identity = (za.transport, za.zone.clone(), za.port);
                if let Some(prev) = seen_addresses.get(&identity) {
                    return Err(ConfigError::ZoneAddress(
                        crate::error::ZoneAddressError::DuplicateKey(prev.clone(), canon),
                    ));
                }
                seen_addresses.insert(identity, canon);
                key_addrs.push(za);
            }

            let mut template = ServerBlockConfig::new(key_addrs[0].clone(), raw.line);
            let mut seen_plugins: HashSet<String> = HashSet::new();
            for directive in &raw.directives {
                self.apply_directive(&mut template, directive, &mut seen_plugins)?;
            }
            if template.listen_hosts.is_empty() {
                template.listen_hosts = vec!["0.0.0.0".to_string(), "::".to_string()];
            }

            for za in key_addrs {
                let mut block = template.clone();
                block.zone_address = za;
                blocks.push(block);
            }
        }

        Ok(blocks)
    }

    fn apply_directive(
        &self,
        block: &mut ServerBlockConfig,
        directive: &RawDirective,
        seen_plugins: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        match directive.name.as_str() {
            "bind" => {
                block.listen_hosts = directive.args.clone();
                Ok(())
            }
            "tls" => {
                let cert = directive.args.first().ok_or_else(|| ConfigError::Directive {
                    plugin: "tls".to_string(),
                    position: format!("line {}", directive.line),
                    message: "expected CERT KEY [CA]".to_string(),
                })?;
                let key = directive.args.get(1).ok_or_else(|| ConfigError::Directive {
                    plugin: "tls".to_string(),
                    position: format!("line {}", directive.line),
                    message: "expected CERT KEY [CA]".to_string(),
                })?;
                block.tls = Some(TlsMaterial {
                    cert_path: PathBuf::from(cert),
                    key_path: PathBuf::from(key),
                    ca_path: directive.args.get(2).map(PathBuf::from),
                    server_name: None,
                });
                Ok(())
            }
            "tls_servername" => {
                let name = directive.args.first().ok_or_else(|| ConfigError::Directive {
                    plugin: "tls_servername".to_string(),
                    position: format!("line {}", directive.line),
                    message: "expected NAME".to_string(),
                })?;
                if let Some(tls) = block.tls.as_mut() {
                    tls.server_name = Some(name.clone());
                }
                Ok(())
            }
            "multisocket" => {
                let n = parse_arg(directive, 0, "N")?;
                block.transport_limits.multisocket = Some(n);
                Ok(())
            }
            "debug" => {
                block.debug = true;
                Ok(())
            }
            "stacktrace" => {
                block.stacktrace = true;
                Ok(())
            }
            "quic" => {
                for sub in &directive.sub_block {
                    match sub.name.as_str() {
                        "max_streams" => {
                            block.transport_limits.quic_max_streams = Some(parse_arg(sub, 0, "N")?);
                        }
                        "worker_pool_size" => {
                            block.transport_limits.quic_worker_pool_size =
                                Some(parse_arg(sub, 0, "N")?);
                        }
                        other => {
                            return Err(ConfigError::Directive {
                                plugin: "quic".to_string(),
                                position: format!("line {}", sub.line),
                                message: format!("unknown sub-directive {other:?}"),
                            })
                        }
                    }
                }
                Ok(())
            }
            "grpc_server" => {
                for sub in &directive.sub_block {
                    match sub.name.as_str() {
                        "max_streams" => {
                            block.transport_limits.grpc_max_streams = Some(parse_arg(sub, 0, "N")?);
                        }
                        "max_connections" => {
                            block.transport_limits.grpc_max_connections =
                                Some(parse_arg(sub, 0, "N")?);
                        }
                        other => {
                            return Err(ConfigError::Directive {
                                plugin: "grpc_server".to_string(),
                                position: format!("line {}", sub.line),
                                message: format!("unknown sub-directive {other:?}"),
                            })
                        }
                    }
                }
                Ok(())
            }
            "https" => {
                for sub in &directive.sub_block {
                    match sub.name.as_str() {
                        "max_connections" => {
                            block.transport_limits.https_max_connections =
                                Some(parse_arg(sub, 0, "N")?);
                        }
                        other => {
                            return Err(ConfigError::Directive {
                                plugin: "https".to_string(),
                                position: format!("line {}", sub.line),
                                message: format!("unknown sub-directive {other:?}"),
                            })
                        }
                    }
                }
                Ok(())
            }
            "https3" => {
                for sub in &directive.sub_block {
                    match sub.name.as_str() {
                        "max_streams" => {
                            block.transport_limits.https3_max_streams =
                                Some(parse_arg(sub, 0, "N")?);
                        }
                        other => {
                            return Err(ConfigError::Directive {
                                plugin: "https3".to_string(),
                                position: format!("line {}", sub.line),
                                message: format!("unknown sub-directive {other:?}"),
                            })
                        }
                    }
                }
                Ok(())
            }
            other => {
                let entry = self.registry.lookup(other).ok_or_else(|| {
                    ConfigError::UnknownDirective(other.to_string())
                })?;
                if !entry.allow_repetition && !seen_plugins.insert(other.to_string()) {
                    return Err(ConfigError::DuplicatePlugin(other.to_string()));
                }
                seen_plugins.insert(other.to_string());

                let mut ctrl = DirectiveController {
                    args: &directive.args,
                    sub_block: &directive.sub_block,
                    block,
                };
                (entry.setup)(&mut ctrl).map_err(|message| ConfigError::Directive {
                    plugin: other.to_string(),
                    position: format!("line {}", directive.line),
                    message,
                })
            }
        }
    }
}

fn parse_arg<T: std::str::FromStr>(
    directive: &RawDirective,
    idx: usize,
    expected: &str,
) -> Result<T, ConfigError> {
    directive
        .args
        .get(idx)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ConfigError::Directive {
            plugin: directive.name.clone(),
            position: format!("line {}", directive.line),
            message: format!("expected {expected}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::corefile;

    #[test]
    fn loads_simple_whoami_block() {
        let raw = corefile::parse("example.org:53 {\n  whoami\n}\n").unwrap();
        let loader = Loader::new(PluginRegistry::with_builtins());
        let blocks = loader.load(raw).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].zone_address.zone, "example.org.");
        assert_eq!(blocks[0].plugin_names().collect::<Vec<_>>(), vec!["whoami"]);
    }

    #[test]
    fn duplicate_plugin_without_repetition_is_an_error() {
        let raw = corefile::parse("example.org {\n  whoami\n  whoami\n}\n").unwrap();
        let loader = Loader::new(PluginRegistry::with_builtins());
        assert!(matches!(
            loader.load(raw),
            Err(ConfigError::DuplicatePlugin(_))
        ));
    }

    #[test]
    fn multiple_keys_share_one_chain_but_get_distinct_zone_addresses() {
        let raw = corefile::parse("a.example.org b.example.org {\n  whoami\n}\n").unwrap();
        let loader = Loader::new(PluginRegistry::with_builtins());
        let blocks = loader.load(raw).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].zone_address.zone, "a.example.org.");
        assert_eq!(blocks[1].zone_address.zone, "b.example.org.");
    }

    #[test]
    fn quic_sub_block_sets_transport_limits() {
        let raw = corefile::parse("quic://.:853 {\n  tls a.pem b.pem\n  quic {\n    max_streams 64\n  }\n}\n").unwrap();
        let loader = Loader::new(PluginRegistry::with_builtins());
        let blocks = loader.load(raw).unwrap();
        assert_eq!(blocks[0].transport_limits.quic_max_streams(), 64);
    }

    #[test]
    fn same_triple_twice_is_a_config_error() {
        let raw = corefile::parse("example.org:53 example.org {\n  whoami\n}\n").unwrap();
        let loader = Loader::new(PluginRegistry::with_builtins());
        assert!(loader.load(raw).is_err());
    }
}
