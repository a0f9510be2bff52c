// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Configuration compilation: Corefile text → server blocks → (later, in
//! [`crate::listener`]) listener groups.

pub mod block;
pub mod corefile;
pub mod loader;

use std::io::Read;
use std::path::Path;

pub use block::ServerBlockConfig;
pub use loader::{Loader, PluginRegistry};

use crate::error::ConfigError;

/// Read the Corefile from `path`, or from standard input when `path` is
/// literally `"stdin"`.
pub fn read_corefile(path: &Path) -> Result<String, ConfigError> {
    if path.as_os_str() == "stdin" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Read {
                path: "stdin".to_string(),
                source,
            })?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Parse and load a full Corefile into its server blocks.
pub fn load(source: &str, registry: PluginRegistry) -> Result<Vec<ServerBlockConfig>, ConfigError> {
    let raw = corefile::parse(source)?;
    Loader::new(registry).load(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_end_to_end_from_source_text() {
        let source = "example.org:53 {\n  whoami\n}\n\ntls://.:853 {\n  tls c.pem k.pem\n  whoami\n}\n";
        let blocks = load(source, PluginRegistry::with_builtins()).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].zone_address.zone, "example.org.");
        assert_eq!(blocks[1].zone_address.zone, ".");
        assert!(blocks[1].tls.is_some());
    }
}
