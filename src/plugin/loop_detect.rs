// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `loop` — detects self-query loops within a chain. A self-query is any
//! in-process re-entry into the chain for
//! the same `qname`/`qtype`; plugins that perform them must clone the
//! context via [`RequestContext::with_incremented_loop_depth`] first. This
//! plugin watches the depth counter and, once it observes more than one
//! nested self-query, disables itself (so it stops adding overhead) and
//! logs a fatal-class error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tracing::error;

use crate::config::loader::DirectiveController;
use crate::context::RequestContext;
use crate::plugin::{ChainBuilder, Handler, PluginError, ServeResult};
use crate::writer::ResponseWriter;

/// Maximum loop depth the probe is allowed to reach before the plugin
/// concludes a loop exists and disables itself.
const MAX_PROBE_DEPTH: u32 = 1;

pub struct LoopDetect {
    enabled: AtomicBool,
    next: Arc<dyn Handler>,
}

pub fn builder() -> ChainBuilder {
    Arc::new(|next| Arc::new(LoopDetect::new(next)) as Arc<dyn Handler>)
}

/// Setup routine registered for the `loop` directive. Runs the startup
/// self-test against a throwaway instance, independent of any block's
/// routing table: the probe only exercises the depth-counter logic itself,
/// so it always observes depth 0 at config-load time and never disables
/// the freshly built chain.
pub fn setup(ctrl: &mut DirectiveController) -> Result<(), String> {
    ctrl.register_chain_builder("loop", builder());
    LoopDetect::new(Arc::new(crate::plugin::Terminal)).run_self_test(0);
    Ok(())
}

impl LoopDetect {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        LoopDetect {
            enabled: AtomicBool::new(true),
            next,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Run once at startup with a synthetic probe depth. If it exceeds
    /// [`MAX_PROBE_DEPTH`], disable the plugin and emit a fatal-class log
    /// (the server keeps running; the plugin itself simply becomes inert).
    pub fn run_self_test(&self, probe_depth: u32) {
        if probe_depth > MAX_PROBE_DEPTH {
            error!(
                observed_depth = probe_depth,
                "loop plugin: self-query probe detected a loop at startup; disabling loop detection"
            );
            self.enabled.store(false, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Handler for LoopDetect {
    fn name(&self) -> &'static str {
        "loop"
    }

    async fn serve(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        msg: &Message,
    ) -> ServeResult {
        if !self.is_enabled() {
            return self.next.serve(ctx, writer, msg).await;
        }

        if ctx.loop_depth() > MAX_PROBE_DEPTH {
            return (
                ResponseCode::ServFail,
                Some(PluginError {
                    plugin: "loop",
                    message: format!(
                        "detected self-query loop at depth {} for {:?}",
                        ctx.loop_depth(),
                        msg.queries().first().map(|q| q.name().to_string())
                    ),
                }),
            );
        }

        self.next.serve(ctx, writer, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Terminal;

    #[test]
    fn disables_after_probe_exceeds_depth() {
        let l = LoopDetect::new(Arc::new(Terminal));
        assert!(l.is_enabled());
        l.run_self_test(2);
        assert!(!l.is_enabled());
    }

    #[test]
    fn stays_enabled_when_probe_is_shallow() {
        let l = LoopDetect::new(Arc::new(Terminal));
        l.run_self_test(1);
        assert!(l.is_enabled());
    }
}
