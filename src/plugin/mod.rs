// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The plugin handler contract.
//!
//! A [`Handler`] is the capability every plugin exposes; `next` is stored
//! as a field on the handler produced by a [`ChainBuilder`], not threaded
//! through the call — mirroring the `func(next) Handler` pattern directives
//! register during config loading.

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};

use crate::context::RequestContext;
use crate::writer::ResponseWriter;

pub mod loop_detect;
pub mod whoami;

/// Result of one handler invocation: a conformant handler either
/// writes exactly one reply and returns an advisory rcode, delegates to
/// `next`, or returns a non-zero rcode/error for the core to synthesise a
/// reply from.
pub type ServeResult = (ResponseCode, Option<PluginError>);

#[derive(Debug, Clone)]
pub struct PluginError {
    pub plugin: &'static str,
    pub message: String,
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.plugin, self.message)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn serve(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        msg: &Message,
    ) -> ServeResult;
}

/// The "no-next" handler at the tail of every chain. Reached
/// only when every directive in the block delegates past itself.
pub struct Terminal;

#[async_trait]
impl Handler for Terminal {
    fn name(&self) -> &'static str {
        "<terminal>"
    }

    async fn serve(
        &self,
        _ctx: &RequestContext,
        _writer: &mut dyn ResponseWriter,
        _msg: &Message,
    ) -> ServeResult {
        (ResponseCode::Refused, None)
    }
}

/// Registered by a directive's setup routine: a function from
/// "the rest of the chain" to a handler that wraps it.
pub type ChainBuilder = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// A materialised, ordered plugin chain for one routing-table entry. Built
/// by folding chain-builders, in directive order, over [`Terminal`] — the
/// first directive in the Corefile ends up outermost.
#[derive(Clone)]
pub struct Chain {
    head: Arc<dyn Handler>,
}

impl Chain {
    pub fn build(builders: &[ChainBuilder]) -> Chain {
        let mut head: Arc<dyn Handler> = Arc::new(Terminal);
        for builder in builders.iter().rev() {
            head = builder(head);
        }
        Chain { head }
    }

    pub fn empty() -> Self {
        Chain {
            head: Arc::new(Terminal),
        }
    }

    pub async fn serve(
        &self,
        ctx: &RequestContext,
        writer: &mut dyn ResponseWriter,
        msg: &Message,
    ) -> ServeResult {
        self.head.serve(ctx, writer, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::test_support::RecordingWriter;
    use hickory_proto::op::Message;
    use tokio_util::sync::CancellationToken;

    struct Outer(Arc<dyn Handler>);
    #[async_trait]
    impl Handler for Outer {
        fn name(&self) -> &'static str {
            "outer"
        }
        async fn serve(
            &self,
            ctx: &RequestContext,
            writer: &mut dyn ResponseWriter,
            msg: &Message,
        ) -> ServeResult {
            self.0.serve(ctx, writer, msg).await
        }
    }

    #[tokio::test]
    async fn first_directive_ends_up_outermost() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();

        let builder_a: ChainBuilder = Arc::new(move |next| {
            order_a.lock().unwrap().push("a-build");
            Arc::new(Outer(next)) as Arc<dyn Handler>
        });
        let builder_b: ChainBuilder = Arc::new(move |next| {
            order_b.lock().unwrap().push("b-build");
            Arc::new(Outer(next)) as Arc<dyn Handler>
        });

        // directive order: a, then b
        let chain = Chain::build(&[builder_a, builder_b]);
        let ctx = RequestContext::new("dns://0.0.0.0:53", CancellationToken::new());
        let mut writer = RecordingWriter::new("127.0.0.1:1".parse().unwrap());
        let msg = Message::new();
        let (rcode, _) = chain.serve(&ctx, &mut writer, &msg).await;

        // no plugin wrote a reply, terminal refuses
        assert_eq!(rcode, ResponseCode::Refused);
        // builders apply in reverse order: b wraps terminal first, a wraps
        // that, so a ends up outermost.
        assert_eq!(*order.lock().unwrap(), vec!["b-build", "a-build"]);
    }
}
