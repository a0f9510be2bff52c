// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-request context.
//!
//! Represented as an immutable map of typed entries overlaying a
//! cancellation token. Plugins that mutate the context (e.g. to bump the
//! loop-depth counter before a self-query) clone it and get back a new
//! `RequestContext`; there is never a shared mutable map visible to
//! concurrent plugins.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use hyper::http::Request;
use tokio_util::sync::CancellationToken;

/// Opaque, cloneable, typed value bag. Keyed by `TypeId` so plugins can
/// stash their own marker types without central registration.
#[derive(Clone, Default)]
struct ValueMap(Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>);

impl ValueMap {
    fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0
            .get(&TypeId::of::<T>())
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    fn with<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut map = (*self.0).clone();
        map.insert(TypeId::of::<T>(), Arc::new(value) as Arc<dyn Any + Send + Sync>);
        ValueMap(Arc::new(map))
    }
}

/// The inbound HTTP request for DoH/DoH3 requests, stashed so plugins can
/// read headers (`X-Forwarded-For`), method and URL.
#[derive(Clone)]
pub struct HttpRequestInfo {
    pub method: hyper::Method,
    pub uri: hyper::Uri,
    pub headers: hyper::HeaderMap,
    pub remote_addr: std::net::SocketAddr,
}

impl HttpRequestInfo {
    pub fn from_request<B>(req: &Request<B>, remote_addr: std::net::SocketAddr) -> Self {
        HttpRequestInfo {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            remote_addr,
        }
    }
}

/// Loop-depth counter: incremented whenever a
/// plugin performs an in-process self-query, starting at 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopDepth(pub u32);

#[derive(Clone)]
pub struct RequestContext {
    /// The listener this request arrived on, e.g. `"dns://0.0.0.0:53"`.
    listener_key: Arc<str>,
    values: ValueMap,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(listener_key: impl Into<Arc<str>>, cancel: CancellationToken) -> Self {
        RequestContext {
            listener_key: listener_key.into(),
            values: ValueMap::default().with(LoopDepth(0)),
            cancel,
        }
    }

    pub fn listener_key(&self) -> &str {
        &self.listener_key
    }

    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn loop_depth(&self) -> u32 {
        self.values.get::<LoopDepth>().map(|d| d.0).unwrap_or(0)
    }

    pub fn http_request(&self) -> Option<Arc<HttpRequestInfo>> {
        self.values.get::<HttpRequestInfo>()
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values.get::<T>()
    }

    /// Returns a new context with `value` installed, leaving `self`
    /// untouched (the map reference is replaced, never mutated in place).
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        RequestContext {
            listener_key: self.listener_key.clone(),
            values: self.values.with(value),
            cancel: self.cancel.clone(),
        }
    }

    /// Clone the context with the loop-depth counter incremented; used by
    /// plugins before performing an in-process self-query.
    #[must_use]
    pub fn with_incremented_loop_depth(&self) -> Self {
        let next = LoopDepth(self.loop_depth() + 1);
        self.with_value(next)
    }

    #[must_use]
    pub fn with_http_request(&self, info: HttpRequestInfo) -> Self {
        self.with_value(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_depth_starts_at_zero_and_increments_on_clone() {
        let ctx = RequestContext::new("dns://0.0.0.0:53", CancellationToken::new());
        assert_eq!(ctx.loop_depth(), 0);
        let next = ctx.with_incremented_loop_depth();
        assert_eq!(next.loop_depth(), 1);
        // original is untouched
        assert_eq!(ctx.loop_depth(), 0);
    }

    #[test]
    fn cancellation_is_observable_after_parent_cancel() {
        let cancel = CancellationToken::new();
        let ctx = RequestContext::new("dns://0.0.0.0:53", cancel.clone());
        assert!(!ctx.is_cancelled());
        cancel.cancel();
        assert!(ctx.is_cancelled());
    }
}
