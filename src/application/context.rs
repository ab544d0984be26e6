//! Per-request state threaded explicitly through every orchestrator operation.

use std::collections::HashSet;

use tracing::warn;

use super::orchestrator::SaveReceipt;
use crate::cache::{CacheKey, CacheKeySpec, KeyChain};
use crate::domain::{request::RequestInfo, response::Response};

/// State names recorded in [`History`].
pub mod states {
    pub const READING: &str = "reading";
    pub const FETCHING: &str = "fetching";
    pub const SAVING: &str = "saving";
    pub const SERVING: &str = "serving";
    pub const DELETING: &str = "deleting";
}

/// Event names recorded in [`History`].
pub mod events {
    pub const RESPONSE_NOT_CACHEABLE: &str = "response_not_cacheable";
    pub const CAN_SERVE_STALE: &str = "can_serve_stale";
    pub const CAN_SERVE_DISCONNECTED: &str = "can_serve_disconnected";
    pub const CLIENT_ABORTED: &str = "client_aborted";
}

/// States visited and events seen while handling one request.
#[derive(Debug, Clone, Default)]
pub struct History {
    states: HashSet<&'static str>,
    events: HashSet<&'static str>,
}

impl History {
    pub fn record_state(&mut self, state: &'static str) {
        self.states.insert(state);
    }

    pub fn record_event(&mut self, event: &'static str) {
        self.events.insert(event);
    }

    pub fn visited(&self, state: &str) -> bool {
        self.states.contains(state)
    }

    pub fn saw(&self, event: &str) -> bool {
        self.events.contains(event)
    }
}

/// What the serve loop should do once the client has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// Stop pulling the body.
    Stop,
    /// Keep pulling without writing so a pending save can complete.
    Drain,
}

pub type AbortHandler = Box<dyn FnMut() -> AbortAction + Send>;

pub struct RequestContext {
    pub request: RequestInfo,
    pub response: Option<Response>,
    pub error_response: Option<Response>,
    pub history: History,
    cache_key: Option<CacheKey>,
    key_chain: Option<KeyChain>,
    abort_handler: Option<AbortHandler>,
    aborted: bool,
    pending_save: Option<SaveReceipt>,
}

impl RequestContext {
    pub fn new(request: RequestInfo) -> Self {
        Self {
            request,
            response: None,
            error_response: None,
            history: History::default(),
            cache_key: None,
            key_chain: None,
            abort_handler: None,
            aborted: false,
            pending_save: None,
        }
    }

    /// Derived once per request; later calls return the memoized key.
    pub fn cache_key(&mut self, spec: &CacheKeySpec) -> CacheKey {
        match self.cache_key.as_ref() {
            Some(key) if !key.as_str().is_empty() => key.clone(),
            _ => {
                let key = spec.derive(&self.request);
                self.cache_key = Some(key.clone());
                key
            }
        }
    }

    pub fn key_chain(&mut self, spec: &CacheKeySpec) -> KeyChain {
        if let Some(chain) = self.key_chain.as_ref() {
            return chain.clone();
        }
        let chain = KeyChain::new(&self.cache_key(spec));
        self.key_chain = Some(chain.clone());
        chain
    }

    /// Returns `false` and keeps the existing handler when one is already registered.
    pub fn register_abort_handler<F>(&mut self, handler: F) -> bool
    where
        F: FnMut() -> AbortAction + Send + 'static,
    {
        if self.abort_handler.is_some() {
            warn!(
                uri = %self.request.full_uri(),
                "abort handler already registered; keeping the first"
            );
            return false;
        }
        self.abort_handler = Some(Box::new(handler));
        true
    }

    /// Record the disconnect and ask the registered handler how to proceed.
    pub fn client_aborted(&mut self) -> AbortAction {
        self.aborted = true;
        self.history.record_event(events::CLIENT_ABORTED);
        match self.abort_handler.as_mut() {
            Some(handler) => handler(),
            None => AbortAction::Stop,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Park the receipt of a save whose body is still streaming.
    pub fn set_pending_save(&mut self, receipt: SaveReceipt) {
        self.pending_save = Some(receipt);
    }

    pub fn take_pending_save(&mut self) -> Option<SaveReceipt> {
        self.pending_save.take()
    }
}
