//! Lifecycle event bus.
//!
//! Listeners are bound per [`EventName`] and run in registration order. Every event variant
//! carries a mutable payload, so a listener can amend the response, upstream target or
//! revalidation data before the pipeline continues. A listener that fails or panics is
//! logged and skipped; the remaining listeners still run.

use std::{collections::HashMap, fmt, panic::AssertUnwindSafe};

use thiserror::Error;
use tracing::{error, trace};

use crate::domain::{
    response::Response,
    revalidation::RevalidationData,
    upstream::{OutboundRequest, UpstreamTarget},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    AfterCacheRead,
    BeforeUpstreamConnect,
    BeforeUpstreamRequest,
    AfterUpstreamRequest,
    BeforeSave,
    BeforeSaveRevalidationData,
    BeforeServe,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::AfterCacheRead => "after_cache_read",
            EventName::BeforeUpstreamConnect => "before_upstream_connect",
            EventName::BeforeUpstreamRequest => "before_upstream_request",
            EventName::AfterUpstreamRequest => "after_upstream_request",
            EventName::BeforeSave => "before_save",
            EventName::BeforeSaveRevalidationData => "before_save_revalidation_data",
            EventName::BeforeServe => "before_serve",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event together with the payload listeners may mutate.
pub enum Event<'a> {
    AfterCacheRead(&'a mut Response),
    BeforeUpstreamConnect(&'a mut UpstreamTarget),
    BeforeUpstreamRequest(&'a mut OutboundRequest),
    AfterUpstreamRequest(&'a mut Response),
    BeforeSave(&'a mut Response),
    BeforeSaveRevalidationData(&'a mut RevalidationData),
    BeforeServe(&'a mut Response),
}

impl Event<'_> {
    pub fn name(&self) -> EventName {
        match self {
            Event::AfterCacheRead(_) => EventName::AfterCacheRead,
            Event::BeforeUpstreamConnect(_) => EventName::BeforeUpstreamConnect,
            Event::BeforeUpstreamRequest(_) => EventName::BeforeUpstreamRequest,
            Event::AfterUpstreamRequest(_) => EventName::AfterUpstreamRequest,
            Event::BeforeSave(_) => EventName::BeforeSave,
            Event::BeforeSaveRevalidationData(_) => EventName::BeforeSaveRevalidationData,
            Event::BeforeServe(_) => EventName::BeforeServe,
        }
    }

    /// The response payload, for the events that carry one.
    pub fn response_mut(&mut self) -> Option<&mut Response> {
        match self {
            Event::AfterCacheRead(res)
            | Event::AfterUpstreamRequest(res)
            | Event::BeforeSave(res)
            | Event::BeforeServe(res) => Some(&mut **res),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type Listener = Box<dyn Fn(&mut Event<'_>) -> Result<(), HookError> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<EventName, Vec<Listener>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .listeners
            .iter()
            .map(|(name, listeners)| (name.as_str(), listeners.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<F>(&mut self, name: EventName, listener: F)
    where
        F: Fn(&mut Event<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.listeners
            .entry(name)
            .or_default()
            .push(Box::new(listener));
    }

    pub fn listener_count(&self, name: EventName) -> usize {
        self.listeners.get(&name).map_or(0, Vec::len)
    }

    pub fn emit(&self, mut event: Event<'_>) {
        let name = event.name();
        let Some(listeners) = self.listeners.get(&name) else {
            return;
        };
        trace!(event = %name, listeners = listeners.len(), "emitting event");

        for (index, listener) in listeners.iter().enumerate() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener(&mut event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(event = %name, listener = index, error = %err, "event listener failed");
                }
                Err(_) => {
                    error!(event = %name, listener = index, "event listener panicked");
                }
            }
        }
    }
}
