//! Listener adapter: turns each inbound request into a [`RequestContext`] run by the
//! decision engine, streaming the served body back through a channel.
//!
//! [`RequestContext`]: crate::application::context::RequestContext

mod middleware;
mod proxy;
mod sink;

pub use proxy::{ProxyState, build_router};
pub use sink::{ChannelSink, ChannelSource, ResponseHead};
