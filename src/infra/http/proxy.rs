use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
};
use tracing::{error, instrument};

use super::{
    middleware::{log_responses, set_request_id},
    sink::ChannelSink,
};
use crate::application::{
    context::RequestContext,
    engine::DecisionEngine,
    error::HttpError,
    orchestrator::Orchestrator,
};
use crate::domain::request::RequestInfo;

#[derive(Clone)]
pub struct ProxyState {
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<dyn DecisionEngine>,
    /// Address the listener is bound to, recorded as the request's server address.
    pub local_addr: SocketAddr,
    pub max_request_body_bytes: usize,
}

/// Every path and method goes through the decision engine.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .fallback(proxy)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_id))
}

#[instrument(skip_all, fields(method = %request.method(), uri = %request.uri()))]
async fn proxy(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_request_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            return HttpError::from_error(
                "infra::http::proxy",
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                &err,
            )
            .into_response();
        }
    };

    let info = RequestInfo::from_parts(&parts, body, state.local_addr);
    let (mut sink, source) = ChannelSink::new(parts.version);
    let (head, body) = source.into_parts();

    // The engine runs detached so a save can finish after the client goes away.
    let ProxyState {
        orchestrator,
        engine,
        ..
    } = state;
    tokio::spawn(async move {
        let mut ctx = RequestContext::new(info);
        engine.run(orchestrator.as_ref(), &mut ctx, &mut sink).await;
    });

    match head.await {
        Ok(head) => {
            let mut response = Response::new(body);
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            response
        }
        Err(_) => {
            error!("engine finished without sending a response");
            HttpError::new(
                "infra::http::proxy",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                "engine finished without sending a response",
            )
            .into_response()
        }
    }
}
