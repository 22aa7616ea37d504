use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use http::{Method, Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    balancer::{Balancer, RouteOutcome},
    core::{CoreError, CoreResult},
    export::BillingExporter,
    policy::RoutingPolicy,
    registry::ServiceInstance,
    stats::StatsSnapshot,
    utils::{
        request::{get_client_ip, HttpAttributes},
        response::ResponseBuilder,
    },
};

use super::router::{param, query_param, read_request_body, Handler, HttpRouter, Params};

/// Shared state of the balancer HTTP API.
pub struct BalancerState {
    pub balancer: Arc<Balancer>,
    pub exporter: Arc<BillingExporter>,
    pub api_key: Option<String>,
}

/// Load balancer front door: redirects `/registry/{image}/...` to a chosen
/// instance and serves the policy, traffic and export APIs.
pub struct BalancerHttpApp {
    state: BalancerState,
    router: HttpRouter<BalancerState>,
}

impl BalancerHttpApp {
    pub fn new(state: BalancerState) -> Self {
        let mut router = HttpRouter::new();
        router
            .route("/registry/{image}", Method::GET, Box::new(RedirectHandler))
            .route("/registry/{image}/{*path}", Method::GET, Box::new(RedirectHandler))
            .route("/preview/{image}", Method::GET, Box::new(PreviewHandler))
            .route("/policies", Method::GET, Box::new(PolicyListHandler))
            .route("/policies/{image}", Method::GET, Box::new(PolicyGetHandler))
            .route("/policies/{image}", Method::PUT, Box::new(PolicyPutHandler))
            .route("/traffic", Method::GET, Box::new(TrafficHandler))
            .route("/traffic/{image}", Method::GET, Box::new(TrafficHandler))
            .route(
                "/traffic/{image}/archive",
                Method::GET,
                Box::new(TrafficArchiveHandler),
            )
            .route("/traffic/{image}/{instance}", Method::GET, Box::new(TrafficHandler))
            .route("/export", Method::GET, Box::new(ExportHandler))
            .route("/readyz", Method::GET, Box::new(ReadyHandler));

        Self { state, router }
    }

    pub fn balancer_http_service(state: BalancerState, address: &SocketAddr) -> Service<Self> {
        let app = Self::new(state);
        let mut service = Service::new("Balancer HTTP".to_string(), app);
        service.add_tcp(&address.to_string());
        service
    }
}

#[async_trait]
impl ServeHttp for BalancerHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        self.router.dispatch(&self.state, http_session).await
    }
}

/// Target of a redirect to `inst`, keeping the remaining path and the query.
pub fn redirect_location(inst: &ServiceInstance, path: Option<&str>, query: Option<&str>) -> String {
    let mut location = format!(
        "http://{}/{}",
        inst.address(),
        path.unwrap_or_default().trim_start_matches('/')
    );
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        location.push('?');
        location.push_str(query);
    }
    location
}

fn route_with<F>(state: &BalancerState, session: &ServerSession, image: &str, f: F) -> CoreResult<RouteOutcome>
where
    F: FnOnce(&Balancer, &str, &HttpAttributes) -> CoreResult<RouteOutcome>,
{
    let header = session.req_header();
    let peer = session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|addr| addr.ip().to_string());
    let attrs = HttpAttributes::new(header, get_client_ip(header, peer));
    f(&state.balancer, image, &attrs)
}

struct RedirectHandler;

#[async_trait]
impl Handler<BalancerState> for RedirectHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let image = param(&params, "image")?;
        let outcome = route_with(state, session, image, |b, image, attrs| b.route(image, attrs))?;
        let decision = outcome.into_result()?;

        let location = redirect_location(
            &decision.instance,
            params.get("path").map(String::as_str),
            session.req_header().uri.query(),
        );
        log::debug!("Redirecting '{image}' request to {location}");
        Ok(ResponseBuilder::redirect(&location))
    }
}

struct PreviewHandler;

#[async_trait]
impl Handler<BalancerState> for PreviewHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let image = param(&params, "image")?;
        let outcome = route_with(state, session, image, |b, image, attrs| {
            b.preview_route(image, attrs)
        })?;
        let status = match outcome {
            RouteOutcome::Routed(_) => StatusCode::OK,
            RouteOutcome::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        Ok(ResponseBuilder::json(status, &outcome))
    }
}

#[derive(Serialize)]
struct PolicyEntry<'a> {
    image: &'a str,
    #[serde(flatten)]
    policy: &'a RoutingPolicy,
}

struct PolicyListHandler;

#[async_trait]
impl Handler<BalancerState> for PolicyListHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        _session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let policies = state.balancer.policies().list();
        let entries: Vec<PolicyEntry> = policies
            .iter()
            .map(|(image, policy)| PolicyEntry {
                image,
                policy: policy.as_ref(),
            })
            .collect();
        Ok(ResponseBuilder::success_json(&entries))
    }
}

struct PolicyGetHandler;

#[async_trait]
impl Handler<BalancerState> for PolicyGetHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        _session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let image = param(&params, "image")?;
        let policy = state.balancer.policies().get(image);
        Ok(ResponseBuilder::success_json(&PolicyEntry {
            image,
            policy: policy.as_ref(),
        }))
    }
}

struct PolicyPutHandler;

#[async_trait]
impl Handler<BalancerState> for PolicyPutHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let image = param(&params, "image")?;
        let authorized = is_authorized(session, state.api_key.as_deref());
        let body = read_request_body(session).await?;
        let policy = RoutingPolicy::from_json(&body)?;
        let stored = state.balancer.policies().set(image, policy, authorized)?;
        Ok(ResponseBuilder::success_json(&PolicyEntry {
            image,
            policy: stored.as_ref(),
        }))
    }
}

/// The credential check stays here; the policy store only sees the outcome.
fn is_authorized(session: &ServerSession, api_key: Option<&str>) -> bool {
    match (api_key, session.get_header("x-api-key")) {
        (Some(expected), Some(provided)) => provided.to_str().is_ok_and(|p| p == expected),
        _ => false,
    }
}

fn window_param(state: &BalancerState, session: &ServerSession) -> CoreResult<u64> {
    let windows = state.balancer.stats().windows();
    match query_param(session, "window") {
        Some(w) => w
            .parse::<u64>()
            .map_err(|_| CoreError::NotFound(format!("window '{w}' is not a number of seconds"))),
        None => windows
            .first()
            .copied()
            .ok_or_else(|| CoreError::NotFound("no stats window configured".to_string())),
    }
}

struct TrafficHandler;

#[async_trait]
impl Handler<BalancerState> for TrafficHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let stats = state.balancer.stats();
        let window = window_param(state, session)?;

        match (params.get("image"), params.get("instance")) {
            (Some(image), Some(instance)) => Ok(ResponseBuilder::success_json(
                &stats.instance_snapshot(image, instance, window)?,
            )),
            (Some(image), None) => {
                Ok(ResponseBuilder::success_json(&stats.snapshot(image, window)?))
            }
            _ => {
                let snapshots: Vec<StatsSnapshot> = stats
                    .images()
                    .iter()
                    .filter_map(|image| stats.snapshot(image, window).ok())
                    .collect();
                Ok(ResponseBuilder::success_json(&snapshots))
            }
        }
    }
}

struct TrafficArchiveHandler;

#[async_trait]
impl Handler<BalancerState> for TrafficArchiveHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let window = window_param(state, session)?;
        let archive = state
            .balancer
            .stats()
            .archive(param(&params, "image")?, window)?;
        Ok(ResponseBuilder::success_json(&archive))
    }
}

struct ExportHandler;

#[async_trait]
impl Handler<BalancerState> for ExportHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        _session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        Ok(ResponseBuilder::success_json(&state.exporter.export()?))
    }
}

struct ReadyHandler;

#[async_trait]
impl Handler<BalancerState> for ReadyHandler {
    async fn handle(
        &self,
        state: &BalancerState,
        _session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        if state.balancer.readiness().is_ready() {
            Ok(ResponseBuilder::success_json(&serde_json::json!({"status": "ok"})))
        } else {
            Err(CoreError::NotReady("stores not initialized".to_string()))
        }
    }
}
