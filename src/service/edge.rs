use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use once_cell::sync::OnceCell;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{
    Error,
    ErrorType::{ConnectNoRoute, HTTPStatus},
    OrErr, Result,
};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::{
    balancer::{Balancer, RouteDecision},
    core::CoreError,
    utils::{
        request::{session_client_ip, HttpAttributes},
        response::ResponseBuilder,
    },
};

const ROUTE_PREFIX: &str = "/registry/";

static RESOLVER: OnceCell<Arc<TokioAsyncResolver>> = OnceCell::new();

fn resolver() -> Arc<TokioAsyncResolver> {
    RESOLVER
        .get_or_init(|| {
            let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                log::warn!("No usable system resolver configuration ({e}), using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            });
            Arc::new(resolver)
        })
        .clone()
}

/// Socket address of a registered instance. IP literals are used as is,
/// hostnames go through the shared async resolver.
pub async fn resolve_instance(host: &str, port: u16) -> Result<SocketAddr> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    log::debug!("Resolving instance host {host}");
    let lookup = resolver()
        .lookup_ip(host)
        .await
        .or_err_with(ConnectNoRoute, || format!("cannot resolve instance host {host}"))?;
    lookup
        .iter()
        .next()
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| {
            Error::explain(
                ConnectNoRoute,
                format!("no address found for instance host {host}"),
            )
        })
}

/// Per-request state of the proxy edge.
#[derive(Default)]
pub struct EdgeContext {
    decision: Option<RouteDecision>,
    upstream_path: String,
    status: u16,
    bytes: u64,
}

/// Transparent proxy edge: `/registry/{image}/{*path}` is proxied to the
/// instance chosen by the balancer, with the `/registry/{image}` prefix removed.
pub struct EdgeProxy {
    balancer: Arc<Balancer>,
}

impl EdgeProxy {
    pub fn new(balancer: Arc<Balancer>) -> Self {
        Self { balancer }
    }
}

/// Splits `/registry/{image}/{rest}?{query}` into the image and the upstream path.
pub fn split_route_path(path: &str, query: Option<&str>) -> Option<(String, String)> {
    let rest = path.strip_prefix(ROUTE_PREFIX)?;
    let (image, tail) = match rest.split_once('/') {
        Some((image, tail)) => (image, tail),
        None => (rest, ""),
    };
    if image.is_empty() {
        return None;
    }

    let mut upstream_path = format!("/{tail}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        upstream_path.push('?');
        upstream_path.push_str(query);
    }
    Some((image.to_string(), upstream_path))
}

#[async_trait]
impl ProxyHttp for EdgeProxy {
    type CTX = EdgeContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let header = session.req_header();
        let Some((image, upstream_path)) = split_route_path(header.uri.path(), header.uri.query())
        else {
            let err = CoreError::NotFound(format!("no route for '{}'", header.uri.path()));
            ResponseBuilder::send_proxy_error(session, &err).await?;
            return Ok(true);
        };

        let attrs = HttpAttributes::new(session.req_header(), session_client_ip(session));
        let routed = self
            .balancer
            .route(&image, &attrs)
            .and_then(|outcome| outcome.into_result());

        match routed {
            Ok(decision) => {
                ctx.decision = Some(decision);
                ctx.upstream_path = upstream_path;
                Ok(false)
            }
            Err(err) => {
                log::debug!("Edge could not route '{image}': {err}");
                ResponseBuilder::send_proxy_error(session, &err).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let decision = ctx.decision.as_ref().ok_or_else(|| {
            Box::<Error>::from(CoreError::Internal("request was not routed".to_string()))
        })?;
        let instance = &decision.instance;
        let address = resolve_instance(&instance.host, instance.port).await?;
        Ok(Box::new(HttpPeer::new(address, false, instance.host.clone())))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let uri = ctx
            .upstream_path
            .parse::<http::Uri>()
            .map_err(|e| Error::because(HTTPStatus(400), "rewriting upstream uri", e))?;
        upstream_request.set_uri(uri);
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.status = upstream_response.status.as_u16();
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        if let Some(bytes) = body {
            ctx.bytes += bytes.len() as u64;
        }
        Ok(None)
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let Some(decision) = ctx.decision.as_ref() else {
            return;
        };
        let status = match (ctx.status, e) {
            (0, Some(_)) => 502,
            (0, None) => 200,
            (status, _) => status,
        };
        self.balancer.complete(decision, status, ctx.bytes);
    }
}
