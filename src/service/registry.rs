use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use http::{Method, Response};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    core::{CoreError, CoreResult},
    registry::{InstanceSpec, InstanceStatus, InstanceStore, SnapshotFilter},
    utils::response::ResponseBuilder,
};

use super::router::{
    param, query_param, read_request_body, validate_content_type, Handler, HttpRouter, Params,
};

/// Service Registry HTTP API, used by instance owners to register and
/// heartbeat, and by operators to inspect the records.
pub struct RegistryHttpApp {
    store: Arc<InstanceStore>,
    router: HttpRouter<Arc<InstanceStore>>,
}

impl RegistryHttpApp {
    pub fn new(store: Arc<InstanceStore>) -> Self {
        let mut router = HttpRouter::new();
        router
            .route("/registry/endpoints", Method::POST, Box::new(RegisterHandler))
            .route("/registry/endpoints", Method::GET, Box::new(ListHandler))
            .route(
                "/registry/endpoints/{id}/heartbeat",
                Method::POST,
                Box::new(HeartbeatHandler),
            )
            .route("/registry/endpoints/{id}", Method::DELETE, Box::new(DeleteHandler))
            .route(
                "/registry/images/{image}/endpoints",
                Method::GET,
                Box::new(ImageEndpointsHandler),
            )
            .route("/registry/services", Method::GET, Box::new(ServicesHandler))
            .route("/health", Method::GET, Box::new(HealthHandler));

        Self { store, router }
    }

    pub fn registry_http_service(store: Arc<InstanceStore>, address: &SocketAddr) -> Service<Self> {
        let app = Self::new(store);
        let mut service = Service::new("Registry HTTP".to_string(), app);
        service.add_tcp(&address.to_string());
        service
    }
}

#[async_trait]
impl ServeHttp for RegistryHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        self.router.dispatch(&self.store, http_session).await
    }
}

struct RegisterHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for RegisterHandler {
    async fn handle(
        &self,
        store: &Arc<InstanceStore>,
        session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        validate_content_type(session)?;
        let body = read_request_body(session).await?;
        let spec: InstanceSpec = serde_json::from_slice(&body)
            .map_err(|e| CoreError::InvalidInstance(format!("malformed instance: {e}")))?;
        let record = store.register(spec)?;
        Ok(ResponseBuilder::success_json(&record))
    }
}

struct HeartbeatHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for HeartbeatHandler {
    async fn handle(
        &self,
        store: &Arc<InstanceStore>,
        _session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let record = store.heartbeat(param(&params, "id")?)?;
        Ok(ResponseBuilder::success_json(&record))
    }
}

#[derive(Serialize)]
struct Deleted {
    deleted: bool,
}

struct DeleteHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for DeleteHandler {
    async fn handle(
        &self,
        store: &Arc<InstanceStore>,
        _session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let deleted = store.delete(param(&params, "id")?);
        Ok(ResponseBuilder::success_json(&Deleted { deleted }))
    }
}

struct ImageEndpointsHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for ImageEndpointsHandler {
    async fn handle(
        &self,
        store: &Arc<InstanceStore>,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let filter = SnapshotFilter {
            name: None,
            image: Some(param(&params, "image")?.to_string()),
            status: healthy_filter(query_param(session, "healthy").as_deref())?,
        };
        Ok(ResponseBuilder::success_json(&store.snapshot(&filter)))
    }
}

struct ListHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for ListHandler {
    async fn handle(
        &self,
        store: &Arc<InstanceStore>,
        session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        let status = match query_param(session, "status") {
            Some(s) => Some(s.parse::<InstanceStatus>().map_err(CoreError::InvalidInstance)?),
            None => None,
        };
        let filter = SnapshotFilter {
            name: query_param(session, "name"),
            image: query_param(session, "image"),
            status,
        };
        Ok(ResponseBuilder::success_json(&store.snapshot(&filter)))
    }
}

struct ServicesHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for ServicesHandler {
    async fn handle(
        &self,
        store: &Arc<InstanceStore>,
        _session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        Ok(ResponseBuilder::success_json(&store.services_map()))
    }
}

struct HealthHandler;

#[async_trait]
impl Handler<Arc<InstanceStore>> for HealthHandler {
    async fn handle(
        &self,
        _store: &Arc<InstanceStore>,
        _session: &mut ServerSession,
        _params: Params,
    ) -> CoreResult<Response<Vec<u8>>> {
        Ok(ResponseBuilder::success_json(&serde_json::json!({"status": "ok"})))
    }
}

/// `?healthy=true|false` to a status filter; absent means every status.
fn healthy_filter(value: Option<&str>) -> CoreResult<Option<InstanceStatus>> {
    match value {
        None => Ok(None),
        Some("true") | Some("1") => Ok(Some(InstanceStatus::Healthy)),
        Some("false") | Some("0") => Ok(Some(InstanceStatus::Expired)),
        Some(other) => Err(CoreError::InvalidInstance(format!(
            "healthy must be true or false, got '{other}'"
        ))),
    }
}
