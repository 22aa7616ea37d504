use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{config::Status, core::Readiness, utils::response::ResponseBuilder};

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

/// Readiness probe listener: `GET /status/ready` answers 200 `{"status": "ok"}`
/// once the stores are built and 503 until then.
pub struct StatusHttpApp {
    readiness: Arc<Readiness>,
}

impl StatusHttpApp {
    pub fn new(readiness: Arc<Readiness>) -> Self {
        Self { readiness }
    }

    pub fn status_http_service(cfg: &Status, readiness: Arc<Readiness>) -> Service<Self> {
        let app = Self::new(readiness);
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(&cfg.address.to_string());
        service
    }

    fn ready_response(&self) -> Response<Vec<u8>> {
        let (code, body) = if self.readiness.is_ready() {
            (
                StatusCode::OK,
                ReadyBody {
                    status: "ok",
                    error: None,
                },
            )
        } else {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                ReadyBody {
                    status: "error",
                    error: Some("registry and policy stores are still initializing"),
                },
            )
        };
        ResponseBuilder::json(code, &body)
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if http_session.req_header().uri.path() == "/status/ready" {
            self.ready_response()
        } else {
            ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found")
        }
    }
}
