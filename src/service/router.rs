//! Method + path dispatch for the JSON HTTP apps.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use http::{header, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::protocols::http::ServerSession;

use crate::{
    core::{CoreError, CoreResult},
    utils::response::ResponseBuilder,
};

pub type Params = BTreeMap<String, String>;

#[async_trait]
pub trait Handler<S>: Send + Sync {
    async fn handle(
        &self,
        state: &S,
        session: &mut ServerSession,
        params: Params,
    ) -> CoreResult<Response<Vec<u8>>>;
}

pub struct HttpRouter<S> {
    router: Router<HashMap<Method, Box<dyn Handler<S>>>>,
}

impl<S: Send + Sync> HttpRouter<S> {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
        }
    }

    /// Register `handler` for `method` on `path`.
    pub fn route(&mut self, path: &str, method: Method, handler: Box<dyn Handler<S>>) -> &mut Self {
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                if let Err(e) = self.router.insert(path, handlers) {
                    log::error!("Failed to register route '{path}': {e}");
                }
            }
        }
        self
    }

    pub async fn dispatch(&self, state: &S, session: &mut ServerSession) -> Response<Vec<u8>> {
        let (path, method) = {
            let req_header = session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let params: Params = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    match handler.handle(state, session, params).await {
                        Ok(resp) => resp,
                        Err(e) => {
                            log::debug!("{method} {path} failed: {e}");
                            ResponseBuilder::error_json(&e)
                        }
                    }
                }
                None => ResponseBuilder::error_http(StatusCode::METHOD_NOT_ALLOWED, ""),
            },
            Err(_) => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

impl<S: Send + Sync> Default for HttpRouter<S> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn param<'a>(params: &'a Params, name: &str) -> CoreResult<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| CoreError::Internal(format!("missing path parameter '{name}'")))
}

pub fn validate_content_type(session: &ServerSession) -> CoreResult<()> {
    match session.get_header(header::CONTENT_TYPE) {
        Some(content_type)
            if content_type
                .to_str()
                .is_ok_and(|ct| ct.starts_with("application/json")) =>
        {
            Ok(())
        }
        _ => Err(CoreError::InvalidInstance(
            "Content-Type must be application/json".to_string(),
        )),
    }
}

pub async fn read_request_body(session: &mut ServerSession) -> CoreResult<Vec<u8>> {
    let mut body_data = Vec::new();
    while let Some(bytes) = session
        .read_request_body()
        .await
        .map_err(|e| CoreError::Internal(format!("reading request body: {e}")))?
    {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}

/// First value of a query parameter of the current request.
pub fn query_param(session: &ServerSession, name: &str) -> Option<String> {
    session
        .req_header()
        .uri
        .query()
        .and_then(|q| crate::utils::request::query_value(q, name))
        .map(str::to_string)
}
