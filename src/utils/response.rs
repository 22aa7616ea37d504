//! Response helpers shared by the HTTP adapters and the proxy edge.

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

use crate::core::CoreError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: &'a str,
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Fallback used when `http` refuses to assemble a response.
    fn internal_error() -> Response<Vec<u8>> {
        let mut resp = Response::new(b"Internal Server Error".to_vec());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    }

    pub fn with_status(
        status: StatusCode,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Response<Vec<u8>> {
        let content_type = content_type.and_then(|ct| {
            HeaderValue::from_str(ct)
                .map_err(|e| log::error!("Dropping invalid content type '{ct}': {e}"))
                .ok()
        });

        let mut builder = Response::builder().status(status);
        if let Some(value) = content_type {
            builder = builder.header(header::CONTENT_TYPE, value);
        }
        builder.body(body).unwrap_or_else(|e| {
            log::error!("Response for status {status} could not be built: {e}");
            Self::internal_error()
        })
    }

    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Self::with_status(
            status,
            message.as_bytes().to_vec(),
            Some(content_type::TEXT_PLAIN),
        )
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        serde_json::to_vec(data).map_or_else(
            |e| {
                log::error!("JSON body for status {status} failed to serialize: {e}");
                Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "JSON serialization failed")
            },
            |body| Self::with_status(status, body, Some(content_type::APPLICATION_JSON)),
        )
    }

    /// `{"error": code, "detail": msg}` with the status mapped from the error.
    pub fn error_json(err: &CoreError) -> Response<Vec<u8>> {
        Self::json(
            err.status(),
            &ErrorBody {
                error: err.code(),
                detail: err.detail(),
            },
        )
    }

    pub fn redirect(location: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, location)
            .header(header::CONTENT_LENGTH, "0")
            .body(Vec::new())
            .unwrap_or_else(|e| {
                log::error!("Redirect to '{location}' could not be built: {e}");
                Self::internal_error()
            })
    }

    /// Answer a proxied request directly with a JSON error body.
    pub async fn send_proxy_error(session: &mut Session, err: &CoreError) -> Result<()> {
        let body = serde_json::to_vec(&ErrorBody {
            error: err.code(),
            detail: err.detail(),
        })
        .unwrap_or_default();

        let mut resp = ResponseHeader::build(err.status(), None)?;
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
        resp.insert_header(header::CONTENT_TYPE, content_type::APPLICATION_JSON)?;
        session.write_response_header(Box::new(resp), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(())
    }
}
