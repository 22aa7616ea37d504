use http::HeaderName;
use once_cell::sync::Lazy;
use pingora_http::RequestHeader;
use pingora_proxy::Session;

use crate::balancer::RequestAttributes;

/// Request attributes read from a request header and the peer address.
///
/// Resolves `arg_<name>` from the query string, `cookie_<name>` from the
/// `Cookie` header, `http_<name>` from the header of that name, plus the
/// `uri` and `remote_addr` variables.
pub struct HttpAttributes<'a> {
    header: &'a RequestHeader,
    remote_addr: Option<String>,
}

impl<'a> HttpAttributes<'a> {
    pub fn new(header: &'a RequestHeader, remote_addr: Option<String>) -> Self {
        Self {
            header,
            remote_addr,
        }
    }
}

impl RequestAttributes for HttpAttributes<'_> {
    fn attribute(&self, name: &str) -> Option<String> {
        if let Some(arg) = name.strip_prefix("arg_") {
            return get_query_value(self.header, arg).map(str::to_string);
        }
        if let Some(cookie) = name.strip_prefix("cookie_") {
            return get_cookie_value(self.header, cookie).map(str::to_string);
        }
        if let Some(header) = name.strip_prefix("http_") {
            return get_req_header_value(self.header, &header.replace('_', "-"))
                .map(str::to_string);
        }

        match name {
            "uri" => Some(self.header.uri.path().to_string()),
            "remote_addr" => self.remote_addr.clone(),
            _ => {
                log::debug!("Unsupported request attribute: {name}");
                None
            }
        }
    }
}

/// Extracts the value of a specific query parameter from the request URI.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(req_header: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req_header.uri.query().and_then(|query| query_value(query, name))
}

/// First value of `name` in a raw query string.
pub fn query_value<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| match pair.split_once('=') {
        Some((k, v)) if k == name => Some(v.trim()),
        None if pair == name => Some(""),
        _ => None,
    })
}

/// Retrieves the value of a specific header from the request.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
}

/// Retrieves the value of a specific cookie from the `Cookie` header.
///
/// Simple `key=value` pairs only; values are not decoded.
pub fn get_cookie_value<'a>(req_header: &'a RequestHeader, cookie_name: &str) -> Option<&'a str> {
    let Some(cookie_header_value) = get_req_header_value(req_header, "Cookie") else {
        log::debug!("No Cookie header found");
        return None;
    };

    for item in cookie_header_value.split(';') {
        if let Some((k, v)) = item.trim().split_once('=') {
            if k.trim() == cookie_name {
                return Some(v.trim());
            }
        }
    }
    log::debug!("Cookie '{cookie_name}' not found within Cookie header");
    None
}

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

/// Client IP taken from `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
pub fn get_client_ip(header: &RequestHeader, peer: Option<String>) -> Option<String> {
    if let Some(value) = header.headers.get(&*HTTP_HEADER_X_FORWARDED_FOR) {
        if let Ok(forwarded) = value.to_str() {
            if let Some(ip) = forwarded.split(',').next() {
                let trimmed_ip = ip.trim();
                if !trimmed_ip.is_empty() {
                    return Some(trimmed_ip.to_string());
                }
            }
        }
    }

    if let Some(value) = header.headers.get(&*HTTP_HEADER_X_REAL_IP) {
        if let Ok(real_ip) = value.to_str() {
            let trimmed_ip = real_ip.trim();
            if !trimmed_ip.is_empty() {
                return Some(trimmed_ip.to_string());
            }
        }
    }

    peer
}

/// Client IP of a proxied session.
pub fn session_client_ip(session: &Session) -> Option<String> {
    let peer = session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|addr| addr.ip().to_string());
    get_client_ip(session.req_header(), peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(uri: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", uri.as_bytes(), None).unwrap();
        for (k, v) in headers {
            req.insert_header(k.to_string(), v.to_string()).unwrap();
        }
        req
    }

    #[test]
    fn test_attributes() {
        let req = header(
            "/registry/demo-app/cart?user=alice&debug",
            &[("Cookie", "theme=dark; session=s-42"), ("X-Tenant", "acme")],
        );
        let attrs = HttpAttributes::new(&req, Some("10.1.1.1".to_string()));

        assert_eq!(attrs.attribute("arg_user").as_deref(), Some("alice"));
        assert_eq!(attrs.attribute("arg_debug").as_deref(), Some(""));
        assert_eq!(attrs.attribute("arg_missing"), None);
        assert_eq!(attrs.attribute("cookie_session").as_deref(), Some("s-42"));
        assert_eq!(attrs.attribute("http_x_tenant").as_deref(), Some("acme"));
        assert_eq!(attrs.attribute("http_x-tenant").as_deref(), Some("acme"));
        assert_eq!(
            attrs.attribute("uri").as_deref(),
            Some("/registry/demo-app/cart")
        );
        assert_eq!(attrs.attribute("remote_addr").as_deref(), Some("10.1.1.1"));
        assert_eq!(attrs.attribute("server_name"), None);
    }

    #[test]
    fn test_client_ip_precedence() {
        let req = header("/", &[("X-Forwarded-For", "1.1.1.1, 2.2.2.2"), ("X-Real-IP", "3.3.3.3")]);
        assert_eq!(
            get_client_ip(&req, Some("4.4.4.4".into())).as_deref(),
            Some("1.1.1.1")
        );

        let req = header("/", &[("X-Real-IP", "3.3.3.3")]);
        assert_eq!(get_client_ip(&req, None).as_deref(), Some("3.3.3.3"));

        let req = header("/", &[]);
        assert_eq!(
            get_client_ip(&req, Some("4.4.4.4".into())).as_deref(),
            Some("4.4.4.4")
        );
    }

    #[test]
    fn test_query_value() {
        assert_eq!(query_value("window=300&healthy=true", "healthy"), Some("true"));
        assert_eq!(query_value("window=300", "healthy"), None);
    }
}
