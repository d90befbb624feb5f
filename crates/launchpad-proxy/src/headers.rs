//! Routing headers set by a scaled-to-zero virtual service.

use http::HeaderMap;
use thiserror::Error;

use launchpad_core::{
    ServiceKey, HEADER_ENV, HEADER_HOST, HEADER_PORT, HEADER_PREFIX, HEADER_PROJECT,
    HEADER_SERVICE, HEADER_VERSION,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("missing routing header {0}")]
    Missing(&'static str),

    #[error("invalid routing header {header}: {value:?}")]
    Invalid { header: &'static str, value: String },
}

/// Original destination of a request that reached the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeaders {
    pub project: String,
    pub service: String,
    pub environment: Option<String>,
    pub version: String,
    pub host: String,
    pub port: u16,
}

impl RoutingHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, RoutingError> {
        let project = required(headers, HEADER_PROJECT)?;
        let service = required(headers, HEADER_SERVICE)?;
        let host = required(headers, HEADER_HOST)?;
        let raw_port = required(headers, HEADER_PORT)?;
        let port = raw_port.parse().map_err(|_| RoutingError::Invalid {
            header: HEADER_PORT,
            value: raw_port.clone(),
        })?;

        Ok(Self {
            project,
            service,
            environment: optional(headers, HEADER_ENV)?,
            version: optional(headers, HEADER_VERSION)?.unwrap_or_default(),
            host,
            port,
        })
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.project, &self.service, &self.version)
    }

    /// Key under which cold starts of this service are debounced.
    pub fn debounce_key(&self) -> String {
        format!("proxy-{}-{}", self.project, self.service)
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remove every routing header.
pub fn strip(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(HEADER_PREFIX))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

fn optional(headers: &HeaderMap, name: &'static str) -> Result<Option<String>, RoutingError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().map_err(|_| RoutingError::Invalid {
                header: name,
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            })?;
            Ok(Some(value.trim().to_string()).filter(|v| !v.is_empty()))
        }
    }
}

fn required(headers: &HeaderMap, name: &'static str) -> Result<String, RoutingError> {
    optional(headers, name)?.ok_or(RoutingError::Missing(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_PROJECT, HeaderValue::from_static("shop"));
        headers.insert(HEADER_SERVICE, HeaderValue::from_static("api"));
        headers.insert(HEADER_HOST, HeaderValue::from_static("api.shop.svc.cluster.local"));
        headers.insert(HEADER_PORT, HeaderValue::from_static("8080"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers
    }

    #[test]
    fn parses_and_defaults_version() {
        let routing = RoutingHeaders::from_headers(&headers()).unwrap();
        assert_eq!(routing.key(), ServiceKey::new("shop", "api", "v1"));
        assert_eq!(routing.environment, None);
        assert_eq!(routing.debounce_key(), "proxy-shop-api");
        assert_eq!(routing.authority(), "api.shop.svc.cluster.local:8080");
    }

    #[test]
    fn optional_headers_are_read() {
        let mut headers = headers();
        headers.insert(HEADER_ENV, HeaderValue::from_static("staging"));
        headers.insert(HEADER_VERSION, HeaderValue::from_static("v2"));
        let routing = RoutingHeaders::from_headers(&headers).unwrap();
        assert_eq!(routing.environment.as_deref(), Some("staging"));
        assert_eq!(routing.key().version, "v2");
    }

    #[test]
    fn missing_or_invalid_headers_are_rejected() {
        for name in [HEADER_PROJECT, HEADER_SERVICE, HEADER_HOST, HEADER_PORT] {
            let mut headers = headers();
            headers.remove(name);
            assert_eq!(
                RoutingHeaders::from_headers(&headers),
                Err(RoutingError::Missing(name))
            );
        }

        let mut headers = headers();
        headers.insert(HEADER_PORT, HeaderValue::from_static("http"));
        assert!(matches!(
            RoutingHeaders::from_headers(&headers),
            Err(RoutingError::Invalid { header: HEADER_PORT, .. })
        ));
    }

    #[test]
    fn strip_removes_only_routing_headers() {
        let mut headers = headers();
        headers.insert(HEADER_ENV, HeaderValue::from_static("staging"));
        strip(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }
}
