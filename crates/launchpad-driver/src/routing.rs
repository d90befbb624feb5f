//! Virtual service rewrites for scale-to-zero.
//!
//! While a service has no replicas its HTTP routes point at the cold-start
//! proxy. The original destination is carried in `x-og-*` request headers
//! so that the proxy can forward to it and so that the route can be
//! restored once the service is warm again.

use launchpad_core::{
    ServiceKey, HEADER_ENV, HEADER_HOST, HEADER_PORT, HEADER_PROJECT, HEADER_SERVICE,
    HEADER_VERSION,
};

use crate::resources::{HeaderOperations, Headers, HttpRouteDestination, PortSelector, VirtualService};

/// Point every route destination at the proxy. Destinations that already
/// target the proxy are left alone.
pub fn make_scale_zero(
    vs: &mut VirtualService,
    key: &ServiceKey,
    env: Option<&str>,
    proxy_host: &str,
    proxy_port: u16,
) {
    for route in vs.spec.http.iter_mut().flat_map(|http| http.route.iter_mut()) {
        if is_redirected(route) || route.destination.host == proxy_host {
            continue;
        }

        let original_port = route
            .destination
            .port
            .map(|p| p.number.to_string())
            .unwrap_or_default();

        let request = route
            .headers
            .get_or_insert_with(Headers::default)
            .request
            .get_or_insert_with(HeaderOperations::default);
        request
            .set
            .insert(HEADER_PROJECT.to_string(), key.project_id.clone());
        request
            .set
            .insert(HEADER_SERVICE.to_string(), key.service_id.clone());
        request
            .set
            .insert(HEADER_VERSION.to_string(), key.version.clone());
        request
            .set
            .insert(HEADER_ENV.to_string(), env.unwrap_or_default().to_string());
        request
            .set
            .insert(HEADER_HOST.to_string(), route.destination.host.clone());
        request.set.insert(HEADER_PORT.to_string(), original_port);

        route.destination.host = proxy_host.to_string();
        route.destination.subset = None;
        route.destination.port = Some(PortSelector {
            number: u32::from(proxy_port),
        });
    }
}

/// Restore every redirected destination from its routing headers.
pub fn make_original(vs: &mut VirtualService) {
    for route in vs.spec.http.iter_mut().flat_map(|http| http.route.iter_mut()) {
        let Some(request) = route.headers.as_mut().and_then(|h| h.request.as_mut()) else {
            continue;
        };
        let Some(host) = request.set.remove(HEADER_HOST) else {
            continue;
        };
        let port = request
            .set
            .remove(HEADER_PORT)
            .and_then(|p| p.parse::<u32>().ok());
        let version = request.set.remove(HEADER_VERSION);
        for header in [HEADER_PROJECT, HEADER_SERVICE, HEADER_ENV] {
            request.set.remove(header);
        }

        route.destination.host = host;
        route.destination.port = port.map(|number| PortSelector { number });
        route.destination.subset = version.filter(|v| !v.is_empty());

        let request_empty =
            request.set.is_empty() && request.remove.is_empty() && request.extra.is_empty();
        if request_empty {
            if let Some(headers) = route.headers.as_mut() {
                headers.request = None;
            }
        }
        if route
            .headers
            .as_ref()
            .is_some_and(|h| h.response.is_none() && h.request.is_none() && h.extra.is_empty())
        {
            route.headers = None;
        }
    }
}

/// Whether any route of the virtual service currently targets the proxy.
pub fn is_scaled_to_zero(vs: &VirtualService) -> bool {
    vs.spec
        .http
        .iter()
        .flat_map(|http| http.route.iter())
        .any(is_redirected)
}

fn is_redirected(route: &HttpRouteDestination) -> bool {
    route
        .headers
        .as_ref()
        .and_then(|h| h.request.as_ref())
        .is_some_and(|r| r.set.contains_key(HEADER_HOST))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::*;

    const PROXY: &str = "runner.launchpad.svc.cluster.local";

    fn vs() -> VirtualService {
        VirtualService::new(
            ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            VirtualServiceSpec {
                hosts: vec!["api.shop.svc.cluster.local".to_string()],
                gateways: vec!["mesh".to_string()],
                http: vec![HttpRoute {
                    name: Some("http-8080".to_string()),
                    matches: vec![HttpMatchRequest {
                        port: Some(8080),
                        ..Default::default()
                    }],
                    route: vec![HttpRouteDestination {
                        destination: Destination {
                            host: "api.shop.svc.cluster.local".to_string(),
                            subset: Some("v1".to_string()),
                            port: Some(PortSelector { number: 8080 }),
                            ..Default::default()
                        },
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn key() -> ServiceKey {
        ServiceKey::new("shop", "api", "v1")
    }

    #[test]
    fn scale_zero_redirects_to_proxy() {
        let mut vs = vs();
        make_scale_zero(&mut vs, &key(), Some("production"), PROXY, 4055);

        let route = &vs.spec.http[0].route[0];
        assert_eq!(route.destination.host, PROXY);
        assert_eq!(route.destination.port, Some(PortSelector { number: 4055 }));
        assert!(route.destination.subset.is_none());

        let set = &route.headers.as_ref().unwrap().request.as_ref().unwrap().set;
        assert_eq!(set[HEADER_PROJECT], "shop");
        assert_eq!(set[HEADER_SERVICE], "api");
        assert_eq!(set[HEADER_ENV], "production");
        assert_eq!(set[HEADER_VERSION], "v1");
        assert_eq!(set[HEADER_HOST], "api.shop.svc.cluster.local");
        assert_eq!(set[HEADER_PORT], "8080");
        assert!(is_scaled_to_zero(&vs));
    }

    #[test]
    fn scale_zero_is_idempotent() {
        let mut once = vs();
        make_scale_zero(&mut once, &key(), None, PROXY, 4055);
        let mut twice = once.clone();
        make_scale_zero(&mut twice, &key(), None, PROXY, 4055);
        assert_eq!(once, twice);
    }

    #[test]
    fn original_restores_route() {
        let original = vs();
        let mut rewritten = original.clone();
        make_scale_zero(&mut rewritten, &key(), None, PROXY, 4055);
        make_original(&mut rewritten);
        assert_eq!(rewritten, original);
        assert!(!is_scaled_to_zero(&rewritten));

        // Reverting an already original route changes nothing.
        make_original(&mut rewritten);
        assert_eq!(rewritten, original);
    }

    #[test]
    fn original_keeps_unrelated_headers() {
        let mut vs = vs();
        let mut set = std::collections::BTreeMap::new();
        set.insert("x-team".to_string(), "checkout".to_string());
        vs.spec.http[0].route[0].headers = Some(Headers {
            request: Some(HeaderOperations {
                set,
                ..Default::default()
            }),
            ..Default::default()
        });
        let before = vs.clone();

        make_scale_zero(&mut vs, &key(), None, PROXY, 4055);
        make_original(&mut vs);
        assert_eq!(vs, before);
    }

    #[test]
    fn redirect_keeps_fields_set_by_operators() {
        let live = serde_json::json!({
            "apiVersion": "networking.istio.io/v1beta1",
            "kind": "VirtualService",
            "metadata": {"name": "api", "namespace": "shop"},
            "spec": {
                "hosts": ["api.shop.svc.cluster.local"],
                "exportTo": ["."],
                "http": [{
                    "name": "http-8080",
                    "match": [{"port": 8080, "uri": {"prefix": "/orders"}}],
                    "timeout": "5s",
                    "retries": {"attempts": 3, "perTryTimeout": "2s"},
                    "route": [{
                        "destination": {"host": "api.shop.svc.cluster.local", "subset": "v1", "port": {"number": 8080}},
                        "headers": {"request": {"add": {"x-team": "checkout"}}}
                    }]
                }]
            }
        });
        let mut vs: VirtualService = serde_json::from_value(live.clone()).unwrap();

        make_scale_zero(&mut vs, &key(), None, PROXY, 4055);
        let redirected = serde_json::to_value(&vs).unwrap();
        assert_eq!(redirected["spec"]["exportTo"], live["spec"]["exportTo"]);
        assert_eq!(redirected["spec"]["http"][0]["retries"]["attempts"], 3);
        assert_eq!(redirected["spec"]["http"][0]["timeout"], "5s");
        assert_eq!(redirected["spec"]["http"][0]["match"][0]["uri"]["prefix"], "/orders");
        assert_eq!(
            redirected["spec"]["http"][0]["route"][0]["headers"]["request"]["add"]["x-team"],
            "checkout"
        );

        make_original(&mut vs);
        assert_eq!(serde_json::to_value(&vs).unwrap(), live);
    }
}
