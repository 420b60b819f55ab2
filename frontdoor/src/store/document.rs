use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CATCHALL_ROUTER: &str = "mongodb-catchall";
pub const CATCHALL_SERVICE: &str = "mongodb-catchall-service";
pub const REDIRECT_MIDDLEWARE: &str = "redirect-to-https";
pub const MONGODB_ENTRYPOINT: &str = "mongodb";
pub const WEB_ENTRYPOINT: &str = "web";
pub const WEBSECURE_ENTRYPOINT: &str = "websecure";
pub const MONGODB_PORT: u16 = 27017;

/// The merged configuration consumed by the proxy. One canonical shape; the
/// store maps whatever it finds on disk onto this.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicDocument {
    #[serde(default)]
    pub http: HttpSection,

    #[serde(default)]
    pub tcp: TcpSection,
}

/// One agent's slice of the routing configuration. Same shape as the merged
/// document; names inside are already namespaced by the agent id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteFragment {
    #[serde(default)]
    pub http: HttpSection,

    #[serde(default)]
    pub tcp: TcpSection,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default)]
    pub routers: BTreeMap<String, HttpRouter>,

    #[serde(default)]
    pub services: BTreeMap<String, HttpService>,

    #[serde(default)]
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpRouter {
    pub rule: String,
    pub service: String,

    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<HttpRouterTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRouterTls {
    #[serde(default, rename = "certResolver", skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpService {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: HttpLoadBalancer,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpLoadBalancer {
    pub servers: Vec<HttpServer>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpServer {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    #[serde(rename_all = "camelCase")]
    Headers { custom_request_headers: BTreeMap<String, String> },

    #[serde(rename_all = "camelCase")]
    RedirectScheme { scheme: String, permanent: bool },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default)]
    pub routers: BTreeMap<String, TcpRouter>,

    #[serde(default)]
    pub services: BTreeMap<String, TcpService>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpRouter {
    pub rule: String,
    pub service: String,

    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TcpRouterTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpRouterTls {
    pub passthrough: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpService {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: TcpLoadBalancer,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpLoadBalancer {
    pub servers: Vec<TcpServer>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpServer {
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("router '{router}' references unknown service '{service}'")]
    MissingService { router: String, service: String },
}

impl DynamicDocument {
    /// The global scaffolding every merged document starts from: the HTTPS
    /// redirect middleware and the wildcard L4 catchall with an empty pool,
    /// so the mongo entrypoint always has a default route.
    pub fn skeleton(mongo_domain: &str) -> Self {
        let mut document = Self::default();
        document.ensure_defaults(mongo_domain);
        document
    }

    /// Synthesize the catchall router/service and the redirect middleware if
    /// a legacy or hand-edited document dropped them.
    pub fn ensure_defaults(&mut self, mongo_domain: &str) {
        self.http.middlewares.entry(REDIRECT_MIDDLEWARE.into()).or_insert(Middleware::RedirectScheme {
            scheme: "https".into(),
            permanent: true,
        });
        self.tcp.routers.entry(CATCHALL_ROUTER.into()).or_insert_with(|| TcpRouter {
            rule: host_sni_rule(&format!("*.{mongo_domain}")),
            service: CATCHALL_SERVICE.into(),
            entry_points: vec![MONGODB_ENTRYPOINT.into()],
            tls: Some(TcpRouterTls { passthrough: true }),
        });
        self.tcp.services.entry(CATCHALL_SERVICE.into()).or_insert_with(|| TcpService {
            load_balancer: TcpLoadBalancer { servers: Vec::new() },
        });
    }

    /// Merge agent fragments over the skeleton. Fragment names are namespaced
    /// by agent id so they cannot collide; whatever does collide resolves
    /// last-writer-wins in iteration order.
    pub fn merged<'a>(mongo_domain: &str, fragments: impl IntoIterator<Item = &'a RouteFragment>) -> Self {
        let mut document = Self::skeleton(mongo_domain);
        for fragment in fragments {
            document.http.routers.extend(fragment.http.routers.clone());
            document.http.services.extend(fragment.http.services.clone());
            document.http.middlewares.extend(fragment.http.middlewares.clone());
            document.tcp.routers.extend(fragment.tcp.routers.clone());
            document.tcp.services.extend(fragment.tcp.services.clone());
        }
        document
    }

    /// Every router must point at a service that exists in the merged view.
    pub fn validate(&self) -> Result<(), DocumentError> {
        for (name, router) in &self.http.routers {
            if !self.http.services.contains_key(&router.service) {
                return Err(DocumentError::MissingService { router: name.clone(), service: router.service.clone() });
            }
        }
        for (name, router) in &self.tcp.routers {
            if !self.tcp.services.contains_key(&router.service) {
                return Err(DocumentError::MissingService { router: name.clone(), service: router.service.clone() });
            }
        }
        Ok(())
    }

    pub fn has_catchall(&self) -> bool {
        self.tcp.routers.contains_key(CATCHALL_ROUTER)
    }
}

impl RouteFragment {
    /// The L4 slice for an agent's MongoDB backend: an SNI router for
    /// `<agent>.<mongo domain>` and a single-server pool.
    pub fn with_mongodb_route(mut self, agent_id: &str, mongo_domain: &str, target_ip: &str, target_port: u16, tls_passthrough: bool) -> Self {
        let router = mongodb_router_name(agent_id);
        let service = mongodb_service_name(agent_id);
        self.tcp.routers.insert(
            router,
            TcpRouter {
                rule: host_sni_rule(&format!("{agent_id}.{mongo_domain}")),
                service: service.clone(),
                entry_points: vec![MONGODB_ENTRYPOINT.into()],
                tls: if tls_passthrough { Some(TcpRouterTls { passthrough: true }) } else { None },
            },
        );
        self.tcp.services.insert(
            service,
            TcpService { load_balancer: TcpLoadBalancer { servers: vec![TcpServer { address: format!("{target_ip}:{target_port}") }] } },
        );
        self
    }

    /// The L7 slice for an HTTP application: a host router on both web
    /// entrypoints, the HTTPS redirect, and a host-rewrite middleware derived
    /// from the target URL.
    pub fn with_app_route(mut self, agent_id: &str, subdomain: &str, app_domain: &str, target_url: &str) -> Self {
        let router = app_router_name(agent_id, subdomain);
        let service = app_service_name(agent_id, subdomain);
        let headers = app_headers_name(agent_id, subdomain);
        self.http.middlewares.insert(
            headers.clone(),
            Middleware::Headers {
                custom_request_headers: BTreeMap::from([("Host".to_string(), host_of(target_url))]),
            },
        );
        self.http.routers.insert(
            router,
            HttpRouter {
                rule: format!("Host(`{subdomain}.{app_domain}`)"),
                service: service.clone(),
                entry_points: vec![WEB_ENTRYPOINT.into(), WEBSECURE_ENTRYPOINT.into()],
                middlewares: vec![REDIRECT_MIDDLEWARE.into(), headers],
                tls: None,
            },
        );
        self.http.services.insert(
            service,
            HttpService { load_balancer: HttpLoadBalancer { servers: vec![HttpServer { url: target_url.into() }] } },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.http.routers.is_empty() && self.tcp.routers.is_empty()
    }
}

pub fn mongodb_router_name(agent_id: &str) -> String {
    format!("{agent_id}-mongodb")
}

pub fn mongodb_service_name(agent_id: &str) -> String {
    format!("{agent_id}-mongodb-service")
}

pub fn app_router_name(agent_id: &str, subdomain: &str) -> String {
    format!("{agent_id}-app-{subdomain}")
}

pub fn app_service_name(agent_id: &str, subdomain: &str) -> String {
    format!("{agent_id}-app-{subdomain}-service")
}

pub fn app_headers_name(agent_id: &str, subdomain: &str) -> String {
    format!("{agent_id}-app-{subdomain}-headers")
}

fn host_sni_rule(host: &str) -> String {
    format!("HostSNI(`{host}`)")
}

/// The authority component of an `http(s)://` URL, port included.
fn host_of(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn skeleton_carries_catchall_and_redirect() {
        let document = DynamicDocument::skeleton("mongodb.example.com");
        let catchall = document.tcp.routers.get(CATCHALL_ROUTER).expect("no catchall");
        assert_eq!(catchall.rule, "HostSNI(`*.mongodb.example.com`)");
        assert_eq!(catchall.service, CATCHALL_SERVICE);
        assert_eq!(catchall.tls, Some(TcpRouterTls { passthrough: true }));
        assert!(document.tcp.services.get(CATCHALL_SERVICE).expect("no catchall service").load_balancer.servers.is_empty());
        assert!(document.http.middlewares.contains_key(REDIRECT_MIDDLEWARE));
        document.validate().expect("skeleton invalid");
    }

    #[test]
    fn skeleton_round_trips_through_yaml() {
        let document = DynamicDocument::skeleton("mongodb.example.com");
        let serialized = serde_yaml::to_string(&document).expect("failed to serialize");
        let parsed: DynamicDocument = serde_yaml::from_str(&serialized).expect("failed to parse");
        assert_eq!(parsed, document);
        assert!(serialized.contains("entryPoints"));
        assert!(serialized.contains("loadBalancer"));
        assert!(serialized.contains("passthrough: true"));
    }

    #[rstest]
    #[case::tls(true)]
    #[case::plaintext(false)]
    fn mongodb_fragment_shape(#[case] passthrough: bool) {
        let fragment =
            RouteFragment::default().with_mongodb_route("alpha-01", "mongodb.example.com", "10.0.0.7", 27017, passthrough);
        let router = fragment.tcp.routers.get("alpha-01-mongodb").expect("no router");
        assert_eq!(router.rule, "HostSNI(`alpha-01.mongodb.example.com`)");
        assert_eq!(router.tls.as_ref().map(|tls| tls.passthrough), passthrough.then_some(true));
        let service = fragment.tcp.services.get("alpha-01-mongodb-service").expect("no service");
        assert_eq!(service.load_balancer.servers, vec![TcpServer { address: "10.0.0.7:27017".into() }]);
    }

    #[test]
    fn app_fragment_rewrites_host() {
        let fragment = RouteFragment::default().with_app_route("beta", "shop", "apps.example.com", "http://10.0.0.9:3000/base");
        let router = fragment.http.routers.get("beta-app-shop").expect("no router");
        assert_eq!(router.rule, "Host(`shop.apps.example.com`)");
        assert_eq!(router.middlewares, vec![REDIRECT_MIDDLEWARE.to_string(), "beta-app-shop-headers".to_string()]);
        let middleware = fragment.http.middlewares.get("beta-app-shop-headers").expect("no middleware");
        let Middleware::Headers { custom_request_headers } = middleware else {
            panic!("wrong middleware kind");
        };
        assert_eq!(custom_request_headers.get("Host").map(String::as_str), Some("10.0.0.9:3000"));
    }

    #[test]
    fn merged_document_keeps_fragments_disjoint() {
        let alpha = RouteFragment::default().with_mongodb_route("alpha", "mongodb.example.com", "10.0.0.7", 27017, true);
        let beta = RouteFragment::default()
            .with_mongodb_route("beta", "mongodb.example.com", "10.0.0.8", 27017, false)
            .with_app_route("beta", "shop", "apps.example.com", "http://10.0.0.8:3000");
        let merged = DynamicDocument::merged("mongodb.example.com", [&alpha, &beta]);

        assert!(merged.has_catchall());
        assert!(merged.tcp.routers.contains_key("alpha-mongodb"));
        assert!(merged.tcp.routers.contains_key("beta-mongodb"));
        assert!(merged.http.routers.contains_key("beta-app-shop"));
        merged.validate().expect("merged document invalid");

        // Names are namespaced: nothing from alpha is shadowed by beta.
        let names: Vec<_> = merged.tcp.routers.keys().collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn validate_rejects_dangling_service() {
        let mut document = DynamicDocument::skeleton("mongodb.example.com");
        document.tcp.routers.insert(
            "broken".into(),
            TcpRouter { rule: "HostSNI(`x`)".into(), service: "missing".into(), entry_points: vec![], tls: None },
        );
        let err = document.validate().expect_err("dangling service accepted");
        assert!(matches!(err, DocumentError::MissingService { ref service, .. } if service == "missing"));
    }

    #[test]
    fn ensure_defaults_restores_dropped_catchall() {
        let mut document = DynamicDocument::skeleton("mongodb.example.com");
        document.tcp.routers.remove(CATCHALL_ROUTER);
        document.http.middlewares.remove(REDIRECT_MIDDLEWARE);
        document.ensure_defaults("mongodb.example.com");
        assert!(document.has_catchall());
        assert!(document.http.middlewares.contains_key(REDIRECT_MIDDLEWARE));
    }

    #[rstest]
    #[case::with_port("http://10.0.0.9:3000/base", "10.0.0.9:3000")]
    #[case::bare("https://app.internal", "app.internal")]
    #[case::trailing_path("http://app.internal/a/b", "app.internal")]
    fn host_extraction(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(host_of(url), expected);
    }
}
