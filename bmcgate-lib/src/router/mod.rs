pub mod login;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde_json::json;

use crate::auth::pam::CredentialVerifier;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::session::SessionStore;

/// Statically registered web-asset routes.  Consulted by the
/// authentication allowlist and by the unauthorized responder to
/// decide whether a login page exists to redirect to.
#[derive(Debug, Default, Clone)]
pub struct WebRoutes {
    routes: BTreeSet<String>,
}

impl WebRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, route: impl Into<String>) {
        self.routes.insert(route.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Receiver for a connection handed off by a WebSocket upgrade (KVM,
/// host serial, ...).  The concrete handlers are external
/// collaborators.
#[async_trait]
pub trait UpgradeHandler: Send + Sync {
    async fn run(&self, req: Request, io: TokioIo<Upgraded>);
}

/// Dispatch seam between the connection runtime and the resource
/// handlers.  The gateway only needs routing, the web-asset route set,
/// and the upgrade handoff; everything behind those is collaborator
/// machinery.
#[async_trait]
pub trait Router: Send + Sync {
    async fn handle(&self, req: Request) -> Response;

    fn webroutes(&self) -> &WebRoutes;

    /// True when a web UI is installed, which changes both the
    /// unauthorized response and whether client certificates are
    /// requested during the handshake.
    fn has_webui(&self) -> bool {
        !self.webroutes().is_empty()
    }

    fn upgrade_handler(&self, _path: &str) -> Option<Arc<dyn UpgradeHandler>> {
        None
    }
}

/// Built-in route table: login endpoints, the anonymous Redfish roots,
/// and any registered upgrade handlers.  The Redfish resource tree
/// proper lives in a collaborator service.
pub struct AppRouter {
    store: Arc<SessionStore>,
    verifier: Arc<dyn CredentialVerifier>,
    webroutes: WebRoutes,
    upgrades: Vec<(String, Arc<dyn UpgradeHandler>)>,
}

impl AppRouter {
    pub fn new(store: Arc<SessionStore>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { store, verifier, webroutes: WebRoutes::new(), upgrades: Vec::new() }
    }

    pub fn with_webroutes(mut self, webroutes: WebRoutes) -> Self {
        self.webroutes = webroutes;
        self
    }

    pub fn register_upgrade(&mut self, path: impl Into<String>, handler: Arc<dyn UpgradeHandler>) {
        self.upgrades.push((path.into(), handler));
    }

    fn service_root() -> Response {
        let mut res = Response::new();
        res.json_value = json!({
            "@odata.id": "/redfish/v1",
            "@odata.type": "#ServiceRoot.v1_15_0.ServiceRoot",
            "Id": "RootService",
            "Name": "Root Service",
            "RedfishVersion": "1.17.0",
            "Links": {
                "Sessions": {"@odata.id": "/redfish/v1/SessionService/Sessions"}
            },
            "SessionService": {"@odata.id": "/redfish/v1/SessionService"}
        });
        res
    }

    fn odata() -> Response {
        let mut res = Response::new();
        res.json_value = json!({
            "@odata.context": "/redfish/v1/$metadata",
            "value": [
                {"name": "Service", "kind": "Singleton", "url": "/redfish/v1/"},
                {"name": "Sessions", "kind": "Singleton",
                 "url": "/redfish/v1/SessionService/Sessions"}
            ]
        });
        res
    }

    fn redfish_versions() -> Response {
        let mut res = Response::new();
        res.json_value = json!({"v1": "/redfish/v1/"});
        res
    }
}

#[async_trait]
impl Router for AppRouter {
    async fn handle(&self, req: Request) -> Response {
        match (req.method.as_str(), req.path.as_str()) {
            ("POST", "/login") => login::handle_login(&req, &self.store, &*self.verifier).await,
            ("POST", "/logout") => login::handle_logout(&req, &self.store),
            ("GET", "/redfish" | "/redfish/") => Self::redfish_versions(),
            ("GET", "/redfish/v1" | "/redfish/v1/") => Self::service_root(),
            ("GET", "/redfish/v1/odata" | "/redfish/v1/odata/") => Self::odata(),
            _ => Response::with_status(StatusCode::NOT_FOUND),
        }
    }

    fn webroutes(&self) -> &WebRoutes {
        &self.webroutes
    }

    fn upgrade_handler(&self, path: &str) -> Option<Arc<dyn UpgradeHandler>> {
        self.upgrades
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, h)| Arc::clone(h))
    }
}
