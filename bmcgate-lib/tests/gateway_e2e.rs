use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use bmcgate_lib::auth::pam::StaticCredentials;
use bmcgate_lib::http::request::Request;
use bmcgate_lib::router::UpgradeHandler;
use bmcgate_lib::{Acceptor, AppRouter, Config, SessionStore, SessionType, WebRoutes};

struct Gateway {
    addr: SocketAddr,
    store: Arc<SessionStore>,
    task: tokio::task::JoinHandle<()>,
}

impl Gateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a plain-HTTP gateway on an ephemeral port with one local
/// account (root / 0penBmc).
async fn spawn_gateway(webroutes: Vec<String>) -> Gateway {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.tls.enabled = false;
    config.webroutes = webroutes.clone();
    let config = Arc::new(config);

    let store = Arc::new(SessionStore::new());
    let verifier = Arc::new(StaticCredentials::new(HashMap::from([(
        "root".to_owned(),
        "0penBmc".to_owned(),
    )])));

    let mut routes = WebRoutes::new();
    for route in webroutes {
        routes.insert(route);
    }
    let router = Arc::new(
        AppRouter::new(Arc::clone(&store), verifier.clone()).with_webroutes(routes),
    );

    let acceptor = Acceptor::new(config, Arc::clone(&store), router, verifier);
    let task = tokio::spawn(async move {
        if let Err(e) = acceptor.run_with_listener(listener).await {
            panic!("gateway exited: {e}");
        }
    });

    // wait for the accept loop to come up
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    Gateway { addr, store, task }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn login_returns_token_and_cookies() {
    let gw = spawn_gateway(vec![]).await;
    let res = client()
        .post(gw.url("/login"))
        .body(r#"{"username":"root","password":"0penBmc"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let cookies: Vec<String> = res
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_owned())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies[0].starts_with("XSRF-TOKEN="));
    assert!(cookies[1].starts_with("BMCWEB-SESSION="));

    let body: serde_json::Value = res.json().await.unwrap();
    let token = body["token"].as_str().unwrap();
    assert_eq!(token.len(), 20);
    assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

    // the BMCWEB-SESSION cookie value equals the token in the body
    let session_cookie = cookies[1]
        .strip_prefix("BMCWEB-SESSION=")
        .unwrap()
        .split(';')
        .next()
        .unwrap();
    assert_eq!(session_cookie, token);
}

#[tokio::test(flavor = "multi_thread")]
async fn login_rejects_bad_credentials_and_bad_json() {
    let gw = spawn_gateway(vec![]).await;
    let res = client()
        .post(gw.url("/login"))
        .body(r#"{"username":"root","password":"nope"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client()
        .post(gw.url("/login"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn cookie_sessions_enforce_csrf_on_unsafe_methods() {
    let gw = spawn_gateway(vec![]).await;
    let res = client()
        .post(gw.url("/login"))
        .body(r#"{"username":"root","password":"0penBmc"}"#)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    let token = body["token"].as_str().unwrap().to_owned();
    let csrf = gw
        .store
        .login_by_token(&token)
        .expect("session must be live")
        .csrf_token;

    // cookie without the CSRF header: rejected by the gateway
    let res = client()
        .post(gw.url("/redfish/v1/SomeResource"))
        .header("Cookie", format!("SESSION={token}"))
        .header("User-Agent", "Mozilla/5.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // with the CSRF header the request reaches the router (which has
    // no such resource)
    let res = client()
        .post(gw.url("/redfish/v1/SomeResource"))
        .header("Cookie", format!("SESSION={token}"))
        .header("X-XSRF-TOKEN", &csrf)
        .header("User-Agent", "Mozilla/5.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn allowlisted_paths_reach_router_anonymously() {
    let gw = spawn_gateway(vec![]).await;
    for path in ["/redfish", "/redfish/v1", "/redfish/v1/", "/redfish/v1/odata"] {
        let res = client().get(gw.url(path)).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK, "GET {path}");
    }
    let body: serde_json::Value = client()
        .get(gw.url("/redfish/v1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["Id"], "RootService");
}

#[tokio::test(flavor = "multi_thread")]
async fn xtoken_header_authenticates() {
    let gw = spawn_gateway(vec![]).await;
    let session = gw
        .store
        .generate(
            "root",
            &"127.0.0.1".parse().unwrap(),
            None,
            bmcgate_lib::SessionType::Session,
            false,
        )
        .unwrap();

    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .header("X-Auth-Token", &session.session_token)
        .send()
        .await
        .unwrap();
    // authenticated; the built-in router has no such resource
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .header("X-Auth-Token", "00000000000000000000")
        .header("User-Agent", "test-agent")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_response_varies_by_client() {
    let gw = spawn_gateway(vec![]).await;

    // script without a User-Agent: offered Basic
    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .header("Accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers().get("www-authenticate").unwrap(), "Basic");

    // script with a User-Agent: no Basic hint
    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .header("Accept", "application/json")
        .header("User-Agent", "curl/8.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().get("www-authenticate").is_none());

    // browser without a web UI installed: plain text 401
    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .header("Accept", "text/html")
        .header("User-Agent", "Mozilla/5.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.text().await.unwrap(), "Unauthorized");
}

#[tokio::test(flavor = "multi_thread")]
async fn browsers_redirect_to_webui_login_when_installed() {
    let gw = spawn_gateway(vec!["/index.html".to_owned()]).await;
    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .header("Accept", "text/html")
        .header("User-Agent", "Mozilla/5.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        res.headers().get("location").unwrap(),
        "/#/login?next=%2Fredfish%2Fv1%2FSystems"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn security_headers_are_on_every_response() {
    let gw = spawn_gateway(vec![]).await;
    let res = client().get(gw.url("/redfish/v1")).send().await.unwrap();
    let headers = res.headers();
    assert_eq!(
        headers.get("strict-transport-security").unwrap(),
        "max-age=31536000; includeSubdomains"
    );
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("cache-control").unwrap(), "no-store, max-age=0");
    assert!(headers.get("content-security-policy").is_some());
    assert!(headers.get("date").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn http11_without_host_is_rejected() {
    let gw = spawn_gateway(vec![]).await;
    let mut stream = tokio::net::TcpStream::connect(gw.addr).await.unwrap();
    stream
        .write_all(b"GET /redfish/v1 HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "expected 400, got: {}",
        response.lines().next().unwrap_or("")
    );
    assert!(response.to_ascii_lowercase().contains("connection: close"));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_anonymous_bodies_close_the_connection() {
    let gw = spawn_gateway(vec![]).await;
    let body = "x".repeat(5000);
    let result = client().post(gw.url("/login")).body(body).send().await;
    assert!(result.is_err(), "connection must be dropped without a response");
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_auth_works_end_to_end() {
    let gw = spawn_gateway(vec![]).await;
    let res = client()
        .get(gw.url("/redfish/v1/Systems"))
        .basic_auth("root", Some("0penBmc"))
        .send()
        .await
        .unwrap();
    // authenticated (404 from the router, not 401 from the gateway)
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // the single-request session did not linger
    assert!(gw.store.get_unique_ids_by_type(bmcgate_lib::SessionType::Basic).is_empty());
}

/// Stand-in for a console handler: announce itself on the handed-off
/// socket, then hang up.
struct ConsoleEcho;

#[async_trait::async_trait]
impl UpgradeHandler for ConsoleEcho {
    async fn run(&self, _req: Request, mut io: hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>) {
        let _ = io.write_all(b"console-attached").await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_upgrade_hands_the_socket_to_the_handler() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.tls.enabled = false;
    let config = Arc::new(config);

    let store = Arc::new(SessionStore::new());
    let verifier = Arc::new(StaticCredentials::new(HashMap::new()));
    let mut router = AppRouter::new(Arc::clone(&store), verifier.clone());
    router.register_upgrade("/console0", Arc::new(ConsoleEcho));
    let router = Arc::new(router);

    let acceptor = Acceptor::new(config, Arc::clone(&store), router, verifier);
    let task = tokio::spawn(async move {
        let _ = acceptor.run_with_listener(listener).await;
    });

    let session = store
        .generate("root", &"127.0.0.1".parse().unwrap(), None, SessionType::Session, false)
        .unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /console0 HTTP/1.1\r\nHost: bmc\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nX-Auth-Token: {}\r\n\r\n",
        session.session_token
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // 101 from the gateway, then bytes written by the handler that now
    // owns the socket; EOF when the handler drops it
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(
        response.starts_with("HTTP/1.1 101"),
        "expected 101, got: {}",
        response.lines().next().unwrap_or("")
    );
    assert!(response.ends_with("console-attached"));

    task.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_invalidates_the_session() {
    let gw = spawn_gateway(vec![]).await;
    let res = client()
        .post(gw.url("/login"))
        .body(r#"{"username":"root","password":"0penBmc"}"#)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    let token = body["token"].as_str().unwrap().to_owned();

    let res = client()
        .post(gw.url("/logout"))
        .header("X-Auth-Token", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cookie = res.headers().get("set-cookie").unwrap().to_str().unwrap();
    assert!(cookie.contains("expires=Thu, 01 Jan 1970"));

    assert!(gw.store.login_by_token(&token).is_none());
}
