#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod router;
pub mod session;
pub mod tls;
pub mod util;

pub use config::{load_from_path, Config};
pub use error::{GatewayError, Result};
pub use http::server::Acceptor;
pub use router::{AppRouter, Router, WebRoutes};
pub use session::{AuthConfigMethods, SessionStore, SessionType, UserSession};
pub use tls::build_tls_context;
