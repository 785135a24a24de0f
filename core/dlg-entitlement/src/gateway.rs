//! Remote entitlement gateway.
//!
//! The gateway sends `{action, api_key, ...payload}` to the single remote
//! endpoint and hands back the decoded JSON object. It never retries and
//! never interprets the body; that is the job of [`crate::response`].

use crate::error::TransportError;
use serde_json::{Map, Value};

/// Remote actions understood by the entitlement endpoint.
pub mod actions {
    pub const LOGIN: &str = "login";
    pub const FULL_LOGIN_CHECK: &str = "full_login_check";
    pub const VERIFY_SESSION: &str = "verify_session";
    pub const LOGOUT: &str = "logout";
    pub const CHECK_LICENSE: &str = "check_license";
    pub const REGISTER_TRIAL: &str = "register_trial";
    pub const CHECK_TRIAL: &str = "check_trial";
    pub const GET_RECAPTCHA_SETTINGS: &str = "get_recaptcha_settings";
}

/// A decoded response from the remote service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteResponse {
    /// HTTP status, when the transport has one.
    pub status: Option<u16>,
    /// The JSON object returned by the server.
    pub body: Map<String, Value>,
}

impl RemoteResponse {
    /// Wraps a body without a status code.
    #[must_use]
    pub fn new(body: Map<String, Value>) -> Self {
        Self { status: None, body }
    }

    /// Builds a response from a JSON value; non-objects become an empty body.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(body) => Self::new(body),
            _ => Self::default(),
        }
    }

    /// Attaches an HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Capability to call the remote entitlement service.
pub trait RemoteGateway {
    /// Sends one action and waits (bounded) for the answer.
    fn call(
        &self,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<RemoteResponse, TransportError>;
}

impl<G: RemoteGateway + ?Sized> RemoteGateway for &G {
    fn call(
        &self,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<RemoteResponse, TransportError> {
        (**self).call(action, payload)
    }
}

impl<G: RemoteGateway + ?Sized> RemoteGateway for Box<G> {
    fn call(
        &self,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<RemoteResponse, TransportError> {
        (**self).call(action, payload)
    }
}

/// Builds the request body: the action, the static credential, then the payload.
#[must_use]
pub fn request_body(action: &str, api_key: &str, payload: Map<String, Value>) -> Value {
    let mut body = Map::with_capacity(payload.len() + 2);
    body.insert("action".into(), Value::String(action.to_string()));
    body.insert("api_key".into(), Value::String(api_key.to_string()));
    for (k, v) in payload {
        if k != "action" && k != "api_key" {
            body.insert(k, v);
        }
    }
    Value::Object(body)
}

/// Decodes a raw response body.
///
/// # Errors
///
/// Returns [`TransportError::Protocol`] if the body is not a JSON object.
pub fn decode_body(status: Option<u16>, bytes: &[u8]) -> Result<RemoteResponse, TransportError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(body)) => Ok(RemoteResponse { status, body }),
        Ok(_) => Err(TransportError::Protocol(
            "response is not a JSON object".to_string(),
        )),
        Err(e) => Err(TransportError::Protocol(format!("malformed response: {e}"))),
    }
}

#[cfg(feature = "online")]
pub use http::HttpGateway;

#[cfg(feature = "online")]
mod http {
    use super::{RemoteGateway, RemoteResponse, decode_body, request_body};
    use crate::config::ClientConfig;
    use crate::error::{EntitlementError, EntitlementResult, TransportError};
    use serde_json::{Map, Value};
    use std::error::Error as _;
    use tracing::debug;

    /// Gateway over HTTPS using a blocking client.
    pub struct HttpGateway {
        client: reqwest::blocking::Client,
        api_url: String,
        api_key: String,
    }

    impl HttpGateway {
        /// Creates a gateway from the client configuration.
        ///
        /// # Errors
        ///
        /// Returns an error if the HTTP client cannot be built.
        pub fn new(config: &ClientConfig) -> EntitlementResult<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(config.timeout())
                .user_agent(format!("{}/{}", config.app_name, env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| EntitlementError::Config(format!("http client: {e}")))?;

            Ok(Self {
                client,
                api_url: config.api_url.clone(),
                api_key: config.api_key.clone(),
            })
        }
    }

    impl RemoteGateway for HttpGateway {
        fn call(
            &self,
            action: &str,
            payload: Map<String, Value>,
        ) -> Result<RemoteResponse, TransportError> {
            debug!(action = action, "remote call");
            let body = request_body(action, &self.api_key, payload);

            let resp = self
                .client
                .post(&self.api_url)
                .json(&body)
                .send()
                .map_err(classify)?;

            let status = resp.status().as_u16();
            let bytes = resp.bytes().map_err(classify)?;
            decode_body(Some(status), &bytes)
        }
    }

    /// Maps a reqwest failure onto the transport taxonomy.
    fn classify(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            return TransportError::Timeout;
        }

        let mut detail = e.to_string();
        let mut source = e.source();
        while let Some(inner) = source {
            detail.push_str(": ");
            detail.push_str(&inner.to_string());
            source = inner.source();
        }

        let lower = detail.to_ascii_lowercase();
        if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
            TransportError::Protocol(detail)
        } else if e.is_connect() {
            TransportError::Connection(detail)
        } else if e.is_decode() || e.is_body() {
            TransportError::Protocol(detail)
        } else {
            TransportError::Other(detail)
        }
    }
}
