//! `reqwest`-backed [`Session`] bound to one catalogue endpoint.

use std::fmt;
use std::sync::LazyLock;

use serde_json::Value;

use super::rest::{Method, RawResponse, Session, SessionFuture};
use super::OpenstackError;

pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);

/// Token-authenticated session against one service endpoint.
#[derive(Clone)]
pub struct HttpSession {
    endpoint: String,
    token: String,
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpSession {
    /// Binds `token` to `endpoint`; trailing slashes are dropped.
    #[must_use]
    pub fn new(endpoint: &str, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    /// Endpoint requests are resolved against.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Session for HttpSession {
    fn send<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<&'a Value>,
    ) -> SessionFuture<'a> {
        Box::pin(async move {
            let url = format!("{}{path}", self.endpoint);
            let builder = match method {
                Method::Get => HTTP_CLIENT.get(&url),
                Method::Post => HTTP_CLIENT.post(&url),
                Method::Delete => HTTP_CLIENT.delete(&url),
            }
            .header("X-Auth-Token", &self.token)
            .header("Accept", "application/json");
            let request = match body {
                Some(payload) => builder.json(payload),
                None => builder,
            };

            let response = request.send().await.map_err(transport)?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await.map_err(transport)?;
            Ok(RawResponse {
                url,
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        })
    }
}

pub(crate) fn transport(err: reqwest::Error) -> OpenstackError {
    OpenstackError::Transport {
        message: err.to_string(),
    }
}
