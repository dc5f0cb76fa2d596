//! Stateful wrapper around per-service REST sessions.
//!
//! [`RequestCache`] remembers the last decoded response so list lookups can
//! be chained without re-fetching, and keeps the full request history for
//! failure diagnostics and the optional API dump.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use tracing::debug;

use super::error::ApiFailure;
use super::OpenstackError;

/// Statuses treated as success.
pub const ACCEPTED_STATUS: [u16; 4] = [200, 201, 202, 204];

/// Spacing between consecutive sequence numbers in the API dump.
pub const DUMP_SEQUENCE_STEP: usize = 10;

/// Platform services the provisioner talks to.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Service {
    /// Nova.
    Compute,
    /// Cinder.
    Volume,
    /// Neutron.
    Network,
    /// Glance.
    Image,
}

impl Service {
    /// All services a provisioning run needs.
    pub const ALL: [Self; 4] = [Self::Compute, Self::Volume, Self::Network, Self::Image];

    /// Short lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Volume => "volume",
            Self::Network => "network",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP verbs used against the platform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    /// Read.
    Get,
    /// Create or act.
    Post,
    /// Remove.
    Delete,
}

impl Method {
    /// Upper-case verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    /// Parses an upper-case verb.
    #[must_use]
    pub fn parse(verb: &str) -> Option<Self> {
        match verb {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Undecoded response returned by a [`Session`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawResponse {
    /// Absolute URL that was requested.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response body; may be empty.
    pub body: String,
}

/// Future returned by [`Session::send`].
pub type SessionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RawResponse, OpenstackError>> + Send + 'a>>;

/// Authenticated transport bound to one service endpoint.
pub trait Session: Send + Sync {
    /// Issues `method` against the service-relative `path`.
    fn send<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<&'a Value>,
    ) -> SessionFuture<'a>;
}

/// Sessions keyed by the service they serve.
pub type SessionMap = HashMap<Service, Box<dyn Session>>;

/// One recorded request/response pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiExchange {
    /// Verb used.
    pub method: Method,
    /// Absolute URL requested.
    pub url: String,
    /// Status code returned.
    pub status: u16,
    /// Parsed body, `None` when empty or not JSON.
    pub body: Option<Value>,
}

/// Cache of the most recent response plus the full exchange history.
pub struct RequestCache {
    sessions: SessionMap,
    last: Option<ApiExchange>,
    history: Vec<ApiExchange>,
    cached: Option<Value>,
}

impl fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<_> = self.sessions.keys().copied().collect();
        services.sort();
        f.debug_struct("RequestCache")
            .field("services", &services)
            .field("exchanges", &self.exchange_count())
            .finish_non_exhaustive()
    }
}

impl RequestCache {
    /// Wraps the given sessions with an empty cache.
    #[must_use]
    pub fn new(sessions: SessionMap) -> Self {
        Self {
            sessions,
            last: None,
            history: Vec::new(),
            cached: None,
        }
    }

    /// Issues one request and caches its decoded body.
    ///
    /// An empty or non-JSON body decodes to `null`. When `unwrap` is given
    /// the named top-level key is extracted and becomes the result.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::Precondition`] when no session serves `service`.
    /// - [`OpenstackError::Api`] when the status is not in [`ACCEPTED_STATUS`].
    /// - [`OpenstackError::Shape`] when `unwrap` names a missing key.
    /// - Transport failures from the session.
    pub async fn request(
        &mut self,
        service: Service,
        path: &str,
        unwrap: Option<&str>,
        method: Method,
        body: Option<Value>,
    ) -> Result<Value, OpenstackError> {
        let session = self.sessions.get(&service).ok_or_else(|| {
            OpenstackError::Precondition(format!("no session for the {service} service"))
        })?;
        debug!(%method, %service, path, "issuing request");
        let raw = session.send(method, path, body.as_ref()).await?;
        let parsed = serde_json::from_str::<Value>(&raw.body).ok();
        let status = raw.status;
        self.record(ApiExchange {
            method,
            url: raw.url,
            status,
            body: parsed.clone(),
        });

        if !ACCEPTED_STATUS.contains(&status) {
            self.log_history();
            return Err(OpenstackError::Api(Box::new(ApiFailure {
                method,
                path: path.to_owned(),
                status,
                history: self.exchanges(),
            })));
        }

        let decoded = parsed.unwrap_or(Value::Null);
        let value = match unwrap {
            Some(key) => take_key(decoded, key, path)?,
            None => decoded,
        };
        self.cached = Some(value.clone());
        Ok(value)
    }

    /// Returns every element's value under `key`.
    ///
    /// Searches `list` when given, else the last cached response.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::Precondition`] when nothing is cached yet.
    /// - [`OpenstackError::Shape`] when the cached response is not a list.
    pub fn child_values(
        &self,
        key: &str,
        list: Option<&[Value]>,
    ) -> Result<Vec<Value>, OpenstackError> {
        Ok(self
            .search_target(list)?
            .iter()
            .filter_map(|child| child.get(key).cloned())
            .collect())
    }

    /// Like [`Self::child_values`] but keeps only string values.
    ///
    /// # Errors
    ///
    /// As for [`Self::child_values`].
    pub fn child_strings(
        &self,
        key: &str,
        list: Option<&[Value]>,
    ) -> Result<Vec<String>, OpenstackError> {
        Ok(self
            .child_values(key, list)?
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_owned))
            .collect())
    }

    /// Returns the first element whose `key` equals `value`.
    ///
    /// # Errors
    ///
    /// - [`OpenstackError::NotFound`] when no element matches.
    /// - As for [`Self::child_values`].
    pub fn child_search(
        &self,
        key: &str,
        value: &str,
        list: Option<&[Value]>,
    ) -> Result<Value, OpenstackError> {
        self.search_target(list)?
            .iter()
            .find(|child| child.get(key).and_then(Value::as_str) == Some(value))
            .cloned()
            .ok_or_else(|| OpenstackError::not_found(format!("entry with {key} '{value}'")))
    }

    /// Value cached from the most recent successful request.
    #[must_use]
    pub const fn cached(&self) -> Option<&Value> {
        self.cached.as_ref()
    }

    /// Most recent exchange, successful or not.
    #[must_use]
    pub const fn last(&self) -> Option<&ApiExchange> {
        self.last.as_ref()
    }

    /// Number of exchanges recorded so far.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.history.len() + usize::from(self.last.is_some())
    }

    /// All exchanges in request order.
    #[must_use]
    pub fn exchanges(&self) -> Vec<ApiExchange> {
        self.history.iter().chain(self.last.iter()).cloned().collect()
    }

    /// Renders the exchange history in the API dump format.
    #[must_use]
    pub fn dump(&self) -> Value {
        let entries = self
            .history
            .iter()
            .chain(self.last.iter())
            .enumerate()
            .map(|(index, exchange)| {
                let mut entry = Map::new();
                entry.insert(
                    exchange.method.as_str().to_owned(),
                    Value::String(exchange.url.clone()),
                );
                entry.insert(
                    String::from("response"),
                    exchange.body.clone().unwrap_or(Value::Null),
                );
                entry.insert(String::from("status_code"), Value::from(exchange.status));
                entry.insert(
                    String::from("sequence_number"),
                    Value::from(index * DUMP_SEQUENCE_STEP),
                );
                Value::Object(entry)
            })
            .collect();
        Value::Array(entries)
    }

    fn record(&mut self, exchange: ApiExchange) {
        if let Some(previous) = self.last.replace(exchange) {
            self.history.push(previous);
        }
    }

    fn log_history(&self) {
        for exchange in self.history.iter().chain(self.last.iter()) {
            debug!(
                method = %exchange.method,
                url = exchange.url,
                status = exchange.status,
                "recorded exchange"
            );
        }
    }

    fn search_target<'a>(
        &'a self,
        list: Option<&'a [Value]>,
    ) -> Result<&'a [Value], OpenstackError> {
        if let Some(items) = list {
            return Ok(items);
        }
        let cached = self.cached.as_ref().ok_or_else(|| {
            OpenstackError::Precondition(String::from("no response has been cached yet"))
        })?;
        cached
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| OpenstackError::Shape {
                message: String::from("cached response is not a list"),
            })
    }
}

fn take_key(value: Value, key: &str, path: &str) -> Result<Value, OpenstackError> {
    match value {
        Value::Object(mut map) => map.remove(key).ok_or_else(|| OpenstackError::Shape {
            message: format!("response from {path} has no '{key}' key"),
        }),
        _ => Err(OpenstackError::Shape {
            message: format!("response from {path} is not an object with '{key}'"),
        }),
    }
}

#[cfg(test)]
mod tests;
