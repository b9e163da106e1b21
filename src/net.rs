//! Fetch-style networking: header lists, requests, responses and a queue of
//! in-flight fetches that the event loop settles one at a time.

use crate::config::{FetchBackendKind, FetchConfig, StaticRoute};
use crate::error::{BridgeError, BridgeResult, HostError};
use crate::value::{Arena, ClosureId, FetchId, HeadersId, RequestId, ResponseId};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Ordered, case-insensitive header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: &str) -> BridgeResult<()> {
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(HostError::type_error(format!("{name:?} is an invalid header name")).into());
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        if value.contains(['\r', '\n', '\0']) {
            return Err(HostError::type_error(format!("{value:?} is an invalid header value")).into());
        }
        self.entries.push((name.to_ascii_lowercase(), value.to_string()));
        Ok(())
    }

    /// All values for `name` joined with `", "`.
    pub fn get(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    pub headers: HeadersId,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub status: u16,
    pub url: String,
    pub headers: HeadersId,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Queued,
    Aborted,
    Settled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRecord {
    pub request: RequestId,
    pub on_settle: ClosureId,
    pub state: FetchState,
}

/// Live record counts per arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub headers: usize,
    pub requests: usize,
    pub responses: usize,
    pub fetches: usize,
}

/// A settled fetch, ready to be delivered to its callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub fetch: FetchId,
    pub on_settle: ClosureId,
    pub outcome: Result<ResponseId, HostError>,
}

/// What a backend is asked to send.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Transport used to settle fetches.
pub trait HttpBackend: Send {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, HostError>;
}

fn failed_to_fetch(detail: impl std::fmt::Display) -> HostError {
    HostError::type_error(format!("Failed to fetch: {detail}"))
}

/// Serves canned responses keyed by URL.
#[derive(Debug, Default)]
pub struct StaticBackend {
    routes: HashMap<String, StaticRoute>,
}

impl StaticBackend {
    pub fn new(routes: impl IntoIterator<Item = StaticRoute>) -> Self {
        let routes = routes
            .into_iter()
            .map(|route| (normalize_url(&route.url), route))
            .collect();
        Self { routes }
    }
}

fn normalize_url(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

impl HttpBackend for StaticBackend {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, HostError> {
        let route = self
            .routes
            .get(&normalize_url(&request.url))
            .ok_or_else(|| failed_to_fetch(format!("no route for {}", request.url)))?;
        let body = if request.method == "HEAD" {
            Vec::new()
        } else {
            route.body.clone().into_bytes()
        };
        Ok(HttpResponse {
            status: route.status,
            url: request.url.clone(),
            headers: vec![("content-type".to_string(), route.content_type.clone())],
            body,
        })
    }
}

/// Performs real HTTP requests with a blocking client.
pub struct ReqwestBackend {
    client: reqwest::blocking::Client,
}

impl ReqwestBackend {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

impl HttpBackend for ReqwestBackend {
    fn send(&mut self, request: &HttpRequest) -> Result<HttpResponse, HostError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HostError::type_error(format!("invalid method {}", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(failed_to_fetch)?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().map_err(failed_to_fetch)?.to_vec();

        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

/// Build the backend selected by `config`.
pub fn backend_from_config(config: &FetchConfig) -> Result<Box<dyn HttpBackend>, reqwest::Error> {
    Ok(match config.backend {
        FetchBackendKind::Static => Box::new(StaticBackend::new(config.routes.clone())),
        FetchBackendKind::Network => Box::new(ReqwestBackend::new(
            Duration::from_millis(config.timeout_ms),
            &config.user_agent,
        )?),
    })
}

const METHODS: &[&str] = &["DELETE", "GET", "HEAD", "OPTIONS", "PATCH", "POST", "PUT"];

pub struct Network {
    headers: Arena<HeadersId, HeaderList>,
    requests: Arena<RequestId, RequestRecord>,
    responses: Arena<ResponseId, ResponseRecord>,
    fetches: Arena<FetchId, FetchRecord>,
    queue: VecDeque<FetchId>,
    backend: Box<dyn HttpBackend>,
}

impl Network {
    pub fn new(backend: Box<dyn HttpBackend>) -> Self {
        Self {
            headers: Arena::new(),
            requests: Arena::new(),
            responses: Arena::new(),
            fetches: Arena::new(),
            queue: VecDeque::new(),
            backend,
        }
    }

    pub fn headers_new(&mut self) -> HeadersId {
        self.headers.insert(HeaderList::new())
    }

    pub fn headers(&self, id: HeadersId) -> BridgeResult<&HeaderList> {
        self.headers
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown header list {id}")))
    }

    pub fn headers_append(&mut self, id: HeadersId, name: &str, value: &str) -> BridgeResult<()> {
        self.headers
            .get_mut(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown header list {id}")))?
            .append(name, value)
    }

    /// Create a request. The header list is copied, not shared.
    pub fn request_new(
        &mut self,
        url: &str,
        method: &str,
        headers: Option<HeadersId>,
        body: Option<Vec<u8>>,
    ) -> BridgeResult<RequestId> {
        let parsed = url::Url::parse(url)
            .map_err(|err| HostError::type_error(format!("Failed to parse URL from {url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HostError::type_error(format!("unsupported URL scheme {}", parsed.scheme())).into());
        }

        let method = if method.is_empty() { "GET" } else { method };
        if !method.bytes().all(is_token_byte) {
            return Err(HostError::type_error(format!("{method:?} is not a valid HTTP method")).into());
        }
        let upper = method.to_ascii_uppercase();
        let method = if METHODS.contains(&upper.as_str()) {
            upper
        } else {
            method.to_string()
        };
        if body.is_some() && matches!(method.as_str(), "GET" | "HEAD") {
            return Err(HostError::type_error("Request with GET/HEAD method cannot have body").into());
        }

        let list = match headers {
            Some(id) => self.headers(id)?.clone(),
            None => HeaderList::new(),
        };
        let headers = self.headers.insert(list);
        Ok(self.requests.insert(RequestRecord {
            url: parsed.to_string(),
            method,
            headers,
            body,
        }))
    }

    pub fn request(&self, id: RequestId) -> BridgeResult<&RequestRecord> {
        self.requests
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown request {id}")))
    }

    pub fn response(&self, id: ResponseId) -> BridgeResult<&ResponseRecord> {
        self.responses
            .get(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown response {id}")))
    }

    /// Response body decoded as UTF-8, replacing invalid sequences.
    pub fn response_text(&self, id: ResponseId) -> BridgeResult<String> {
        Ok(String::from_utf8_lossy(&self.response(id)?.body).into_owned())
    }

    /// Queue `request`; `on_settle` runs once the fetch settles.
    pub fn fetch(&mut self, request: RequestId, on_settle: ClosureId) -> BridgeResult<FetchId> {
        let url = self.request(request)?.url.clone();
        let id = self.fetches.insert(FetchRecord {
            request,
            on_settle,
            state: FetchState::Queued,
        });
        self.queue.push_back(id);
        tracing::debug!(fetch = %id, %url, "fetch queued");
        Ok(id)
    }

    pub fn fetch_state(&self, id: FetchId) -> BridgeResult<FetchState> {
        self.fetches
            .get(id)
            .map(|record| record.state)
            .ok_or_else(|| BridgeError::protocol(format!("unknown fetch {id}")))
    }

    /// Abort a queued fetch. Settled fetches are unaffected.
    pub fn abort(&mut self, id: FetchId) -> BridgeResult<()> {
        let record = self
            .fetches
            .get_mut(id)
            .ok_or_else(|| BridgeError::protocol(format!("unknown fetch {id}")))?;
        if record.state == FetchState::Queued {
            record.state = FetchState::Aborted;
            tracing::debug!(fetch = %id, "fetch aborted");
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn record_counts(&self) -> RecordCounts {
        RecordCounts {
            headers: self.headers.len(),
            requests: self.requests.len(),
            responses: self.responses.len(),
            fetches: self.fetches.len(),
        }
    }

    fn headers_owned(&self, id: HeadersId) -> bool {
        self.requests.iter().any(|(_, r)| r.headers == id)
            || self.responses.iter().any(|(_, r)| r.headers == id)
    }

    /// Drop header list `id` unless a request or response owns it.
    pub fn reclaim_headers(&mut self, id: HeadersId) {
        if !self.headers_owned(id) {
            self.headers.remove(id);
        }
    }

    /// Drop request `id` unless an unsettled fetch still needs it. Returns
    /// the header list it owned.
    pub fn reclaim_request(&mut self, id: RequestId) -> Option<HeadersId> {
        let in_flight = self
            .fetches
            .iter()
            .any(|(_, f)| f.request == id && f.state != FetchState::Settled);
        if in_flight {
            return None;
        }
        self.requests.remove(id).map(|record| record.headers)
    }

    /// Drop response `id`, returning the header list it owned.
    pub fn reclaim_response(&mut self, id: ResponseId) -> Option<HeadersId> {
        self.responses.remove(id).map(|record| record.headers)
    }

    /// Drop fetch `id` once it has settled, returning the request it sent.
    pub fn reclaim_fetch(&mut self, id: FetchId) -> Option<RequestId> {
        match self.fetches.get(id) {
            Some(record) if record.state == FetchState::Settled => {
                self.fetches.remove(id).map(|record| record.request)
            }
            _ => None,
        }
    }

    /// Settle the oldest queued fetch.
    pub fn next_completion(&mut self) -> BridgeResult<Option<Completion>> {
        let Some(id) = self.queue.pop_front() else {
            return Ok(None);
        };
        let record = self
            .fetches
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::protocol(format!("unknown fetch {id}")))?;

        let outcome = match record.state {
            FetchState::Aborted => Err(HostError::abort("The operation was aborted.")),
            _ => self.perform(record.request)?,
        };
        if let Some(record) = self.fetches.get_mut(id) {
            record.state = FetchState::Settled;
        }
        match &outcome {
            Ok(response) => tracing::debug!(fetch = %id, %response, "fetch settled"),
            Err(err) => tracing::debug!(fetch = %id, error = %err, "fetch failed"),
        }
        Ok(Some(Completion {
            fetch: id,
            on_settle: record.on_settle,
            outcome,
        }))
    }

    fn perform(&mut self, request: RequestId) -> BridgeResult<Result<ResponseId, HostError>> {
        let record = self.request(request)?;
        let http = HttpRequest {
            url: record.url.clone(),
            method: record.method.clone(),
            headers: self
                .headers(record.headers)?
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: record.body.clone(),
        };

        let response = match self.backend.send(&http) {
            Ok(response) => response,
            Err(err) => return Ok(Err(err)),
        };
        let mut list = HeaderList::new();
        for (name, value) in &response.headers {
            // Backends may hand back headers we would reject from the guest.
            if list.append(name, value).is_err() {
                tracing::trace!(header = %name, "dropping malformed response header");
            }
        }
        let headers = self.headers.insert(list);
        Ok(Ok(self.responses.insert(ResponseRecord {
            status: response.status,
            url: response.url,
            headers,
            body: response.body,
        })))
    }
}
