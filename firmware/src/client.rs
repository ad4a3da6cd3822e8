//! Gateway client. Maps HTTP status codes onto the error taxonomy the agent acts on.

use std::time::Duration;

use common::req::{
    ErrorBody, RegisterRequest, RegisterResponse, SubmitReadingsRequest, SubmitReadingsResponse,
    UpdateCheckQuery, UpdateCheckResponse,
};
use log::debug;
use serde::de::DeserializeOwned;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Blocking HTTP transport.
pub trait Http {
    /// Sends a request and reads the (small) response body completely.
    fn request(&mut self, method: Method, url: &str, body: Option<&[u8]>) -> anyhow::Result<Response>;

    /// Starts a `GET` whose body is pulled with [`Http::read`]. Returns the status and
    /// the announced content length.
    fn open(&mut self, url: &str) -> anyhow::Result<(u16, Option<u64>)>;

    /// Reads the next chunk of the body started with [`Http::open`], `0` at the end.
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;

    fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("credential rejected")]
    Auth,
    #[error("device is pending approval")]
    PendingApproval,
    #[error("rate limited, retry in {0:?}")]
    RateLimited(Duration),
    #[error("rejected: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ClientError {
    fn from_response(res: &Response) -> Self {
        let body: Option<ErrorBody> = serde_json::from_slice(&res.body).ok();
        let message = body
            .as_ref()
            .map(|b| b.message.clone())
            .unwrap_or_default();

        match res.status {
            401 => Self::Auth,
            403 => Self::PendingApproval,
            429 => Self::RateLimited(
                body.and_then(|b| b.retry_after)
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RETRY_AFTER),
            ),
            400 | 413 | 422 => Self::Validation(message),
            409 => Self::Conflict(message),
            404 => Self::NotFound,
            status => Self::Transient(format!("HTTP {status} {message}")),
        }
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

pub struct ApiClient<H> {
    http: H,
    base_url: String,
}

impl<H: Http> ApiClient<H> {
    pub fn new(http: H, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn http_mut(&mut self) -> &mut H {
        &mut self.http
    }

    pub fn into_http(self) -> H {
        self.http
    }

    /// Absolute url for a server supplied path (`/ota/download/1.1.0`) or url.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    pub fn register(&mut self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        self.post("/register", req)
    }

    pub fn submit(
        &mut self,
        req: &SubmitReadingsRequest,
    ) -> Result<SubmitReadingsResponse, ClientError> {
        self.post("/readings", req)
    }

    pub fn check_update(
        &mut self,
        query: &UpdateCheckQuery,
    ) -> Result<UpdateCheckResponse, ClientError> {
        let url = format!("{}?{}", self.url("/ota/check"), encode_query(query));
        let res = self.http.request(Method::Get, &url, None)?;
        Self::parse(res)
    }

    /// Opens a firmware download, returns the announced size.
    pub fn open_download(&mut self, path: &str) -> Result<Option<u64>, ClientError> {
        let url = self.url(path);
        let (status, len) = self.http.open(&url)?;
        if status != 200 {
            self.http.close();
            return Err(ClientError::from_response(&Response {
                status,
                body: Vec::new(),
            }));
        }
        Ok(len)
    }

    pub fn read_download(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        Ok(self.http.read(buf)?)
    }

    pub fn close_download(&mut self) {
        self.http.close();
    }

    fn post<T: serde::Serialize, R: DeserializeOwned>(
        &mut self,
        path: &str,
        body: &T,
    ) -> Result<R, ClientError> {
        let url = self.url(path);
        let body = serde_json::to_vec(body).map_err(|e| ClientError::Validation(e.to_string()))?;
        let res = self.http.request(Method::Post, &url, Some(&body))?;
        Self::parse(res)
    }

    fn parse<R: DeserializeOwned>(res: Response) -> Result<R, ClientError> {
        debug!("HTTP {} ({} bytes)", res.status, res.body.len());
        if res.status != 200 {
            return Err(ClientError::from_response(&res));
        }
        serde_json::from_slice(&res.body)
            .map_err(|e| ClientError::Transient(format!("malformed response: {e}")))
    }
}

fn encode_query(query: &UpdateCheckQuery) -> String {
    let mut ser = form_urlencoded::Serializer::new(String::new());
    ser.append_pair("device_id", &query.device_id)
        .append_pair("version", &query.version);
    if query.rolled_back == Some(true) {
        ser.append_pair("rolled_back", "true");
    }
    if let Some(failed) = &query.failed_version {
        ser.append_pair("failed_version", failed);
    }
    if let Some(error) = &query.error {
        ser.append_pair("error", error);
    }
    ser.finish()
}
