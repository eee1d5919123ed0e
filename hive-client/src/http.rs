use crate::api::{ClientResult, DaemonApi, DaemonControl, EventStream};
use crate::debug_log::StreamDebugLog;
use crate::error::ClientError;
use crate::sse::decode_stream;
use async_trait::async_trait;
use futures::TryStreamExt;
use hive_protocol::{
    AgentEvent, ApprovalsResponse, DecideRequest, ErrorBody, ExitRequest, HealthResponse,
    ItemEvent, LogEvent, OkResponse, PendingApproval, SendMessageRequest, SessionSnapshot,
    SessionsResponse, StartSessionRequest, StreamFilter,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads the daemon's bearer token. `None` when the file is missing or
/// empty, which is normal before the first daemon start.
pub fn load_token(path: &Path) -> ClientResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let token = contents.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// `http://` base URL for a `host:port` listen address.
pub fn base_url(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// reqwest-backed [`DaemonApi`]. Ordinary calls share a client with a request
/// timeout; sending a message and following a stream may legitimately take
/// longer, so they use clients without one.
#[derive(Clone, Debug)]
pub struct HttpDaemonClient {
    base: String,
    token: Option<String>,
    http: Client,
    send_http: Client,
    stream_http: Client,
    debug_log: StreamDebugLog,
}

impl HttpDaemonClient {
    pub fn new(addr: &str, token: Option<String>) -> ClientResult<Self> {
        let build = |builder: reqwest::ClientBuilder| {
            builder
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .map_err(|err| ClientError::Transport(format!("building reqwest client: {err}")))
        };
        Ok(Self {
            base: base_url(addr),
            token,
            http: build(Client::builder().timeout(REQUEST_TIMEOUT))?,
            send_http: build(Client::builder())?,
            stream_http: build(Client::builder())?,
            debug_log: StreamDebugLog::disabled(),
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_debug_log(mut self, debug_log: StreamDebugLog) -> Self {
        self.debug_log = debug_log;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn session_url(&self, id: &str, suffix: &str) -> String {
        self.url(&format!("/v1/sessions/{}{}", id.trim(), suffix))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> ClientResult<Response> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(ClientError::from_transport)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(api_error(response).await)
        }
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ClientResult<T> {
        let response = self.send(builder).await?;
        response.json::<T>().await.map_err(|err| {
            if err.is_decode() {
                ClientError::Decode(err.to_string())
            } else {
                ClientError::from_transport(err)
            }
        })
    }

    async fn follow<T>(
        &self,
        url: String,
        query: Vec<(&'static str, String)>,
        label: &str,
    ) -> ClientResult<EventStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let response = self
            .send(self.stream_http.get(url).query(&query))
            .await?;
        self.debug_log
            .record("stream_open", serde_json::json!({"stream": label}));
        let bytes = response.bytes_stream().map_err(ClientError::from_transport);
        Ok(decode_stream(bytes, self.debug_log.clone(), label))
    }
}

async fn api_error(response: Response) -> ClientError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.code, body.message),
        Err(_) => {
            let message = if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                text.trim().to_string()
            };
            (status.as_str().to_string(), message)
        }
    };
    if status == reqwest::StatusCode::NOT_FOUND {
        ClientError::NotFound(message)
    } else {
        ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        }
    }
}

#[async_trait]
impl DaemonControl for HttpDaemonClient {
    async fn health(&self) -> ClientResult<HealthResponse> {
        self.call(self.http.get(self.url("/health"))).await
    }

    async fn shutdown(&self) -> ClientResult<()> {
        self.call::<OkResponse>(self.http.post(self.url("/shutdown")))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DaemonApi for HttpDaemonClient {
    async fn list_sessions(&self) -> ClientResult<Vec<SessionSnapshot>> {
        let response: SessionsResponse =
            self.call(self.http.get(self.url("/v1/sessions"))).await?;
        Ok(response.sessions)
    }

    async fn start_session(&self, request: &StartSessionRequest) -> ClientResult<SessionSnapshot> {
        if request.provider.trim().is_empty() {
            return Err(ClientError::Validation("provider is required".into()));
        }
        self.call(self.http.post(self.url("/v1/sessions")).json(request))
            .await
    }

    async fn get_session(&self, id: &str) -> ClientResult<SessionSnapshot> {
        self.call(self.http.get(self.session_url(id, ""))).await
    }

    async fn kill_session(&self, id: &str) -> ClientResult<SessionSnapshot> {
        self.call(self.http.post(self.session_url(id, "/kill")))
            .await
    }

    async fn interrupt_session(&self, id: &str) -> ClientResult<()> {
        self.call::<OkResponse>(self.http.post(self.session_url(id, "/interrupt")))
            .await
            .map(|_| ())
    }

    async fn mark_exited(&self, id: &str, exit_code: Option<i32>) -> ClientResult<SessionSnapshot> {
        self.call(
            self.http
                .post(self.session_url(id, "/exit"))
                .json(&ExitRequest { exit_code }),
        )
        .await
    }

    async fn send_message(&self, id: &str, text: &str) -> ClientResult<()> {
        if text.is_empty() {
            return Err(ClientError::Validation("message text is empty".into()));
        }
        let body = SendMessageRequest {
            text: text.to_string(),
        };
        self.call::<OkResponse>(self.send_http.post(self.session_url(id, "/send")).json(&body))
            .await
            .map(|_| ())
    }

    async fn tail(
        &self,
        id: &str,
        lines: usize,
        stream: StreamFilter,
    ) -> ClientResult<Vec<LogEvent>> {
        let query = [
            ("lines", lines.to_string()),
            ("stream", stream.as_str().to_string()),
        ];
        self.call(self.http.get(self.session_url(id, "/tail")).query(&query))
            .await
    }

    async fn stream_tail(
        &self,
        id: &str,
        backlog: usize,
        stream: StreamFilter,
    ) -> ClientResult<EventStream<LogEvent>> {
        let query = vec![
            ("follow", "1".to_string()),
            ("lines", backlog.to_string()),
            ("stream", stream.as_str().to_string()),
        ];
        self.follow(self.session_url(id, "/tail"), query, "tail")
            .await
    }

    async fn events(&self, id: &str, limit: usize) -> ClientResult<Vec<AgentEvent>> {
        let query = [("limit", limit.to_string())];
        self.call(self.http.get(self.session_url(id, "/events")).query(&query))
            .await
    }

    async fn stream_events(
        &self,
        id: &str,
        backlog: usize,
    ) -> ClientResult<EventStream<AgentEvent>> {
        let query = vec![("follow", "1".to_string()), ("limit", backlog.to_string())];
        self.follow(self.session_url(id, "/events"), query, "events")
            .await
    }

    async fn items(&self, id: &str, limit: usize) -> ClientResult<Vec<ItemEvent>> {
        let query = [("limit", limit.to_string())];
        self.call(self.http.get(self.session_url(id, "/items")).query(&query))
            .await
    }

    async fn stream_items(&self, id: &str, backlog: usize) -> ClientResult<EventStream<ItemEvent>> {
        let query = vec![("follow", "1".to_string()), ("limit", backlog.to_string())];
        self.follow(self.session_url(id, "/items"), query, "items")
            .await
    }

    async fn list_approvals(&self, id: &str) -> ClientResult<Vec<PendingApproval>> {
        let response: ApprovalsResponse = self
            .call(self.http.get(self.session_url(id, "/approvals")))
            .await?;
        Ok(response.approvals)
    }

    async fn decide_approval(&self, id: &str, request: &DecideRequest) -> ClientResult<()> {
        self.call::<OkResponse>(
            self.http
                .post(self.session_url(id, "/approvals"))
                .json(request),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_adds_scheme() {
        assert_eq!(base_url("127.0.0.1:7717"), "http://127.0.0.1:7717");
        assert_eq!(base_url("http://localhost:1/"), "http://localhost:1");
    }

    #[test]
    fn token_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        assert_eq!(load_token(&path).unwrap(), None);
        fs::write(&path, "\n").unwrap();
        assert_eq!(load_token(&path).unwrap(), None);
        fs::write(&path, "abc\n").unwrap();
        assert_eq!(load_token(&path).unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn validation_happens_before_any_request() {
        // Nothing listens on port 9; a request would fail as unavailable.
        let client = HttpDaemonClient::new("127.0.0.1:9", None).unwrap();
        let err = client
            .start_session(&StartSessionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        let err = client.send_message("s1", "").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn closed_port_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = HttpDaemonClient::new(&addr.to_string(), None).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(err.is_daemon_unavailable(), "unexpected error: {err}");
    }
}
