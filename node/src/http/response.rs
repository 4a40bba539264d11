//! Response construction and the one-shot send.

use std::mem;

use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
};
use tracing::{debug, warn};
use webnode_common::{
    http::{accepts_json, JSON_CONTENT_TYPE},
    HttpError, Request, StatusCode, Value,
};

use super::json::{write_value, JsonError};

/// Write half of a client connection.
pub type ConnectionWriter = Box<dyn AsyncWrite + Send + Unpin>;

const WRITE_BUFFER_BYTES: usize = 512;
const FILE_CHUNK_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Pending,
    /// The status line has been handed to the socket.
    Committed,
    Sent,
}

/// What is known about the client when the reply is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Negotiation {
    /// No request was parsed.
    Early,
    Request { route: String, accept: Option<String> },
}

pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Body,
    negotiation: Negotiation,
    writer: Option<BufWriter<ConnectionWriter>>,
    state: SendState,
}

impl Response {
    pub fn new(writer: ConnectionWriter) -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::new(),
            body: Body::Empty,
            negotiation: Negotiation::Early,
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER_BYTES, writer)),
            state: SendState::Pending,
        }
    }

    pub(crate) fn bind_request(&mut self, request: &Request) {
        self.negotiation = Negotiation::Request {
            route: format!("{} {}", request.method(), request.path()),
            accept: request.header("accept").map(str::to_string),
        };
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets a header, replacing any earlier value of the same name.
    pub fn header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_ascii_lowercase(), value)),
        }
    }

    fn default_header(&mut self, name: &str, value: impl Into<String>) {
        if self.header_value(name).is_none() {
            self.header(name, value);
        }
    }

    pub fn append_body(&mut self, text: &str) -> Result<(), HttpError> {
        match &mut self.body {
            Body::Empty => {
                self.body = Body::Text(text.to_string());
                Ok(())
            }
            Body::Text(existing) => {
                existing.push_str(text);
                Ok(())
            }
            Body::Json(_) => Err(HttpError::internal(
                "Attempted to append text to a structured body.",
            )),
        }
    }

    pub fn set_json(&mut self, value: impl Into<Value>) -> Result<(), HttpError> {
        match self.body {
            Body::Empty => {
                self.body = Body::Json(value.into());
                Ok(())
            }
            Body::Text(_) => Err(HttpError::internal(
                "Attempted to set a structured body on a text body.",
            )),
            Body::Json(_) => Err(HttpError::internal(
                "Attempted to set a second structured body.",
            )),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.state == SendState::Sent
    }

    pub fn is_committed(&self) -> bool {
        self.state != SendState::Pending
    }

    /// Writes the status line, headers and body, then closes the write side.
    ///
    /// A second call is a no-op. Errors raised before anything was written
    /// leave the response unsent so the caller can still reply with them.
    pub async fn send(&mut self) -> Result<(), HttpError> {
        if self.state != SendState::Pending {
            debug!("response already sent; ignoring");
            return Ok(());
        }
        self.check_body()?;

        match &self.body {
            Body::Text(text) => {
                let length = text.len();
                self.default_header("content-type", "text/plain; charset=utf-8");
                self.header("content-length", length.to_string());
            }
            Body::Json(_) => self.header("content-type", JSON_CONTENT_TYPE),
            Body::Empty => {}
        }
        self.header("connection", "close");

        let mut writer = self.commit()?;
        let body = mem::replace(&mut self.body, Body::Empty);
        let (status, headers) = (self.status, &self.headers);
        let written = async {
            write_head(status, headers, &mut writer).await?;
            match &body {
                Body::Text(text) => writer.write_all(text.as_bytes()).await?,
                Body::Json(value) => write_value(value, &mut writer).await?,
                Body::Empty => {}
            }
            Ok::<_, JsonError>(())
        }
        .await;
        self.body = body;
        self.finish(writer, written).await
    }

    /// Streams a file as the whole reply.
    pub(crate) async fn send_file(
        &mut self,
        mut file: File,
        length: u64,
        content_type: &str,
    ) -> Result<(), HttpError> {
        if self.state != SendState::Pending {
            return Ok(());
        }
        self.header("content-type", content_type);
        self.header("content-length", length.to_string());
        self.header("connection", "close");

        let mut writer = self.commit()?;
        let (status, headers) = (self.status, &self.headers);
        let written = async {
            write_head(status, headers, &mut writer).await?;
            let mut chunk = [0u8; FILE_CHUNK_BYTES];
            loop {
                let read = file.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                writer.write_all(&chunk[..read]).await?;
            }
            Ok::<_, JsonError>(())
        }
        .await;
        self.finish(writer, written).await
    }

    /// Replaces whatever the handler built with an error reply.
    ///
    /// Structured `{"code", "error"}` is used only when a request exists, the
    /// failure was not an allocation failure and the client accepts JSON.
    pub(crate) fn prepare_error(&mut self, err: &HttpError) {
        self.status = err.status;
        self.headers.clear();

        let structured = !err.is_plain_only()
            && matches!(
                &self.negotiation,
                Negotiation::Request { accept: Some(accept), .. } if accepts_json(accept)
            );
        if structured {
            self.body = Body::Json(Value::object([
                ("code", Value::from(err.status.code())),
                ("error", Value::from(err.message.as_str())),
            ]));
        } else {
            self.header("content-type", "text/html");
            self.body = Body::Text(format!(
                "<html><body><h1>{}</h1><pre>{}</pre></body></html>",
                err.status,
                escape_html(&err.message)
            ));
        }
    }

    fn check_body(&self) -> Result<(), HttpError> {
        let (route, accept) = match &self.negotiation {
            Negotiation::Request { route, accept } => (route.as_str(), accept.as_deref()),
            Negotiation::Early => ("<unparsed request>", None),
        };
        match &self.body {
            Body::Empty => Err(HttpError::internal(format!("Body is unset on {route}"))),
            Body::Text(_) => Ok(()),
            Body::Json(value) => {
                if let Negotiation::Request { .. } = self.negotiation {
                    match accept {
                        None => {
                            return Err(HttpError::bad_request(
                                "Client did not send an Accept header (required for structured data).",
                            ))
                        }
                        Some(accept) if !accepts_json(accept) => {
                            return Err(HttpError::bad_request(format!(
                                "Client does not accept structured data (accept={accept})."
                            )))
                        }
                        Some(_) => {}
                    }
                }
                value.validate().map_err(|err| {
                    HttpError::internal(format!("Failed to serialize body as JSON: {err}."))
                })
            }
        }
    }

    fn commit(&mut self) -> Result<BufWriter<ConnectionWriter>, HttpError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| HttpError::internal("Connection already released."))?;
        self.state = SendState::Committed;
        Ok(writer)
    }

    async fn finish(
        &mut self,
        mut writer: BufWriter<ConnectionWriter>,
        written: Result<(), JsonError>,
    ) -> Result<(), HttpError> {
        let closed = writer.shutdown().await;
        self.state = SendState::Sent;
        written.map_err(|err| HttpError::internal(format!("Failed to write response: {err}")))?;
        if let Err(err) = closed {
            warn!("failed to close connection cleanly: {err}");
        }
        Ok(())
    }
}

/// Borrowing the whole `Response` across these writes would require the
/// writer to be `Sync`.
async fn write_head(
    status: StatusCode,
    headers: &[(String, String)],
    writer: &mut BufWriter<ConnectionWriter>,
) -> std::io::Result<()> {
    writer
        .write_all(format!("HTTP/1.1 {} {}\r\n", status.code(), status.reason()).as_bytes())
        .await?;
    for (name, value) in headers {
        writer
            .write_all(format!("{name}: {value}\r\n").as_bytes())
            .await?;
    }
    writer.write_all(b"\r\n").await
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            ch => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use webnode_common::{http::parse_target, Method};

    use super::*;

    fn response() -> (Response, DuplexStream) {
        let (server, client) = duplex(4096);
        (Response::new(Box::new(server)), client)
    }

    fn request(accept: Option<&str>) -> Request {
        let headers = accept
            .map(|value| HashMap::from([("accept".to_string(), value.to_string())]))
            .unwrap_or_default();
        Request::new(
            Method::Get,
            parse_target("/wifi_mode").unwrap(),
            headers,
            HashMap::new(),
        )
    }

    async fn read_all(mut client: DuplexStream) -> String {
        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn text_appends_concatenate() {
        let (mut resp, client) = response();
        resp.append_body("<p>").unwrap();
        resp.append_body("hi").unwrap();
        resp.append_body("</p>").unwrap();
        assert_eq!(resp.body(), &Body::Text("<p>hi</p>".to_string()));

        resp.send().await.unwrap();
        let raw = read_all(client).await;
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("content-length: 9\r\n"));
        assert!(raw.contains("connection: close\r\n"));
        assert!(raw.ends_with("\r\n\r\n<p>hi</p>"));
    }

    #[tokio::test]
    async fn second_structured_body_is_rejected() {
        let (mut resp, _client) = response();
        resp.set_json(Value::object([("a", Value::from(1))])).unwrap();
        let err = resp.set_json(Value::from(vec![1, 2])).unwrap_err();
        assert_eq!(err.status, StatusCode::InternalServerError);
        assert_eq!(resp.append_body("x").unwrap_err().status, StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn json_requires_accept_header() {
        let (mut resp, _client) = response();
        resp.bind_request(&request(None));
        resp.set_json(Value::object([("mode", Value::from("AP"))])).unwrap();
        let err = resp.send().await.unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
        assert!(!resp.is_committed());

        let (mut resp, _client) = response();
        resp.bind_request(&request(Some("text/html")));
        resp.set_json(Value::from(vec![1])).unwrap();
        assert_eq!(resp.send().await.unwrap_err().status, StatusCode::BadRequest);
    }

    #[tokio::test]
    async fn json_reply_is_streamed() {
        let (mut resp, client) = response();
        resp.bind_request(&request(Some("*/*")));
        resp.set_json(Value::object([("mode", Value::from("STA"))])).unwrap();
        resp.send().await.unwrap();
        assert!(resp.is_sent());
        // A second send is ignored.
        resp.send().await.unwrap();

        let raw = read_all(client).await;
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        assert!(head.contains("content-type: application/json"));
        assert!(!head.contains("content-length"));
        assert_eq!(body, r#"{"mode":"STA"}"#);
    }

    #[tokio::test]
    async fn unset_body_is_internal_error() {
        let (mut resp, _client) = response();
        resp.bind_request(&request(Some("*/*")));
        let err = resp.send().await.unwrap_err();
        assert_eq!(err.status, StatusCode::InternalServerError);
        assert_eq!(err.message, "Body is unset on GET /wifi_mode");
    }

    #[tokio::test]
    async fn nan_fails_before_anything_is_written() {
        let (mut resp, _client) = response();
        resp.bind_request(&request(Some("application/json")));
        resp.set_json(Value::from(vec![f64::NAN])).unwrap();
        let err = resp.send().await.unwrap_err();
        assert_eq!(err.status, StatusCode::InternalServerError);
        assert!(!resp.is_committed());
    }

    #[tokio::test]
    async fn error_reply_is_structured_only_when_negotiable() {
        let (mut resp, client) = response();
        resp.bind_request(&request(Some("application/json")));
        resp.prepare_error(&HttpError::not_found("Path \"/x\" not found"));
        resp.send().await.unwrap();
        let raw = read_all(client).await;
        assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\n"));
        let body = raw.split_once("\r\n\r\n").unwrap().1;
        let decoded: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            decoded,
            serde_json::json!({"code": 404, "error": "Path \"/x\" not found"})
        );

        let (mut resp, client) = response();
        resp.bind_request(&request(Some("application/json")));
        resp.prepare_error(&HttpError::out_of_memory("no memory"));
        resp.send().await.unwrap();
        let raw = read_all(client).await;
        assert!(raw.contains("content-type: text/html"));
        assert!(raw.contains("<h1>500 Internal Server Error</h1>"));

        let (mut resp, client) = response();
        resp.prepare_error(&HttpError::bad_request("bad <line>").early());
        resp.send().await.unwrap();
        let raw = read_all(client).await;
        assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(raw.contains("<pre>bad &lt;line&gt;</pre>"));
    }

    #[tokio::test]
    async fn send_runs_on_a_spawned_task() {
        let (mut resp, client) = response();
        resp.bind_request(&request(Some("application/json")));
        resp.set_json(Value::object([("mode", Value::from("AP"))])).unwrap();
        tokio::spawn(async move {
            resp.send().await.unwrap();
            assert!(resp.is_sent());
        })
        .await
        .unwrap();

        let raw = read_all(client).await;
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.ends_with(r#"{"mode":"AP"}"#));
    }
}
