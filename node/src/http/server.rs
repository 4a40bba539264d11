//! Listener lifecycle and per-connection request handling.

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    net::{TcpListener, TcpSocket, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use webnode_common::{
    http::{
        is_form_content_type, parse_form, parse_header_line, parse_request_line, parse_target,
        strip_line_ending,
    },
    HttpError, Method, Request,
};

use super::{
    response::{ConnectionWriter, Response},
    router::{Resolved, Router},
};

pub const MAX_LINE_BYTES: usize = 1024;
pub const MAX_BODY_BYTES: u64 = 4096;
pub const MAX_HEADERS: usize = 32;
const MAX_DRAIN_BYTES: u64 = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct ServerContext<S> {
    router: Router<S>,
    state: S,
    static_root: Option<PathBuf>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Cooperative HTTP/1.x server; one request per connection.
pub struct HttpServer<S> {
    context: Arc<ServerContext<S>>,
    running: Option<Running>,
}

impl<S> HttpServer<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(router: Router<S>, state: S, static_root: Option<PathBuf>) -> Self {
        Self {
            context: Arc::new(ServerContext {
                router,
                state,
                static_root,
            }),
            running: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn start(&mut self, bind: Ipv4Addr, port: u16, backlog: u32) -> io::Result<SocketAddr> {
        if self.running.is_some() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "http server already running",
            ));
        }

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((bind, port)))?;
        let listener = socket.listen(backlog)?;
        let local_addr = listener.local_addr()?;

        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.context), stop));
        self.running = Some(Running {
            shutdown,
            task,
            local_addr,
        });
        info!("web server listening on http://{local_addr}");
        Ok(local_addr)
    }

    /// Stops accepting and returns once the listening socket is closed.
    /// Connections already accepted run to completion.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if let Err(err) = running.task.await {
            error!("web server task ended abnormally: {err}");
        }
        debug!("web server on {} stopped", running.local_addr);
    }
}

async fn accept_loop<S>(
    listener: TcpListener,
    context: Arc<ServerContext<S>>,
    mut stop: oneshot::Receiver<()>,
) where
    S: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let context = Arc::clone(&context);
                    tokio::spawn(async move {
                        serve_stream(&context, stream, peer).await;
                    });
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);
}

async fn serve_stream<S>(context: &ServerContext<S>, stream: TcpStream, peer: SocketAddr)
where
    S: Send + Sync + 'static,
{
    debug!("connection from {peer}");
    let (reader, writer) = stream.into_split();
    serve_connection(context, BufReader::new(reader), Box::new(writer)).await;
}

async fn serve_connection<S, R>(context: &ServerContext<S>, mut reader: R, writer: ConnectionWriter)
where
    S: Send + Sync + 'static,
    R: AsyncBufRead + Unpin + Send,
{
    let mut response = Response::new(writer);
    let mut unread_body = 0u64;

    let outcome = match read_request(&mut reader, &mut unread_body).await {
        Ok(None) => {
            debug!("client closed before sending a request");
            return;
        }
        Ok(Some(request)) => {
            response.bind_request(&request);
            dispatch(context, &request, &mut response).await
        }
        Err(err) => Err(err),
    };

    if let Err(err) = outcome {
        reply_with_error(&mut reader, unread_body, &mut response, err).await;
    }
}

async fn dispatch<S>(
    context: &ServerContext<S>,
    request: &Request,
    response: &mut Response,
) -> Result<(), HttpError>
where
    S: Send + Sync + 'static,
{
    match context.router.resolve(request.path(), request.method()) {
        Resolved::Handler(handler) => {
            handler(&context.state, request, response).await?;
            if !response.is_sent() {
                response.send().await?;
            }
            Ok(())
        }
        Resolved::NotFound => match (&context.static_root, request.method()) {
            (Some(root), Method::Get) => serve_static(root, request.path(), response).await,
            _ => Err(HttpError::not_found(format!(
                "Path \"{}\" not found",
                request.path()
            ))),
        },
        Resolved::MethodNotAllowed => Err(HttpError::method_not_allowed(format!(
            "Method {} not allowed on \"{}\"",
            request.method(),
            request.path()
        ))),
    }
}

async fn reply_with_error<R>(
    reader: &mut R,
    unread_body: u64,
    response: &mut Response,
    err: HttpError,
) where
    R: AsyncRead + Unpin,
{
    if response.is_committed() {
        warn!("failed after the reply was started: {err}");
        return;
    }
    info!("replying {}: {}", err.status, err.message);

    if unread_body > 0 {
        let limit = unread_body.min(MAX_DRAIN_BYTES);
        if let Err(drain_err) = tokio::io::copy(&mut reader.take(limit), &mut tokio::io::sink()).await {
            debug!("failed to drain request body: {drain_err}");
        }
    }

    response.prepare_error(&err);
    if let Err(send_err) = response.send().await {
        debug!("could not deliver error reply: {send_err}");
    }
}

/// Parses one request. `Ok(None)` means the client closed without sending
/// anything. `unread_body` tracks a declared body that was not consumed.
async fn read_request<R>(reader: &mut R, unread_body: &mut u64) -> Result<Option<Request>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);

    if read_line(reader, &mut line).await.map_err(HttpError::early)? == 0 {
        return Ok(None);
    }
    let first = std::str::from_utf8(&line)
        .map_err(|_| HttpError::bad_request("First line of the request is not utf-8").early())?;
    let request_line = parse_request_line(first)?;
    let method_token = request_line.method.to_string();
    let target = parse_target(request_line.target)?;
    info!("-> {} {}", method_token, target.path);

    let mut headers = HashMap::new();
    loop {
        if read_line(reader, &mut line).await? == 0 {
            return Err(HttpError::bad_request(
                "Connection closed before the end of the headers.",
            ));
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| HttpError::bad_request("Header line is not utf-8."))?;
        if strip_line_ending(text).is_empty() {
            break;
        }
        if headers.len() == MAX_HEADERS {
            return Err(HttpError::bad_request("Too many headers."));
        }
        let (name, value) = parse_header_line(text)?;
        headers.insert(name, value);
    }

    let form = match headers.get("content-length") {
        None => HashMap::new(),
        Some(raw) => {
            let length: u64 = raw.trim().parse().map_err(|_| {
                HttpError::bad_request(format!("Content-Length \"{raw}\" is not a number."))
            })?;
            *unread_body = length;
            if length == 0 {
                HashMap::new()
            } else {
                let body = read_body(reader, &headers, length).await?;
                *unread_body = 0;
                parse_form(&body)?
            }
        }
    };

    let method = Method::parse(&method_token).ok_or_else(|| {
        HttpError::not_implemented(format!("Method {method_token} is not implemented."))
    })?;

    Ok(Some(Request::new(method, target, headers, form)))
}

async fn read_body<R>(
    reader: &mut R,
    headers: &HashMap<String, String>,
    length: u64,
) -> Result<String, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    match headers.get("content-type") {
        Some(content_type) if is_form_content_type(content_type) => {}
        Some(content_type) => {
            return Err(HttpError::not_implemented(format!(
                "Content-Type \"{content_type}\" is not supported."
            )))
        }
        None => {
            return Err(HttpError::not_implemented(
                "Request body without a Content-Type is not supported.",
            ))
        }
    }
    if length > MAX_BODY_BYTES {
        return Err(HttpError::bad_request(format!(
            "Request body of {length} bytes exceeds the {MAX_BODY_BYTES} byte limit."
        )));
    }

    let mut body = Vec::new();
    if body.try_reserve_exact(length as usize).is_err() {
        error!("could not allocate {length} bytes for a request body");
        return Err(HttpError::out_of_memory(
            "Out of memory while reading the request body.",
        ));
    }
    reader
        .take(length)
        .read_to_end(&mut body)
        .await
        .map_err(|err| HttpError::bad_request(format!("Failed to read request body: {err}")))?;
    if (body.len() as u64) < length {
        return Err(HttpError::bad_request(
            "Connection closed before the end of the body.",
        ));
    }
    String::from_utf8(body).map_err(|_| HttpError::bad_request("Request body is not utf-8."))
}

/// Reads one `\n`-terminated line into `buf`, refusing lines longer than
/// `MAX_LINE_BYTES`. Returns 0 on end of stream.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = reader
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', buf)
        .await
        .map_err(|err| HttpError::bad_request(format!("Failed to read request: {err}")))?;
    if read == MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
        return Err(HttpError::bad_request(format!(
            "Request line longer than {MAX_LINE_BYTES} bytes."
        )));
    }
    Ok(read)
}

async fn serve_static(root: &Path, path: &str, response: &mut Response) -> Result<(), HttpError> {
    let not_found = || HttpError::not_found(format!("Path \"{path}\" not found"));

    let relative = match path.trim_start_matches('/') {
        "" => "index.html",
        relative => relative,
    };
    let relative = Path::new(relative);
    if relative.components().any(|part| !matches!(part, Component::Normal(_))) || path.contains('\\') {
        return Err(not_found());
    }

    let full = root.join(relative);
    let file = match tokio::fs::File::open(&full).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
        Err(err) => {
            return Err(HttpError::internal(format!(
                "Failed to open \"{path}\": {err}"
            )))
        }
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|err| HttpError::internal(format!("Failed to stat \"{path}\": {err}")))?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let content_type = full
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(content_type_for)
        .ok_or_else(|| HttpError::internal("Unsupported file extension type."))?;
    debug!("serving {} as {content_type}", full.display());
    response.send_file(file, metadata.len(), content_type).await
}

fn content_type_for(extension: &str) -> Option<&'static str> {
    let content_type = match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => return None,
    };
    Some(content_type)
}
