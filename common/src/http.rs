//! Request model and the line-level HTTP parsers.
//!
//! Everything here works on one already-read line (or one already-read body)
//! at a time; the socket side lives in the `webnode` crate.

use std::{collections::HashMap, fmt};

use thiserror::Error;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
    NotImplemented,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Protocol error carried from any parsing/handling step to the connection
/// boundary, where it becomes the reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
    /// Raised before a `Request` existed; the reply cannot be negotiated.
    pub early: bool,
    pub out_of_memory: bool,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            early: false,
            out_of_memory: false,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::MethodNotAllowed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalServerError, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotImplemented, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self {
            out_of_memory: true,
            ..Self::internal(message)
        }
    }

    pub fn early(mut self) -> Self {
        self.early = true;
        self
    }

    /// Whether the reply must take the plain-text path.
    pub fn is_plain_only(&self) -> bool {
        self.early || self.out_of_memory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    pub fn new(
        method: Method,
        target: Target,
        headers: HashMap<String, String>,
        form: HashMap<String, String>,
    ) -> Self {
        Self {
            method,
            path: target.path,
            query: target.query,
            headers,
            form,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn form(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub path: String,
    pub query: HashMap<String, String>,
}

pub fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

pub fn parse_request_line(line: &str) -> Result<RequestLine<'_>, HttpError> {
    let line = strip_line_ending(line);
    let mut tokens = line.split(' ');
    match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(method), Some(target), Some(version), None)
            if !method.is_empty() && !target.is_empty() =>
        {
            Ok(RequestLine {
                method,
                target,
                version,
            })
        }
        _ => Err(HttpError::bad_request(format!(
            "First line of the request was malformed: \"{line}\""
        ))
        .early()),
    }
}

pub fn parse_target(target: &str) -> Result<Target, HttpError> {
    let mut parts = target.split('?');
    let path = parts.next().unwrap_or_default();
    let query = parts.next();
    if parts.next().is_some() {
        return Err(HttpError::bad_request(format!(
            "URL \"{target}\" is malformed, reason: more than one '?'"
        )));
    }

    let query = match query {
        Some(query) if !query.is_empty() => parse_pairs(query).map_err(|reason| {
            HttpError::bad_request(format!("URL \"{target}\" is malformed, reason: {reason}"))
        })?,
        _ => HashMap::new(),
    };

    Ok(Target {
        path: path.to_string(),
        query,
    })
}

/// Splits one header line into a lowercased name and its value.
///
/// Exactly one `": "` separator is accepted; nothing else is trimmed.
pub fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    let line = strip_line_ending(line);
    let mut parts = line.split(": ");
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(value), None) if !name.is_empty() => {
            Ok((name.to_ascii_lowercase(), value.to_string()))
        }
        _ => Err(HttpError::bad_request(format!(
            "Header \"{line}\" of the request was malformed."
        ))),
    }
}

pub fn parse_form(body: &str) -> Result<HashMap<String, String>, HttpError> {
    parse_pairs(body).map_err(|reason| {
        HttpError::bad_request(format!(
            "POST data=\"{body}\" not a valid {FORM_CONTENT_TYPE} string: {reason}"
        ))
    })
}

pub fn is_form_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

/// True when an `accept` header lists `application/json` or `*/*`,
/// ignoring quality parameters.
pub fn accepts_json(accept: &str) -> bool {
    accept
        .split(',')
        .filter_map(|entry| entry.split(';').next())
        .map(str::trim)
        .any(|media| media == JSON_CONTENT_TYPE || media == "*/*")
}

fn parse_pairs(raw: &str) -> Result<HashMap<String, String>, String> {
    let mut out = HashMap::new();
    for entry in raw.split('&') {
        let mut parts = entry.split('=');
        let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("pair \"{entry}\" is not key=value"));
        };
        out.insert(decode_component(key)?, decode_component(value)?);
    }
    Ok(out)
}

fn decode_component(raw: &str) -> Result<String, String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|err| format!("\"{raw}\" is not valid utf-8 once decoded ({err})"))
}
