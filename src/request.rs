use std::io::Write;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{self, HeaderMap, HeaderName, Method, StatusCode, Uri, Version, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::StreamExt;

/// The request body as buffered by [`buffer_body`], kept in the request
/// extensions for anyone who needs it after the body stream was consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBody(pub String);

impl RawBody {
    pub fn of<B>(req: &http::Request<B>) -> Option<&str> {
        req.extensions().get::<RawBody>().map(RawBody::as_str)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Everything about a request except its body stream.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    raw_body: Option<RawBody>,
}

impl RequestSnapshot {
    pub fn capture<B>(req: &http::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            raw_body: req.extensions().get::<RawBody>().cloned(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The buffered raw body, or an empty string when nothing stashed one.
    pub fn raw_body(&self) -> &str {
        self.raw_body.as_ref().map_or("", RawBody::as_str)
    }

    /// Renders the request line and headers the way they would appear on an
    /// HTTP/1.1 connection, without the body.
    pub fn dump(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let target = self.uri.path_and_query().map_or("/", |pq| pq.as_str());

        let _ = write!(buf, "{} {} {:?}\r\n", self.method, target, self.version);

        let host = self
            .headers
            .get(header::HOST)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .or_else(|| self.uri.authority().map(ToString::to_string));
        if let Some(host) = host {
            let _ = write!(buf, "Host: {host}\r\n");
        }

        for (name, value) in &self.headers {
            if is_excluded(name) {
                continue;
            }
            let _ = write!(
                buf,
                "{}: {}\r\n",
                canonical_header_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes())
            );
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

// Host is written first; the others describe framing, not the request.
fn is_excluded(name: &HeaderName) -> bool {
    *name == header::HOST || *name == header::TRANSFER_ENCODING || *name == header::TRAILER
}

/// `content-type` -> `Content-Type`
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct BodyLimit(pub usize);

/// Middleware that reads the whole request body, stashes it as [`RawBody`]
/// and passes the request on with an identical body.
///
/// Bodies larger than the limit are answered with `413 Payload Too Large`.
pub async fn buffer_body(State(limit): State<BodyLimit>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();

    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!(error = %err, "failed to read request body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        if buf.len() + chunk.len() > limit.0 {
            tracing::debug!(limit = limit.0, "request body exceeds limit");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        buf.extend_from_slice(&chunk);
    }

    let bytes = buf.freeze();
    parts
        .extensions
        .insert(RawBody(String::from_utf8_lossy(&bytes).into_owned()));
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
