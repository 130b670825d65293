//! WebSocket opening handshake
//!
//! Validation of the HTTP/1.1 upgrade request (RFC 6455 section 4.2), the
//! `Sec-WebSocket-Accept` computation, permessage-deflate negotiation and
//! serialization of the response head. Requests and responses are plain
//! `http` types so any HTTP front-end can drive the handshake.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Version};
use sha1::{Digest, Sha1};

use crate::deflate::{self, DeflateConfig};
use crate::error::{Error, Result};
use crate::{Config, WS_GUID};

/// Maximum HTTP request head size (8KB should be enough for any reasonable request)
pub const MAX_HEADER_SIZE: usize = 8192;

/// Maximum number of request headers
const MAX_HEADERS: usize = 64;

/// Supported `Sec-WebSocket-Version`
const WS_VERSION: &str = "13";

/// A request that passed validation
#[derive(Debug)]
pub struct Accepted {
    /// The 101 response to send
    pub response: Response<()>,
    /// Negotiated permessage-deflate parameters
    pub deflate: Option<DeflateConfig>,
}

/// Validate an upgrade request
///
/// Returns the 101 response and negotiated compression on success, or the
/// rejection response to send instead.
pub fn validate(
    request: &Request<()>,
    config: &Config,
) -> std::result::Result<Accepted, Response<()>> {
    let headers = request.headers();

    if request.method() != Method::GET {
        let mut response = reject(StatusCode::METHOD_NOT_ALLOWED);
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET"));
        return Err(response);
    }

    if request.version() != Version::HTTP_11 {
        return Err(reject(StatusCode::HTTP_VERSION_NOT_SUPPORTED));
    }

    if has_body(headers) {
        let mut response = reject(StatusCode::BAD_REQUEST);
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        return Err(response);
    }

    if !has_token(headers, &header::UPGRADE, "websocket")
        || !has_token(headers, &header::CONNECTION, "upgrade")
    {
        let mut response = reject(StatusCode::UPGRADE_REQUIRED);
        response
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        return Err(response);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| is_valid_key(key))
        .ok_or_else(|| reject(StatusCode::BAD_REQUEST))?;

    if !has_token(headers, &header::SEC_WEBSOCKET_VERSION, WS_VERSION) {
        let mut response = reject(StatusCode::BAD_REQUEST);
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WS_VERSION),
        );
        return Err(response);
    }

    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .is_ok_and(|origin| config.origin_allowed(origin));
        if !allowed {
            return Err(reject(StatusCode::FORBIDDEN));
        }
    }

    let deflate = if config.compression {
        negotiate_deflate(headers, &config.deflate)
    } else {
        None
    };

    let accept = HeaderValue::from_str(&generate_accept_key(key))
        .map_err(|_| reject(StatusCode::BAD_REQUEST))?;

    let mut response = Response::new(());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response_headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    response_headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);

    if let Some(deflate) = &deflate {
        let line = HeaderValue::from_str(&deflate.to_response_header())
            .map_err(|_| reject(StatusCode::INTERNAL_SERVER_ERROR))?;
        response_headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, line);
    }

    Ok(Accepted { response, deflate })
}

/// Build an empty response with the given status
pub fn reject(status: StatusCode) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = status;
    response
}

fn has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }

    headers.get_all(header::CONTENT_LENGTH).iter().any(|value| {
        value
            .to_str()
            .ok()
            .and_then(|len| len.trim().parse::<u64>().ok())
            .is_none_or(|len| len > 0)
    })
}

/// Check a comma-separated header for a token, ignoring case
fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// A key must be the base64 encoding of 16 bytes
fn is_valid_key(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .is_ok_and(|raw| raw.len() == 16)
}

fn negotiate_deflate(headers: &HeaderMap, local: &DeflateConfig) -> Option<DeflateConfig> {
    headers
        .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| deflate::negotiate(value, local))
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Parse an HTTP/1.x request head
///
/// Returns the request and the number of bytes it occupied, or `None` if the
/// head is not complete yet.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(Error::InvalidHttp("request head too large"));
            }
            return Ok(None);
        }
        Err(_) => return Err(Error::InvalidHttp("failed to parse HTTP request")),
    };

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(Error::InvalidHttp("invalid method"))?;
    let version = match req.version {
        Some(1) => Version::HTTP_11,
        _ => Version::HTTP_10,
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(req.path.unwrap_or("/"))
        .version(version);

    for h in req.headers.iter() {
        builder = builder.header(h.name, h.value);
    }

    let request = builder
        .body(())
        .map_err(|_| Error::InvalidHttp("invalid request head"))?;

    Ok(Some((request, len)))
}

/// Serialize a response head
///
/// Responses other than 101 get `Content-Length: 0` unless they carry one.
pub fn encode_response(response: &Response<()>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    let status = response.status();

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in response.headers() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if status != StatusCode::SWITCHING_PROTOCOLS
        && !response.headers().contains_key(header::CONTENT_LENGTH)
    {
        buf.put_slice(b"content-length: 0\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Copy the head of a request
pub(crate) fn request_head(request: &Request<()>) -> Request<()> {
    let mut copy = Request::new(());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}
