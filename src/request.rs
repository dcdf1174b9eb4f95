// src/request.rs
//
// The request-processing side of the engine: parse the request head, find
// the route, run the handler, leave the body bytes in the connection's
// response buffer. The reactor never looks inside this; it only drives the
// coroutine that calls process().
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::error;

use crate::conn::{Conn, QueryParam};
use crate::http::{Method, Response, Status};
use crate::router::ParseFlags;
use crate::server::Shared;

/// The parsed request view handed to handlers.
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query_params: &'a [QueryParam],
}

impl<'a> Request<'a> {
    /// First query parameter with the given key, in URL order.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Everything the transmit phase needs to frame the response.
pub(crate) struct ProcessOutcome {
    pub status_code: u16,
    pub mime_type: &'static str,
    pub keep_alive: bool,
    pub head_only: bool,
}

#[derive(Debug)]
struct Head<'a> {
    method: Method,
    path: &'a str,
    query: Option<&'a str>,
    http11: bool,
    /// Explicit Connection directive: Some(true) keep-alive, Some(false)
    /// close, None absent.
    connection: Option<bool>,
}

impl Head<'_> {
    fn keep_alive(&self) -> bool {
        // HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
        self.connection.unwrap_or(self.http11)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// True once the buffer holds a complete request head.
pub(crate) fn head_complete(buf: &[u8]) -> bool {
    find(buf, b"\r\n\r\n").is_some()
}

fn trim_spaces(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn parse_head(buf: &[u8]) -> Result<Head<'_>, Status> {
    let head_len = find(buf, b"\r\n\r\n").ok_or(Status::BadRequest)?;
    let head = &buf[..head_len];

    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let mut parts = head[..line_end].split(|&b| b == b' ').filter(|p| !p.is_empty());

    let method_bytes = parts.next().ok_or(Status::BadRequest)?;
    let target = parts.next().ok_or(Status::BadRequest)?;
    let version = parts.next().ok_or(Status::BadRequest)?;
    if parts.next().is_some() {
        return Err(Status::BadRequest);
    }

    let http11 = match version {
        b"HTTP/1.1" => true,
        b"HTTP/1.0" => false,
        _ => return Err(Status::BadRequest),
    };

    let method = Method::from_bytes(method_bytes);
    if method == Method::Unknown {
        return Err(Status::NotAllowed);
    }

    let target = std::str::from_utf8(target).map_err(|_| Status::BadRequest)?;
    if !target.starts_with('/') {
        return Err(Status::BadRequest);
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    // Only the Connection header matters at this layer.
    let mut connection = None;
    let mut rest = if line_end + 2 <= head.len() {
        &head[line_end + 2..]
    } else {
        &head[..0]
    };
    while !rest.is_empty() {
        let (line, next) = match find(rest, b"\r\n") {
            Some(pos) => (&rest[..pos], &rest[pos + 2..]),
            None => (rest, &rest[..0]),
        };
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(b"connection") {
                let value = trim_spaces(&line[colon + 1..]);
                if value.eq_ignore_ascii_case(b"close") {
                    connection = Some(false);
                } else if value.eq_ignore_ascii_case(b"keep-alive") {
                    connection = Some(true);
                }
            }
        }
        rest = next;
    }

    Ok(Head {
        method,
        path,
        query,
        http11,
        connection,
    })
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Query string into ordered pairs, percent-decoded.
pub(crate) fn parse_query_string(query: &str) -> Vec<QueryParam> {
    let mut params = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        params.push((url_decode(key), url_decode(value)));
    }
    params
}

fn default_body(conn: &mut Conn, status: Status) {
    conn.buffer.clear();
    conn.buffer
        .extend_from_slice(status.as_descriptive_str().as_bytes());
    conn.buffer.push(b'\n');
}

/// Generated error response that also gives up on the connection.
pub(crate) fn error_response(conn: &mut Conn, status: Status) -> ProcessOutcome {
    default_body(conn, status);
    ProcessOutcome {
        status_code: status.code(),
        mime_type: "text/plain",
        keep_alive: false,
        head_only: false,
    }
}

/// Run one request: parse, route, invoke the handler. The body ends up in
/// `conn.buffer`; the returned outcome describes how to frame it.
pub(crate) fn process(conn: &mut Conn, head: &[u8], shared: &Shared) -> ProcessOutcome {
    let parsed = match parse_head(head) {
        Ok(parsed) => parsed,
        // A request we could not parse poisons the stream; close it.
        Err(status) => return error_response(conn, status),
    };

    shared.metrics.record_request();

    let keep_alive = parsed.keep_alive();
    let head_only = parsed.method == Method::Head;

    let route = match shared.router.lookup(parsed.path) {
        Some(route) => route,
        None => {
            default_body(conn, Status::NotFound);
            return ProcessOutcome {
                status_code: Status::NotFound.code(),
                mime_type: "text/plain",
                keep_alive,
                head_only,
            };
        }
    };

    if route.flags().contains(ParseFlags::QUERY_STRING) {
        if let Some(query) = parsed.query {
            let params = parse_query_string(query);
            if !params.is_empty() {
                conn.query_params = Cow::Owned(params);
            }
        }
    }

    let request = Request {
        method: parsed.method,
        path: parsed.path,
        query_params: &conn.query_params,
    };
    let mut response = Response {
        buffer: &mut conn.buffer,
        mime_type: "text/plain",
    };

    let result = catch_unwind(AssertUnwindSafe(|| {
        (route.callback())(&request, &mut response, route.state())
    }));
    let mime_type = response.mime_type;

    match result {
        Ok(status) => {
            if status.code() >= 400 && conn.buffer.is_empty() {
                default_body(conn, status);
                return ProcessOutcome {
                    status_code: status.code(),
                    mime_type: "text/plain",
                    keep_alive,
                    head_only,
                };
            }
            ProcessOutcome {
                status_code: status.code(),
                mime_type,
                keep_alive,
                head_only,
            }
        }
        Err(_) => {
            error!("handler for {} panicked", route.prefix());
            default_body(conn, Status::InternalError);
            ProcessOutcome {
                status_code: Status::InternalError.code(),
                mime_type: "text/plain",
                keep_alive,
                head_only,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::router::{HandlerState, Mount, Router};
    use crate::server::Config;
    use crate::slab::ConnTable;

    fn shared_with(mounts: Vec<Mount>) -> Shared {
        let mut router = Router::new();
        router.rebuild(mounts);
        Shared {
            table: ConnTable::new(4, 16),
            router,
            config: Config::default(),
            metrics: Metrics::default(),
        }
    }

    #[test]
    fn parses_request_line_and_query() {
        let head = parse_head(b"GET /a/b?x=1&y=2 HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path, "/a/b");
        assert_eq!(head.query, Some("x=1&y=2"));
        assert!(head.http11);
        assert!(head.keep_alive());
    }

    #[test]
    fn keep_alive_follows_version_and_connection_header() {
        let close11 = parse_head(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!close11.keep_alive());

        let plain10 = parse_head(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!plain10.keep_alive());

        let ka10 = parse_head(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(ka10.keep_alive());
    }

    #[test]
    fn rejects_malformed_heads() {
        assert_eq!(
            parse_head(b"GET /\r\n\r\n").unwrap_err(),
            Status::BadRequest
        );
        assert_eq!(
            parse_head(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            Status::BadRequest
        );
        assert_eq!(
            parse_head(b"GET nopath HTTP/1.1\r\n\r\n").unwrap_err(),
            Status::BadRequest
        );
        assert_eq!(
            parse_head(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap_err(),
            Status::NotAllowed
        );
    }

    #[test]
    fn head_completion_detection() {
        assert!(!head_complete(b"GET / HTTP/1.1\r\nHost: h\r\n"));
        assert!(head_complete(b"GET / HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn query_string_decoding() {
        let params = parse_query_string("a=1&b=hello+world&c=%2Fetc&broken=%zz&flag");
        assert_eq!(params[0], ("a".to_string(), "1".to_string()));
        assert_eq!(params[1], ("b".to_string(), "hello world".to_string()));
        assert_eq!(params[2], ("c".to_string(), "/etc".to_string()));
        assert_eq!(params[3], ("broken".to_string(), "%zz".to_string()));
        assert_eq!(params[4], ("flag".to_string(), "".to_string()));
    }

    fn echo_query(req: &Request, resp: &mut Response, _state: Option<&HandlerState>) -> Status {
        let value = req.query_param("name").unwrap_or("nobody");
        resp.buffer.extend_from_slice(value.as_bytes());
        Status::Ok
    }

    #[test]
    fn process_routes_and_pre_parses_query() {
        let shared = shared_with(vec![Mount::callback("/hello", echo_query)]);
        let mut conn = Conn::new(3, 64);

        let outcome = process(
            &mut conn,
            b"GET /hello?name=tern HTTP/1.1\r\nHost: h\r\n\r\n",
            &shared,
        );

        assert_eq!(outcome.status_code, 200);
        assert!(outcome.keep_alive);
        assert!(!outcome.head_only);
        assert_eq!(conn.buffer, b"tern");
        assert_eq!(shared.metrics.snapshot().requests, 1);
    }

    #[test]
    fn process_misses_fall_back_to_not_found() {
        let shared = shared_with(vec![]);
        let mut conn = Conn::new(3, 64);

        let outcome = process(&mut conn, b"GET /nowhere HTTP/1.1\r\n\r\n", &shared);

        assert_eq!(outcome.status_code, 404);
        // Router misses do not poison the connection.
        assert!(outcome.keep_alive);
        assert_eq!(
            conn.buffer,
            b"The requested resource could not be found on this server.\n"
        );
    }

    #[test]
    fn process_rejects_garbage_and_closes() {
        let shared = shared_with(vec![]);
        let mut conn = Conn::new(3, 64);

        let outcome = process(&mut conn, b"garbage\r\n\r\n", &shared);

        assert_eq!(outcome.status_code, 400);
        assert!(!outcome.keep_alive);
    }

    fn panicking(_req: &Request, _resp: &mut Response, _state: Option<&HandlerState>) -> Status {
        panic!("handler bug");
    }

    #[test]
    fn handler_panics_become_internal_errors() {
        let shared = shared_with(vec![Mount::callback("/boom", panicking)]);
        let mut conn = Conn::new(3, 64);

        let outcome = process(&mut conn, b"GET /boom HTTP/1.1\r\n\r\n", &shared);

        assert_eq!(outcome.status_code, 500);
        assert!(outcome.keep_alive);
        assert!(!conn.buffer.is_empty());
    }

    #[test]
    fn head_requests_suppress_the_body_but_keep_its_length() {
        let shared = shared_with(vec![Mount::callback("/hello", echo_query)]);
        let mut conn = Conn::new(3, 64);

        let outcome = process(&mut conn, b"HEAD /hello HTTP/1.1\r\n\r\n", &shared);

        assert_eq!(outcome.status_code, 200);
        assert!(outcome.head_only);
        assert_eq!(conn.buffer, b"nobody");
    }
}
