// src/coro.rs
//
// One request's progress on one connection, as a cooperatively-scheduled
// unit. The stackful original becomes a state machine: the reactor's resume
// drives it one step, and a step that cannot finish writing suspends with
// Yielded so the reactor can flip the fd to write readiness.
use std::io;

use crate::conn::Conn;
use crate::http::{status_as_string, Status};
use crate::request::{self, ProcessOutcome};
use crate::server::Shared;
use crate::syscalls;

/// Space for one request head. Anything longer is answered with 413.
pub const REQUEST_BUFFER_SIZE: usize = 4096;

const RESPONSE_HEAD_MAX: usize = 512;

/// Outcome of driving a coroutine until its next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Not finished: blocked writing the response, wants write readiness.
    Yielded,
    /// The request is over; a new coroutine handles the next one.
    Finished,
}

enum Phase {
    Receive,
    Transmit(Wire),
}

/// Pre-rendered response head plus transmit progress. A single offset runs
/// across the virtual concatenation of head and body so partial writes
/// resume exactly where they stopped.
struct Wire {
    headers: [u8; RESPONSE_HEAD_MAX],
    header_len: usize,
    written: usize,
    head_only: bool,
}

impl Wire {
    fn new(outcome: &ProcessOutcome, body_len: usize) -> Self {
        let mut headers = [0u8; RESPONSE_HEAD_MAX];
        let mut pos = 0;

        let mime = if outcome.mime_type.len() > 128 {
            "application/octet-stream"
        } else {
            outcome.mime_type
        };

        append(&mut headers, &mut pos, b"HTTP/1.1 ");
        append_decimal(&mut headers, &mut pos, outcome.status_code as usize);
        append(&mut headers, &mut pos, b" ");
        append(
            &mut headers,
            &mut pos,
            status_as_string(outcome.status_code).as_bytes(),
        );
        append(&mut headers, &mut pos, b"\r\nContent-Type: ");
        append(&mut headers, &mut pos, mime.as_bytes());
        append(&mut headers, &mut pos, b"\r\nContent-Length: ");
        append_decimal(&mut headers, &mut pos, body_len);
        if outcome.keep_alive {
            append(&mut headers, &mut pos, b"\r\nConnection: keep-alive\r\n\r\n");
        } else {
            append(&mut headers, &mut pos, b"\r\nConnection: close\r\n\r\n");
        }

        Wire {
            headers,
            header_len: pos,
            written: 0,
            head_only: outcome.head_only,
        }
    }
}

fn append(dst: &mut [u8], pos: &mut usize, src: &[u8]) {
    dst[*pos..*pos + src.len()].copy_from_slice(src);
    *pos += src.len();
}

fn append_decimal(dst: &mut [u8], pos: &mut usize, mut n: usize) {
    let mut digits = [0u8; 20];
    let mut i = 0;
    if n == 0 {
        digits[0] = b'0';
        i = 1;
    } else {
        while n > 0 {
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
            i += 1;
        }
        digits[..i].reverse();
    }
    append(dst, pos, &digits[..i]);
}

/// A per-request coroutine. Created when activity arrives on a connection
/// with no coroutine, dropped once a step reports Finished.
pub struct Coro {
    phase: Phase,
    buf: [u8; REQUEST_BUFFER_SIZE],
    len: usize,
}

impl Coro {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Receive,
            buf: [0; REQUEST_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Drive the request to its next suspension point. The first step
    /// resets the connection, as the coroutine entry always did.
    pub(crate) fn resume(&mut self, conn: &mut Conn, shared: &Shared) -> Resume {
        if matches!(self.phase, Phase::Receive) {
            let outcome = match self.receive(conn, shared) {
                Some(outcome) => outcome,
                None => return Resume::Finished,
            };
            conn.flags.is_keep_alive = outcome.keep_alive;
            let wire = Wire::new(&outcome, conn.buffer.len());
            self.phase = Phase::Transmit(wire);
        }
        self.transmit(conn, shared)
    }

    /// Drain the socket and process what arrived. None means there is
    /// nothing to answer (EOF, spurious wakeup, or a read error).
    fn receive(&mut self, conn: &mut Conn, shared: &Shared) -> Option<ProcessOutcome> {
        conn.reset();

        loop {
            if self.len == self.buf.len() {
                return Some(request::error_response(conn, Status::TooLarge));
            }
            match syscalls::read(conn.fd, &mut self.buf[self.len..]) {
                Ok(0) => return None,
                Ok(n) => {
                    self.len += n;
                    if request::head_complete(&self.buf[..self.len]) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.len == 0 {
                        return None;
                    }
                    // Partial head with nothing more coming this wakeup;
                    // the parser rejects it.
                    break;
                }
                Err(_) => return None,
            }
        }

        Some(request::process(conn, &self.buf[..self.len], shared))
    }

    fn transmit(&mut self, conn: &mut Conn, shared: &Shared) -> Resume {
        let wire = match &mut self.phase {
            Phase::Transmit(wire) => wire,
            Phase::Receive => return Resume::Finished,
        };
        let body: &[u8] = if wire.head_only { &[] } else { &conn.buffer };

        loop {
            let total = wire.header_len + body.len();
            if wire.written >= total {
                return Resume::Finished;
            }

            let result = if wire.written < wire.header_len {
                syscalls::writev(
                    conn.fd,
                    &[&wire.headers[wire.written..wire.header_len], body],
                )
            } else {
                syscalls::write(conn.fd, &body[wire.written - wire.header_len..])
            };

            match result {
                Ok(0) => {
                    conn.flags.is_keep_alive = false;
                    return Resume::Finished;
                }
                Ok(n) => {
                    wire.written += n;
                    shared.metrics.record_bytes(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Resume::Yielded,
                Err(_) => {
                    conn.flags.is_keep_alive = false;
                    return Resume::Finished;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::metrics::Metrics;
    use crate::request::Request;
    use crate::router::{HandlerState, Mount, Router};
    use crate::server::Config;
    use crate::slab::ConnTable;

    fn wire_head(outcome: &ProcessOutcome, body_len: usize) -> String {
        let wire = Wire::new(outcome, body_len);
        String::from_utf8(wire.headers[..wire.header_len].to_vec()).unwrap()
    }

    #[test]
    fn wire_renders_the_exact_head() {
        let outcome = ProcessOutcome {
            status_code: 200,
            mime_type: "text/plain",
            keep_alive: true,
            head_only: false,
        };
        assert_eq!(
            wire_head(&outcome, 5),
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\n"
        );

        let outcome = ProcessOutcome {
            status_code: 404,
            mime_type: "text/plain",
            keep_alive: false,
            head_only: false,
        };
        assert_eq!(
            wire_head(&outcome, 0),
            "HTTP/1.1 404 Not found\r\nContent-Type: text/plain\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn decimal_rendering() {
        let mut buf = [0u8; 32];
        let mut pos = 0;
        append_decimal(&mut buf, &mut pos, 0);
        append(&mut buf, &mut pos, b"|");
        append_decimal(&mut buf, &mut pos, 10240);
        assert_eq!(&buf[..pos], b"0|10240");
    }

    fn hello(_req: &Request, resp: &mut Response, _state: Option<&HandlerState>) -> Status {
        resp.buffer.extend_from_slice(b"hello");
        Status::Ok
    }

    fn test_shared() -> Shared {
        let mut router = Router::new();
        router.rebuild(vec![Mount::callback("/", hello)]);
        Shared {
            table: ConnTable::new(4, 16),
            router,
            config: Config::default(),
            metrics: Metrics::default(),
        }
    }

    fn socketpair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn drain(fd: i32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match syscalls::read(fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn one_shot_request_finishes_in_a_single_step() {
        let shared = test_shared();
        let (fd, peer) = socketpair();
        let mut conn = Conn::new(fd, 64);

        let request = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";
        assert_eq!(syscalls::write(peer, request).unwrap(), request.len());

        let mut coro = Coro::new();
        assert_eq!(coro.resume(&mut conn, &shared), Resume::Finished);
        assert!(conn.flags.is_keep_alive);

        let response = drain(peer);
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\nhello"
        );

        syscalls::close(fd);
        syscalls::close(peer);
    }

    #[test]
    fn connection_close_request_disables_keep_alive() {
        let shared = test_shared();
        let (fd, peer) = socketpair();
        let mut conn = Conn::new(fd, 64);

        let request = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        assert_eq!(syscalls::write(peer, request).unwrap(), request.len());

        let mut coro = Coro::new();
        assert_eq!(coro.resume(&mut conn, &shared), Resume::Finished);
        assert!(!conn.flags.is_keep_alive);

        let response = drain(peer);
        assert!(response.starts_with(b"HTTP/1.1 200 OK"));
        assert!(String::from_utf8(response)
            .unwrap()
            .contains("Connection: close"));

        syscalls::close(fd);
        syscalls::close(peer);
    }

    #[test]
    fn eof_before_any_data_finishes_without_a_response() {
        let shared = test_shared();
        let (fd, peer) = socketpair();
        syscalls::close(peer);

        let mut conn = Conn::new(fd, 64);
        let mut coro = Coro::new();
        assert_eq!(coro.resume(&mut conn, &shared), Resume::Finished);
        assert!(!conn.flags.is_keep_alive);

        syscalls::close(fd);
    }
}
