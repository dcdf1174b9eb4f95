// src/conn.rs
use std::borrow::Cow;
use std::os::unix::io::RawFd;

use crate::coro::Coro;

/// One query-string pair, in the order it appeared in the URL.
pub type QueryParam = (String, String);

/// Shared empty query set. The reset path rebinds this instead of
/// allocating when a request carries no query string.
pub static EMPTY_QUERY_PARAMS: &[QueryParam] = &[];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnFlags {
    /// The reactor tracks this fd: it is enrolled in the death queue and
    /// the OS descriptor is open.
    pub alive: bool,
    /// The last coroutine step indicated it is not finished.
    pub should_resume_coro: bool,
    /// The currently programmed epoll interest is write readiness;
    /// read readiness otherwise.
    pub write_events: bool,
    /// The in-progress or completed request asked for keep-alive.
    pub is_keep_alive: bool,
}

/// Per-connection state. Lives in the fd-indexed table; the slot index is
/// the fd itself.
pub struct Conn {
    pub fd: RawFd,
    pub coro: Option<Box<Coro>>,
    /// Response body buffer. Allocated once when the table is built,
    /// cleared between requests, never replaced.
    pub buffer: Vec<u8>,
    pub query_params: Cow<'static, [QueryParam]>,
    pub flags: ConnFlags,
    /// Tick at which the death queue reaps this fd absent further activity.
    pub time_to_die: u32,
}

impl Conn {
    pub(crate) fn new(fd: RawFd, buffer_capacity: usize) -> Self {
        Self {
            fd,
            coro: None,
            buffer: Vec::with_capacity(buffer_capacity),
            query_params: Cow::Borrowed(EMPTY_QUERY_PARAMS),
            flags: ConnFlags::default(),
            time_to_die: 0,
        }
    }

    /// Per-request reset. Keeps the fd, the coroutine slot and the response
    /// buffer allocation; everything else returns to its zero state and an
    /// owned query set is dropped in favor of the shared empty one.
    pub fn reset(&mut self) {
        self.buffer.clear();
        if let Cow::Owned(_) = self.query_params {
            self.query_params = Cow::Borrowed(EMPTY_QUERY_PARAMS);
        }
        self.flags = ConnFlags::default();
        self.time_to_die = 0;
    }
}
