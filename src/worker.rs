// src/worker.rs
//
// One reactor per CPU. A worker owns an epoll set over the fds the acceptor
// handed it, a death queue for idle reaping, and a logical tick clock that
// only advances when the poll times out.
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{debug, warn};

use crate::conn::Conn;
use crate::coro::{Coro, Resume};
use crate::server::Shared;
use crate::syscalls::{self, Epoll};

/// Interest while waiting for a request: edge-triggered reads.
pub(crate) const READ_EVENTS: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLERR | libc::EPOLLET) as u32;

/// Interest while a coroutine is blocked writing its response.
pub(crate) const WRITE_EVENTS: u32 =
    (libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;

const HANGUP_EVENTS: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32;

/// Fixed-capacity ring of fds awaiting timeout reap. Enrollment order is
/// activity order, which keeps deadlines non-decreasing from `first` to
/// `last`; the reaper can stop at the first unexpired entry.
pub(crate) struct DeathQueue {
    ring: Box<[RawFd]>,
    first: usize,
    last: usize,
    population: usize,
}

impl DeathQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ring: vec![0; capacity.max(1)].into_boxed_slice(),
            first: 0,
            last: 0,
            population: 0,
        }
    }

    pub(crate) fn push(&mut self, fd: RawFd) {
        self.ring[self.last] = fd;
        self.last = (self.last + 1) % self.ring.len();
        self.population += 1;
    }

    pub(crate) fn peek(&self) -> Option<RawFd> {
        if self.population == 0 {
            None
        } else {
            Some(self.ring[self.first])
        }
    }

    pub(crate) fn pop(&mut self) -> Option<RawFd> {
        let fd = self.peek()?;
        self.first = (self.first + 1) % self.ring.len();
        self.population -= 1;
        Some(fd)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.population == 0
    }
}

pub(crate) struct Worker {
    id: usize,
    epoll: Arc<Epoll>,
    shared: Arc<Shared>,
    max_fd: usize,
    tick: u32,
    death_queue: DeathQueue,
}

impl Worker {
    pub(crate) fn new(id: usize, epoll: Arc<Epoll>, shared: Arc<Shared>, max_fd: usize) -> Self {
        Self {
            id,
            epoll,
            shared,
            max_fd,
            tick: 0,
            death_queue: DeathQueue::new(max_fd),
        }
    }

    pub(crate) fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_fd];

        debug!("worker {} entering event loop", self.id);

        loop {
            // Sleep forever while nothing can expire; otherwise wake every
            // second to advance the reaper clock.
            let timeout = if self.death_queue.is_empty() { -1 } else { 1000 };

            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => match e.raw_os_error() {
                    // The epoll set was destroyed by shutdown.
                    Some(libc::EBADF) | Some(libc::EINVAL) => break,
                    _ => continue,
                },
            };

            if n == 0 {
                self.tick = self.tick.wrapping_add(1);
                self.reap_expired(&shared);
            } else {
                for i in 0..n {
                    let (ev, fd) = (events[i].events, events[i].u64 as RawFd);
                    self.dispatch(&shared, ev, fd);
                }
            }
        }

        self.drain(&shared);
        debug!("worker {} exiting", self.id);
    }

    fn dispatch(&mut self, shared: &Shared, events: u32, fd: RawFd) {
        let conn = unsafe { shared.table.slot(fd) };

        if events & HANGUP_EVENTS != 0 {
            Self::handle_hangup(conn);
            return;
        }

        Self::cleanup_coro(conn);
        Self::spawn_coro_if_needed(conn);
        self.resume_coro_if_needed(conn, shared);

        // An unfinished coroutine or a keep-alive connection earns the full
        // timeout; anything else is marked for the next reaper pass.
        if conn.flags.is_keep_alive || conn.flags.should_resume_coro {
            conn.time_to_die = self.tick.wrapping_add(shared.config.keep_alive_timeout);
        } else {
            conn.time_to_die = self.tick;
        }

        if !conn.flags.alive {
            self.death_queue.push(fd);
            conn.flags.alive = true;
        }
    }

    /// The fd is closed here; the death-queue entry, if any, becomes a
    /// tombstone. The parked coroutine is not freed here but by the next
    /// cleanup pass or by the reaper.
    fn handle_hangup(conn: &mut Conn) {
        conn.flags.alive = false;
        conn.flags.should_resume_coro = false;
        syscalls::close(conn.fd);
    }

    /// Drop the coroutine of a finished request. One that still wants to be
    /// resumed stays.
    fn cleanup_coro(conn: &mut Conn) {
        if conn.flags.should_resume_coro {
            return;
        }
        conn.coro = None;
    }

    fn spawn_coro_if_needed(conn: &mut Conn) {
        if conn.coro.is_some() {
            return;
        }
        conn.coro = Some(Box::new(Coro::new()));
        conn.flags.should_resume_coro = true;
        conn.flags.write_events = false;
    }

    fn resume_coro_if_needed(&self, conn: &mut Conn, shared: &Shared) {
        if !conn.flags.should_resume_coro {
            return;
        }
        let mut coro = match conn.coro.take() {
            Some(coro) => coro,
            None => return,
        };
        let result = coro.resume(conn, shared);
        conn.coro = Some(coro);
        conn.flags.should_resume_coro = result == Resume::Yielded;

        // Yield means the coroutine's I/O interest flipped; reprogram the
        // fd when the recorded interest no longer matches.
        if conn.flags.should_resume_coro == conn.flags.write_events {
            return;
        }

        let events = if conn.flags.write_events {
            READ_EVENTS
        } else {
            WRITE_EVENTS
        };
        if let Err(e) = self.epoll.modify(conn.fd, events) {
            // The connection may wedge; nothing to do beyond reporting.
            warn!("worker {}: epoll_ctl(MOD) on fd {}: {}", self.id, conn.fd, e);
        }
        conn.flags.write_events = !conn.flags.write_events;
    }

    fn reap_expired(&mut self, shared: &Shared) {
        while let Some(fd) = self.death_queue.peek() {
            let conn = unsafe { shared.table.slot(fd) };

            // Enrollment order implies non-decreasing deadlines; stop at
            // the first entry still in the future.
            if conn.time_to_die > self.tick {
                break;
            }
            self.death_queue.pop();

            // Hangups leave tombstones: the fd is already closed and its
            // number may have been reissued to another worker, so the slot
            // must not be touched beyond this check.
            if !conn.flags.alive {
                continue;
            }

            // No coroutine is mid-step while the reaper runs, so a parked
            // machine can be dropped outright.
            conn.coro = None;
            conn.flags.should_resume_coro = false;

            conn.flags.alive = false;
            syscalls::close(conn.fd);
        }
    }

    /// Close everything this worker still tracks. Runs once the epoll set
    /// is gone.
    fn drain(&mut self, shared: &Shared) {
        while let Some(fd) = self.death_queue.pop() {
            let conn = unsafe { shared.table.slot(fd) };
            // Same rule as the reaper: tombstoned slots may already belong
            // to another worker and must be left alone.
            if !conn.flags.alive {
                continue;
            }
            conn.coro = None;
            conn.flags.should_resume_coro = false;
            conn.flags.alive = false;
            syscalls::close(conn.fd);
        }
    }
}
