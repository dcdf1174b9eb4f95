// src/syscalls.rs
//
// Thin wrappers over the raw socket and epoll calls the engine lives on.
// Everything returns io::Result so callers can inspect raw errno values;
// the reactor's shutdown path depends on seeing EBADF/EINVAL unmangled.
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

// ---- Socket Operations ----

/// Create the listening TCP socket: IPv4, INADDR_ANY, non-blocking, with
/// SO_REUSEADDR and a one-second lingering close.
pub fn create_listen_socket(port: u16, backlog: usize) -> io::Result<c_int> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            libc::IPPROTO_TCP,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 1,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog.min(c_int::MAX as usize) as c_int) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Port the socket actually bound to. Needed when the configured port is 0.
pub fn local_port(fd: c_int) -> io::Result<u16> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(sin.sin_port))
    }
}

/// Accept one pending connection. `Ok(None)` means the queue is drained.
/// The child socket is created non-blocking.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            Ok(Some(fd))
        }
    }
}

pub fn shutdown_socket(fd: c_int) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// A write to a reset connection must surface as EPIPE, not kill the
/// process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn close_stdin() {
    unsafe {
        libc::close(libc::STDIN_FILENO);
    }
}

// ---- Non-blocking I/O ----

pub fn read(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

pub fn write(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Vectored write: response header and body in one syscall.
pub fn writev(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    const MAX_IOVECS: usize = 8;

    if bufs.is_empty() {
        return Ok(0);
    }

    let mut iovecs: [libc::iovec; MAX_IOVECS] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(MAX_IOVECS);

    for (iov, buf) in iovecs.iter_mut().zip(bufs) {
        iov.iov_base = buf.as_ptr() as *mut c_void;
        iov.iov_len = buf.len();
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Epoll Operations ----

/// An epoll set. `close` may be called from another thread to make a
/// blocked owner's next `epoll_wait` fail with EBADF; Drop stays idempotent
/// against that.
pub struct Epoll {
    fd: c_int,
    closed: AtomicBool,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                fd,
                closed: AtomicBool::new(false),
            })
        }
    }

    pub fn add(&self, fd: c_int, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: c_int, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Negative timeout blocks indefinitely. Errors come back raw,
    /// including EINTR.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: c_int) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(res as usize)
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        self.close();
    }
}
