// src/slab.rs
use std::cell::UnsafeCell;
use std::io;
use std::os::unix::io::RawFd;

use crate::conn::Conn;
use crate::error::{TernError, TernResult};

/// Flat per-fd connection table, indexed directly by descriptor number.
///
/// There is no free list and no hashing: the OS fd allocator is the free
/// list. One instance exists per process and is shared by every worker;
/// round-robin dispatch guarantees each fd is driven by exactly one worker,
/// so slots are never aliased across threads.
pub struct ConnTable {
    slots: Box<[UnsafeCell<Conn>]>,
}

// Slots are handed out per fd, and each fd belongs to a single worker.
unsafe impl Sync for ConnTable {}

impl ConnTable {
    /// Table with an explicit capacity. Every slot is pre-seeded with its
    /// own fd number and a pre-allocated response buffer.
    pub fn new(capacity: usize, buffer_capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|fd| UnsafeCell::new(Conn::new(fd as RawFd, buffer_capacity)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// Raises the open-file soft limit, then sizes the table so that any fd
    /// the process may legally receive has a slot.
    pub fn with_process_limit(buffer_capacity: usize) -> TernResult<Self> {
        let max_fd = raise_nofile_limit()?;
        Ok(Self::new(max_fd, buffer_capacity))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Mutable access to the slot for `fd`.
    ///
    /// # Safety
    ///
    /// The caller must be the single worker that owns `fd`. Two threads
    /// must never hold the same slot at once; the acceptor's round-robin
    /// assignment is what upholds this.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot(&self, fd: RawFd) -> &mut Conn {
        &mut *self.slots[fd as usize].get()
    }
}

/// New soft limit given the current soft/hard pair: the hard limit when one
/// exists, eight times the current value when the hard limit is infinite.
fn raised_nofile_limit(cur: libc::rlim_t, max: libc::rlim_t) -> libc::rlim_t {
    if max == libc::RLIM_INFINITY {
        cur.saturating_mul(8)
    } else if cur < max {
        max
    } else {
        cur
    }
}

/// Raise RLIMIT_NOFILE and return the resulting soft limit.
pub(crate) fn raise_nofile_limit() -> TernResult<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) < 0 {
            return Err(TernError::Io(io::Error::last_os_error()));
        }

        limit.rlim_cur = raised_nofile_limit(limit.rlim_cur, limit.rlim_max);

        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) < 0 {
            return Err(TernError::Io(io::Error::last_os_error()));
        }
    }

    Ok(limit.rlim_cur as usize)
}
