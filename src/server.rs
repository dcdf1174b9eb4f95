// src/server.rs
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{TernError, TernResult};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::router::Router;
use crate::slab::ConnTable;
use crate::syscalls::{self, Epoll};
use crate::worker::{Worker, READ_EVENTS};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on; 0 binds an ephemeral port.
    pub port: u16,
    /// Idle ticks (roughly seconds) before a connection is reaped.
    pub keep_alive_timeout: u32,
    /// Worker reactor count; 0 means one per online CPU.
    pub workers: usize,
    /// Initial capacity of every slot's response buffer.
    pub response_buffer_capacity: usize,
    /// Install a SIGINT handler that requests an orderly shutdown.
    pub install_signal_handler: bool,
    /// Close stdin at startup (daemon hygiene).
    pub close_stdin: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            keep_alive_timeout: 15,
            workers: 0,
            response_buffer_capacity: 64,
            install_signal_handler: true,
            close_stdin: true,
        }
    }
}

/// Everything the acceptor and the workers share: the fd table, the
/// routing table (read-only once serving), configuration and counters.
pub(crate) struct Shared {
    pub(crate) table: ConnTable,
    pub(crate) router: Router,
    pub(crate) config: Config,
    pub(crate) metrics: Metrics,
}

/// Token for requesting an orderly stop from another thread or from the
/// signal handler.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub(crate) struct RoundRobin {
    counter: usize,
    targets: usize,
}

impl RoundRobin {
    pub(crate) fn new(targets: usize) -> Self {
        Self {
            counter: 0,
            targets,
        }
    }

    pub(crate) fn next(&mut self) -> usize {
        let target = self.counter % self.targets;
        self.counter = self.counter.wrapping_add(1);
        target
    }
}

/// The server: owns the listening socket, the worker threads and their
/// epoll sets, and the shared state. Construction brings the engine fully
/// up; `run` turns the calling thread into the acceptor.
pub struct Server {
    shared: Arc<Shared>,
    listen_fd: RawFd,
    port: u16,
    worker_epolls: Vec<Arc<Epoll>>,
    worker_handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    finished: bool,
}

impl Server {
    pub fn new(config: Config, router: Router) -> TernResult<Self> {
        let n_workers = if config.workers == 0 {
            num_cpus::get().max(1)
        } else {
            config.workers
        };

        let table = ConnTable::with_process_limit(config.response_buffer_capacity)?;
        let max_fd_per_worker = (table.capacity() / n_workers).max(1);

        syscalls::ignore_sigpipe();
        if config.close_stdin {
            syscalls::close_stdin();
        }

        let listen_fd =
            syscalls::create_listen_socket(config.port, n_workers * max_fd_per_worker)?;
        let port = match syscalls::local_port(listen_fd) {
            Ok(port) => port,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e.into());
            }
        };

        let shared = Arc::new(Shared {
            table,
            router,
            config,
            metrics: Metrics::default(),
        });

        let mut server = Server {
            shared,
            listen_fd,
            port,
            worker_epolls: Vec::with_capacity(n_workers),
            worker_handles: Vec::with_capacity(n_workers),
            shutdown: Arc::new(AtomicBool::new(false)),
            finished: false,
        };
        server.spawn_workers(n_workers, max_fd_per_worker)?;

        if server.shared.config.install_signal_handler {
            let flag = Arc::clone(&server.shutdown);
            if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
                warn!("SIGINT handler not installed: {}", e);
            }
        }

        info!(
            "listening on port {}: {} workers, {} sockets per worker",
            server.port, n_workers, max_fd_per_worker
        );

        Ok(server)
    }

    fn spawn_workers(&mut self, n_workers: usize, max_fd_per_worker: usize) -> TernResult<()> {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        for id in 0..n_workers {
            let epoll = Arc::new(Epoll::new()?);
            let worker_epoll = Arc::clone(&epoll);
            let shared = Arc::clone(&self.shared);
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[id % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("tern-worker-{}", id))
                .spawn(move || {
                    if let Some(core) = core_id {
                        core_affinity::set_for_current(core);
                    }
                    Worker::new(id, worker_epoll, shared, max_fd_per_worker).run();
                })
                .map_err(TernError::WorkerSpawn)?;

            self.worker_epolls.push(epoll);
            self.worker_handles.push(handle);
        }
        Ok(())
    }

    /// Port actually bound, which differs from the configured one when that
    /// was 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Turn the calling thread into the acceptor. Returns once shutdown has
    /// been requested and teardown has run.
    pub fn run(&mut self) -> TernResult<()> {
        let root = Epoll::new()?;
        root.add(self.listen_fd, libc::EPOLLIN as u32)?;

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let mut robin = RoundRobin::new(self.worker_epolls.len());

        // Finite poll so the shutdown token is noticed promptly.
        while !self.shutdown.load(Ordering::Acquire) {
            let n = match root.wait(&mut events, 500) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    self.finish();
                    return Err(e.into());
                }
            };

            for _ in 0..n {
                self.drain_accept_queue(&mut robin);
            }
        }

        self.finish();
        Ok(())
    }

    /// Accept everything pending and hand each socket to the next worker's
    /// epoll set. Enrollment is the only cross-thread interaction; the
    /// kernel serializes it.
    fn drain_accept_queue(&self, robin: &mut RoundRobin) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(fd)) => {
                    let target = robin.next();
                    if let Err(e) = self.worker_epolls[target].add(fd, READ_EVENTS) {
                        warn!("enrolling fd {} with worker {}: {}", fd, target, e);
                        syscalls::close(fd);
                    } else {
                        self.shared.metrics.record_connection();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("accept: {}", e);
                    break;
                }
            }
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        // Workers notice their epoll set vanishing on the next epoll_wait.
        for epoll in &self.worker_epolls {
            epoll.close();
        }

        // A worker with pending reaps polls at one-second granularity, so
        // give it a moment; one parked in an indefinite epoll_wait may
        // never notice, and is left behind.
        let deadline = Instant::now() + Duration::from_millis(1500);
        for handle in self.worker_handles.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        syscalls::shutdown_socket(self.listen_fd);
        syscalls::close(self.listen_fd);

        // With every worker gone the router tears down in order here; if
        // one was left behind, Router's Drop covers it when the last Arc
        // goes away.
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.router.teardown_all();
        }

        let snapshot = self.shared.metrics.snapshot();
        info!(
            "server stopped: {} connections, {} requests, {} bytes written",
            snapshot.connections, snapshot.requests, snapshot.bytes_written
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.finish();
    }
}
