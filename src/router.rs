// src/router.rs
use std::any::Any;
use std::collections::HashMap;

use crate::http::{Response, Status};
use crate::request::Request;

/// Opaque per-handler state returned by `init` and handed back to every
/// `handle` call and to `teardown`.
pub type HandlerState = Box<dyn Any + Send + Sync>;

pub type InitFn = fn(args: Option<&str>) -> HandlerState;
pub type TeardownFn = fn(state: HandlerState);
pub type HandleFn =
    fn(req: &Request, resp: &mut Response, state: Option<&HandlerState>) -> Status;

/// Hints for which parts of the request the core should pre-parse before
/// invoking the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseFlags(u32);

impl ParseFlags {
    pub const NONE: ParseFlags = ParseFlags(0);
    pub const QUERY_STRING: ParseFlags = ParseFlags(1 << 0);
    pub const ALL: ParseFlags = ParseFlags(!0);

    #[inline]
    pub fn contains(self, other: ParseFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ParseFlags {
    type Output = ParseFlags;

    fn bitor(self, rhs: ParseFlags) -> ParseFlags {
        ParseFlags(self.0 | rhs.0)
    }
}

/// Full handler descriptor: optional lifecycle hooks around the callback.
pub struct Handler {
    pub init: Option<InitFn>,
    pub teardown: Option<TeardownFn>,
    pub handle: HandleFn,
    pub flags: ParseFlags,
}

/// One user-supplied registration: a URL prefix bound to either a full
/// handler descriptor or a bare callback.
pub struct Mount {
    pub prefix: String,
    pub kind: MountKind,
    pub args: Option<String>,
}

pub enum MountKind {
    Handler(Handler),
    Callback(HandleFn),
}

impl Mount {
    pub fn handler(prefix: impl Into<String>, handler: Handler) -> Self {
        Self {
            prefix: prefix.into(),
            kind: MountKind::Handler(handler),
            args: None,
        }
    }

    pub fn handler_with_args(
        prefix: impl Into<String>,
        handler: Handler,
        args: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            kind: MountKind::Handler(handler),
            args: Some(args.into()),
        }
    }

    pub fn callback(prefix: impl Into<String>, callback: HandleFn) -> Self {
        Self {
            prefix: prefix.into(),
            kind: MountKind::Callback(callback),
            args: None,
        }
    }
}

/// A registered entry, fully resolved.
pub struct Route {
    prefix: String,
    callback: HandleFn,
    flags: ParseFlags,
    data: Option<HandlerState>,
    teardown: Option<TeardownFn>,
}

impl Route {
    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn callback(&self) -> HandleFn {
        self.callback
    }

    #[inline]
    pub fn flags(&self) -> ParseFlags {
        self.flags
    }

    #[inline]
    pub fn state(&self) -> Option<&HandlerState> {
        self.data.as_ref()
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<u8, TrieNode>,
    route: Option<usize>,
}

/// URL-prefix router. A byte trie over registered prefixes; lookup resolves
/// to the longest registered prefix of the request path. Read-only once the
/// server starts.
#[derive(Default)]
pub struct Router {
    root: TrieNode,
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered entries. Every previously registered entry is
    /// torn down (each exactly once) before any new handler's `init` runs.
    ///
    /// Entries registered through a bare callback, or through a handler
    /// without `init`, carry no state and default to `ParseFlags::ALL`.
    pub fn rebuild(&mut self, mounts: Vec<Mount>) {
        self.teardown_all();

        for mount in mounts {
            let (callback, flags, data, teardown) = match mount.kind {
                MountKind::Callback(callback) => (callback, ParseFlags::ALL, None, None),
                MountKind::Handler(handler) => match handler.init {
                    None => (handler.handle, ParseFlags::ALL, None, handler.teardown),
                    Some(init) => (
                        handler.handle,
                        handler.flags,
                        Some(init(mount.args.as_deref())),
                        handler.teardown,
                    ),
                },
            };

            let index = self.routes.len();
            self.routes.push(Route {
                prefix: mount.prefix,
                callback,
                flags,
                data,
                teardown,
            });

            let mut node = &mut self.root;
            for byte in self.routes[index].prefix.bytes() {
                node = node.children.entry(byte).or_default();
            }
            node.route = Some(index);
        }
    }

    /// Entry for the longest registered prefix of `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        let mut node = &self.root;
        let mut best = node.route;

        for byte in path.bytes() {
            match node.children.get(&byte) {
                Some(child) => node = child,
                None => break,
            }
            if node.route.is_some() {
                best = node.route;
            }
        }

        best.map(|index| &self.routes[index])
    }

    /// Run `teardown` on every registered entry and drop the trie.
    pub(crate) fn teardown_all(&mut self) {
        for route in &mut self.routes {
            if let (Some(teardown), Some(data)) = (route.teardown, route.data.take()) {
                teardown(data);
            }
        }
        self.routes.clear();
        self.root = TrieNode::default();
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
