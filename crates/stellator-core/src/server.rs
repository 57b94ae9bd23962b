//! Server handle and storage capability
//!
//! A `Server` is an opaque identity attached to every task: it routes
//! heartbeats and log lines and, optionally, grants access to a storage
//! backend through [`StorageProvider`]. The engine never looks inside a
//! storage handle; it only guarantees the provider is asked to open and
//! release one around a callback.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

static NEXT_SERVER_ID: AtomicU32 = AtomicU32::new(1);

/// Per-server heartbeat hook, invoked from the root thread.
pub type HeartbeatFn = Box<dyn Fn(&Server) + Send + Sync>;

/// An open storage/transaction handle.
pub trait StorageHandle: Send {
    /// Downcast access for the code that knows the concrete backend.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens a storage handle, runs a callback with it and releases it.
///
/// Implementations must release the handle on every path, including
/// when the callback returns `false`.
pub trait StorageProvider: Send + Sync {
    fn perform_with_storage(&self, f: &mut dyn FnMut(&mut dyn StorageHandle) -> bool) -> bool;
}

struct ServerInner {
    id: u32,
    name: String,
    storage: Option<Arc<dyn StorageProvider>>,
    heartbeat: Option<HeartbeatFn>,
}

/// Cheaply clonable server identity.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server with no storage and no heartbeat hook.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> ServerBuilder {
        ServerBuilder {
            name: name.into(),
            storage: None,
            heartbeat: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn has_storage(&self) -> bool {
        self.inner.storage.is_some()
    }

    /// Run `f` with a storage handle from this server's provider.
    ///
    /// Returns `false` without calling `f` when the server has no storage.
    pub fn perform_with_storage(&self, f: &mut dyn FnMut(&mut dyn StorageHandle) -> bool) -> bool {
        match &self.inner.storage {
            Some(provider) => provider.perform_with_storage(f),
            None => {
                tracing::warn!(server = %self.inner.name, "no storage configured");
                false
            }
        }
    }

    /// Invoke the server's heartbeat hook, if any.
    pub fn on_heartbeat(&self) {
        if let Some(hook) = &self.inner.heartbeat {
            hook(self);
        }
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Server {}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("storage", &self.inner.storage.is_some())
            .finish()
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    name: String,
    storage: Option<Arc<dyn StorageProvider>>,
    heartbeat: Option<HeartbeatFn>,
}

impl ServerBuilder {
    pub fn storage(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(provider);
        self
    }

    pub fn on_heartbeat<F>(mut self, f: F) -> Self
    where
        F: Fn(&Server) + Send + Sync + 'static,
    {
        self.heartbeat = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                storage: self.storage,
                heartbeat: self.heartbeat,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    pub(crate) struct CountingHandle(pub u32);

    impl StorageHandle for CountingHandle {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingStorage {
        pub opened: AtomicUsize,
        pub released: AtomicUsize,
    }

    impl StorageProvider for CountingStorage {
        fn perform_with_storage(
            &self,
            f: &mut dyn FnMut(&mut dyn StorageHandle) -> bool,
        ) -> bool {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let mut handle = CountingHandle(7);
            let ok = f(&mut handle);
            self.released.fetch_add(1, Ordering::SeqCst);
            ok
        }
    }

    #[test]
    fn test_unique_ids() {
        let a = Server::new("a");
        let b = Server::new("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn test_storage_released_on_failure() {
        let storage = Arc::new(CountingStorage::default());
        let server = Server::builder("db").storage(storage.clone()).build();
        assert!(server.has_storage());

        let ok = server.perform_with_storage(&mut |h| {
            let handle = h.as_any_mut().downcast_mut::<CountingHandle>();
            assert_eq!(handle.map(|h| h.0), Some(7));
            false
        });
        assert!(!ok);
        assert_eq!(storage.opened.load(Ordering::SeqCst), 1);
        assert_eq!(storage.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_storage() {
        let server = Server::new("plain");
        let mut called = false;
        assert!(!server.perform_with_storage(&mut |_| {
            called = true;
            true
        }));
        assert!(!called);
    }

    #[test]
    fn test_heartbeat_hook() {
        let beats = Arc::new(AtomicUsize::new(0));
        let b = beats.clone();
        let server = Server::builder("hb")
            .on_heartbeat(move |s| {
                assert_eq!(s.name(), "hb");
                b.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        server.on_heartbeat();
        server.clone().on_heartbeat();
        assert_eq!(beats.load(Ordering::SeqCst), 2);
    }
}
