//! Observer registries for connection events.
//!
//! Handlers run synchronously on the task that raised the event, so they
//! should hand heavy work off to their own tasks. A handler that fails or
//! panics is logged and the remaining handlers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::codec::AudioFormat;

/// Who is behind an SSRC, as far as the resolver knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    // ---
    pub id: u64,
    pub name: Option<String>,
}

impl UserIdentity {
    // ---
    pub fn new(id: u64) -> Self {
        Self { id, name: None }
    }
}

/// Looks up user details for ids seen on the signaling socket.
#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve_user(&self, user_id: u64) -> Option<UserIdentity>;
}

/// Resolver that knows ids only.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdOnlyResolver;

#[async_trait]
impl UserResolver for IdOnlyResolver {
    async fn resolve_user(&self, user_id: u64) -> Option<UserIdentity> {
        Some(UserIdentity::new(user_id))
    }
}

#[derive(Debug, Clone)]
pub struct UserJoinedEvent {
    // ---
    pub ssrc: u32,
    pub user: UserIdentity,
}

#[derive(Debug, Clone)]
pub struct UserLeftEvent {
    // ---
    /// `None` when no sender entry had been created for the user
    pub ssrc: Option<u32>,
    pub user: UserIdentity,
}

#[derive(Debug, Clone)]
pub struct UserSpeakingEvent {
    // ---
    pub ssrc: u32,
    pub user: Option<UserIdentity>,
    pub speaking: bool,
}

/// One decoded frame from a remote sender. Concealment frames carry an
/// empty `opus` payload.
#[derive(Debug, Clone)]
pub struct VoiceReceivedEvent {
    // ---
    pub ssrc: u32,
    pub user: Option<UserIdentity>,
    pub pcm: Vec<i16>,
    pub opus: Vec<u8>,
    pub format: AudioFormat,
    pub duration_ms: u32,
}

/// A signaling session ended with an error.
#[derive(Debug, Clone)]
pub struct SocketErrorEvent {
    // ---
    pub message: String,

    /// Whether the connection will try again
    pub recoverable: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionClosedEvent {
    // ---
    /// Close code of the signaling socket, when one was received
    pub code: Option<u16>,
    pub reason: String,
}

/// Handle returned by [`EventRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Add/remove/invoke-all list of handlers for one event type.
pub struct EventRegistry<T> {
    // ---
    name: &'static str,
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Handler<T>)>>,
}

impl<T> EventRegistry<T> {
    // ---
    pub fn new(name: &'static str) -> Self {
        // ---
        Self {
            name,
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        // ---
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the handler was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        // ---
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Calls every handler registered at the time of the call. Returns the
    /// number that completed without error or panic.
    pub fn invoke(&self, event: &T) -> usize {
        // ---
        let snapshot: Vec<(HandlerId, Handler<T>)> = self.handlers.read().clone();

        let mut ok = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => warn!(event = self.name, handler = id.0, "event handler failed: {e:#}"),
                Err(_) => error!(event = self.name, handler = id.0, "event handler panicked"),
            }
        }
        ok
    }
}

/// All event registries of one connection.
pub struct VoiceEvents {
    // ---
    pub user_joined: EventRegistry<UserJoinedEvent>,
    pub user_left: EventRegistry<UserLeftEvent>,
    pub user_speaking: EventRegistry<UserSpeakingEvent>,
    pub voice_received: EventRegistry<VoiceReceivedEvent>,
    pub socket_error: EventRegistry<SocketErrorEvent>,
    pub connection_closed: EventRegistry<ConnectionClosedEvent>,
}

impl Default for VoiceEvents {
    fn default() -> Self {
        // ---
        Self {
            user_joined: EventRegistry::new("user_joined"),
            user_left: EventRegistry::new("user_left"),
            user_speaking: EventRegistry::new("user_speaking"),
            voice_received: EventRegistry::new("voice_received"),
            socket_error: EventRegistry::new("socket_error"),
            connection_closed: EventRegistry::new("connection_closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_add_invoke_remove() {
        // ---
        let registry = EventRegistry::<u32>::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let id = registry.add(move |v| {
            s.fetch_add(*v as usize, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(registry.invoke(&3), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.invoke(&3), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        // ---
        let registry = EventRegistry::<()>::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        registry.add(|_| anyhow::bail!("nope"));
        registry.add(|_| panic!("boom"));
        let s = seen.clone();
        registry.add(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.invoke(&()), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_id_only_resolver() {
        // ---
        let user = IdOnlyResolver.resolve_user(7).await;
        assert_eq!(user, Some(UserIdentity::new(7)));
    }
}
