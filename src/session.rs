// =============================================================================
// Session credential provider
// =============================================================================
//
// The feed never owns authentication. Whoever manages login hands this handle
// a token; revoking it forces the connection actor to disconnect, and
// `connect()` is refused while no credential is present.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Shared handle to the current session credential.
#[derive(Clone)]
pub struct SessionHandle {
    tx: Arc<watch::Sender<Option<String>>>,
    // Keep a receiver alive so the watch channel never closes: `send` is a
    // no-op when no receivers exist, which would silently drop credentials.
    _keepalive: watch::Receiver<Option<String>>,
}

impl SessionHandle {
    /// New handle with no credential; `connect()` will be refused until one
    /// is supplied via [`SessionHandle::set_token`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            _keepalive: rx,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let handle = Self::new();
        handle.set_token(token);
        handle
    }

    /// Read the credential from an environment variable, if set.
    pub fn from_env(var: &str) -> Self {
        let handle = Self::new();
        if let Ok(token) = std::env::var(var) {
            if !token.trim().is_empty() {
                handle.set_token(token);
            }
        }
        handle
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let _ = self.tx.send(Some(token.into()));
    }

    /// Drop the credential. Observers (the connection actor) react by
    /// disconnecting.
    pub fn revoke(&self) {
        info!("session credential revoked");
        let _ = self.tx.send(None);
    }

    pub fn credential(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_credential() {
        let session = SessionHandle::new();
        assert_eq!(session.credential(), None);
    }

    #[test]
    fn set_and_revoke() {
        let session = SessionHandle::new();
        session.set_token("abc");
        assert_eq!(session.credential(), Some("abc".to_string()));
        session.revoke();
        assert_eq!(session.credential(), None);
    }

    #[tokio::test]
    async fn revocation_is_observable() {
        let session = SessionHandle::with_token("abc");
        let mut rx = session.subscribe();
        session.revoke();
        rx.changed().await.expect("sender alive");
        assert!(rx.borrow().is_none());
    }
}
