//! # Session
//!
//! Who is signed in on this register and the bearer token for the server.
//! The session is a plain value owned by the runtime and shared by `Arc`.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::events::{EventHub, SyncEvent};

/// A signed-in cashier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub cashier_id: String,
}

/// Read side of the session, as consumed by the engine and HTTP client.
pub trait SessionProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;

    fn cashier_id(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.bearer_token().is_some()
    }
}

/// Holds the current session and announces sign-in and sign-out.
pub struct SessionStore {
    current: RwLock<Option<Session>>,
    events: Arc<EventHub<SyncEvent>>,
}

impl SessionStore {
    pub fn new(events: Arc<EventHub<SyncEvent>>) -> Self {
        SessionStore {
            current: RwLock::new(None),
            events,
        }
    }

    pub fn sign_in(&self, session: Session) {
        let cashier_id = session.cashier_id.clone();
        *self.write() = Some(session);

        info!(cashier_id = %cashier_id, "Cashier signed in");
        self.events.emit(SyncEvent::AuthStatusChanged {
            is_authenticated: true,
            cashier_id: Some(cashier_id),
        });
    }

    pub fn sign_out(&self) {
        let previous = self.write().take();

        if let Some(session) = previous {
            info!(cashier_id = %session.cashier_id, "Cashier signed out");
            self.events.emit(SyncEvent::AuthStatusChanged {
                is_authenticated: false,
                cashier_id: None,
            });
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Session>> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Session>> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionProvider for SessionStore {
    fn bearer_token(&self) -> Option<String> {
        self.read().as_ref().map(|s| s.token.clone())
    }

    fn cashier_id(&self) -> Option<String> {
        self.read().as_ref().map(|s| s.cashier_id.clone())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token
        f.debug_struct("SessionStore")
            .field("cashier_id", &self.cashier_id())
            .finish()
    }
}
