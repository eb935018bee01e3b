//! The auth/session collaborator: identities that may arrive after the
//! engine has been constructed.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub default_servings: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: Option<User>,
    pub subscription: Option<Subscription>,
}

impl Session {
    #[must_use]
    pub fn signed_in(user_id: &str, subscription: Option<Subscription>) -> Self {
        Self {
            user: Some(User {
                id: user_id.to_string(),
            }),
            subscription,
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: watch::Sender<Session>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(session: Session) -> Self {
        let (tx, _rx) = watch::channel(session);
        Self { tx }
    }

    #[must_use]
    pub fn current(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn set_user(&self, user: Option<User>) {
        self.tx.send_if_modified(|s| {
            if s.user == user {
                return false;
            }
            s.user = user;
            true
        });
    }

    pub fn set_subscription(&self, subscription: Option<Subscription>) {
        self.tx.send_if_modified(|s| {
            if s.subscription == subscription {
                return false;
            }
            s.subscription = subscription;
            true
        });
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new(Session::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_arrives_later() {
        let handle = SessionHandle::default();
        let mut rx = handle.subscribe();
        assert!(handle.current().user.is_none());

        handle.set_user(Some(User {
            id: "u1".to_string(),
        }));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // Same value again does not notify
        handle.set_user(Some(User {
            id: "u1".to_string(),
        }));
        assert!(!rx.has_changed().unwrap());

        handle.set_subscription(Some(Subscription {
            id: "s1".to_string(),
            default_servings: 2,
        }));
        assert_eq!(handle.current().subscription.unwrap().default_servings, 2);

        handle.set_user(None);
        handle.set_subscription(None);
        assert_eq!(handle.current(), Session::default());
    }
}
