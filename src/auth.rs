use std::sync::RwLock;

use uuid::Uuid;

pub type UserId = Uuid;

/// Source of the signed-in user for checkout precondition checks.
///
/// The sign-in/sign-up flows themselves live in the host app; the checkout
/// core only needs to know whether a user is present and which one.
pub trait SessionProvider: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
}

/// Session provider backed by a slot the host app updates on auth changes.
#[derive(Debug, Default)]
pub struct StaticSessionProvider {
    user: RwLock<Option<UserId>>,
}

impl StaticSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: UserId) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    pub fn sign_in(&self, user: UserId) {
        *self.user.write().expect("session lock poisoned") = Some(user);
    }

    pub fn sign_out(&self) {
        *self.user.write().expect("session lock poisoned") = None;
    }
}

impl SessionProvider for StaticSessionProvider {
    fn current_user(&self) -> Option<UserId> {
        *self.user.read().expect("session lock poisoned")
    }
}
