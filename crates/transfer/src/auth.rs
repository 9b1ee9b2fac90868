use sharevault_protocol::UserIdentity;

/// Supplies the identity of the caller.
///
/// Identity is trusted input; authentication happens before the queue is
/// ever reached.
pub trait AuthContext: Send + Sync {
    fn current_user(&self) -> UserIdentity;
}

/// Fixed identity, for single-user embeddings and tests.
#[derive(Debug, Clone)]
pub struct StaticAuth {
    identity: UserIdentity,
}

impl StaticAuth {
    pub fn new(identity: UserIdentity) -> Self {
        Self { identity }
    }
}

impl AuthContext for StaticAuth {
    fn current_user(&self) -> UserIdentity {
        self.identity.clone()
    }
}
