use std::collections::HashMap;
use std::sync::Mutex;

use super::RingError;

/// Tracks which shared-memory name is currently owned by which session, so
/// a truncated-name collision between two sessions can be detected at
/// creation time instead of silently corrupting another session's ring.
#[derive(Default)]
pub struct RingRegistry {
    owners: Mutex<HashMap<String, String>>,
}

impl RingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `session_id`. Idempotent for the same session
    /// (re-creating its own ring). Fails if another session already owns
    /// the name.
    pub fn claim(&self, name: &str, session_id: &str) -> Result<(), RingError> {
        let mut owners = self.owners.lock().unwrap();
        match owners.get(name) {
            Some(owner) if owner != session_id => Err(RingError::NameCollision),
            _ => {
                owners.insert(name.to_string(), session_id.to_string());
                Ok(())
            }
        }
    }

    pub fn release(&self, name: &str) {
        self.owners.lock().unwrap().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_with_colliding_name_is_rejected() {
        let registry = RingRegistry::new();
        registry.claim("/unb12345678", "session-a").unwrap();
        let err = registry.claim("/unb12345678", "session-b").unwrap_err();
        assert!(matches!(err, RingError::NameCollision));
    }

    #[test]
    fn same_session_can_reclaim_its_own_name() {
        let registry = RingRegistry::new();
        registry.claim("/unb12345678", "session-a").unwrap();
        registry.claim("/unb12345678", "session-a").unwrap();
    }
}
