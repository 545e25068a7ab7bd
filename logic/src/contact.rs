#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::id::Id;

/// A known peer: identifier plus the transport address it was observed at.
///
/// The endpoint is opaque to the routing logic; it is only handed back to
/// the transport and compared through its canonical serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Contact<E> {
    pub id: Id,
    pub endpoint: E,
    #[cfg_attr(feature = "serde", serde(default))]
    dead_count: u32,
}

impl<E> Contact<E> {
    pub fn new(id: Id, endpoint: E) -> Self {
        Contact {
            id,
            endpoint,
            dead_count: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.dead_count == 0
    }

    /// Resets the failure counter on success, bumps it on failure.
    pub fn set_alive(&mut self, alive: bool) {
        if alive {
            self.dead_count = 0;
        } else {
            self.dead_count += 1;
        }
    }

    pub fn dead_count(&self) -> u32 {
        self.dead_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_counter() {
        let mut c = Contact::new(Id::generate(), "node-1".to_owned());
        assert!(c.is_alive());
        c.set_alive(false);
        c.set_alive(false);
        assert!(!c.is_alive());
        assert_eq!(c.dead_count(), 2);
        c.set_alive(true);
        assert!(c.is_alive());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_round_trip() {
        let mut c = Contact::new(Id::generate(), "node-7".to_owned());
        c.set_alive(false);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(serde_json::from_str::<Contact<String>>(&json).unwrap(), c);
    }
}
