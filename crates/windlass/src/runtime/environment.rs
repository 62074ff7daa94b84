//! Lexical scopes binding symbols to locations

use serde::{Deserialize, Serialize};

use crate::tree::ActivityId;

use super::location::Location;

/// Address of a declared symbol after metadata caching
///
/// Every argument, variable, and delegate parameter resolves to one of
/// these: the declaring activity plus a sequential index within its
/// environment. Indices are assigned by the tree walker and are always
/// non-negative by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSlot {
    /// Activity that declared the symbol
    pub owner: ActivityId,

    /// Sequential index within the owner's environment
    pub index: u32,
}

/// Ordered set of location slots owned by one activity instance
///
/// Lookups that miss walk the instance parent chain until they reach the
/// environment whose owner matches the slot's declaring activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationEnvironment {
    /// Declaring activity
    pub owner: ActivityId,

    slots: Vec<Option<Location>>,
}

impl LocationEnvironment {
    /// Create an environment with `capacity` undeclared slots
    pub fn new(owner: ActivityId, capacity: u32) -> Self {
        Self {
            owner,
            slots: vec![None; capacity as usize],
        }
    }

    /// Declare a location into a slot, replacing any prior declaration
    pub fn declare(&mut self, index: u32, location: Location) {
        let index = index as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(location);
    }

    /// Read a slot
    pub fn get(&self, index: u32) -> Option<&Location> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    /// Read a slot mutably
    pub fn get_mut(&mut self, index: u32) -> Option<&mut Location> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    /// Number of slots (declared or not)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the environment has no slots at all
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::location::ValueKind;
    use crate::tree::ActivityId;
    use serde_json::json;

    #[test]
    fn test_declare_and_get() {
        let mut env = LocationEnvironment::new(ActivityId::new(1), 2);
        assert!(env.get(0).is_none());

        env.declare(0, Location::with_value(ValueKind::Integer, json!(3)));
        assert_eq!(env.get(0).unwrap().value, json!(3));
        assert!(env.get(1).is_none());
    }

    #[test]
    fn test_declare_grows() {
        let mut env = LocationEnvironment::new(ActivityId::new(1), 0);
        env.declare(3, Location::new(ValueKind::Any));
        assert_eq!(env.len(), 4);
        assert!(env.get(3).is_some());
    }

    #[test]
    fn test_roundtrip() {
        let mut env = LocationEnvironment::new(ActivityId::new(2), 1);
        env.declare(0, Location::with_value(ValueKind::String, json!("x")));

        let round: LocationEnvironment =
            serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(round.owner, ActivityId::new(2));
        assert_eq!(round.get(0).unwrap().value, json!("x"));
    }
}
