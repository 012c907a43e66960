//! Name and id reservations
//!
//! Every sandbox and container holds a reservation for its name and its id
//! from the moment a creation attempt starts until the object is removed or
//! the attempt is rolled back. Two requests can never hold the same name.

use crate::{errors::ReservationError, lock::lock};
use std::{collections::HashMap, sync::Mutex};

/// Generate a new random object id, 64 lowercase hex digits
pub fn generate_id() -> String {
    let bytes: [u8; 32] = rand::random();
    let mut id = String::with_capacity(64);
    for byte in bytes.iter() {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

#[derive(Debug, Default)]
struct Reservations {
    by_name: HashMap<String, String>,
    by_id: HashMap<String, String>,
}

/// Bidirectional name/id map guarded by a single lock
///
/// The lock is only held for the map update itself, never across a
/// suspension point.
#[derive(Debug, Default)]
pub struct ReservationRegistry {
    inner: Mutex<Reservations>,
}

impl ReservationRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reserve a name under a freshly generated id
    pub fn reserve(&self, name: &str) -> Result<String, ReservationError> {
        let id = generate_id();
        self.reserve_with_id(name, &id)?;
        Ok(id)
    }

    /// Reserve a name under a caller-chosen id
    ///
    /// The check and the insert happen in one critical section.
    pub fn reserve_with_id(&self, name: &str, id: &str) -> Result<(), ReservationError> {
        if name.is_empty() || id.is_empty() {
            return Err(ReservationError::Empty);
        }
        let mut reservations = lock(&self.inner);
        if let Some(existing) = reservations.by_name.get(name) {
            return Err(ReservationError::NameInUse {
                name: name.to_string(),
                id: existing.clone(),
            });
        }
        if let Some(existing) = reservations.by_id.get(id) {
            return Err(ReservationError::IdInUse {
                id: id.to_string(),
                name: existing.clone(),
            });
        }
        reservations
            .by_name
            .insert(name.to_string(), id.to_string());
        reservations.by_id.insert(id.to_string(), name.to_string());
        log::trace!("reserved {:?} for {}", name, id);
        Ok(())
    }

    /// Release a name and its id, returning the id if it was reserved
    ///
    /// Releasing a name that isn't reserved is not an error.
    pub fn release(&self, name: &str) -> Option<String> {
        let mut reservations = lock(&self.inner);
        let id = reservations.by_name.remove(name)?;
        reservations.by_id.remove(&id);
        log::trace!("released {:?} from {}", name, id);
        Some(id)
    }

    /// Release by id, returning the name if it was reserved
    pub fn release_id(&self, id: &str) -> Option<String> {
        let mut reservations = lock(&self.inner);
        let name = reservations.by_id.remove(id)?;
        reservations.by_name.remove(&name);
        Some(name)
    }

    pub fn resolve_id(&self, name: &str) -> Result<String, ReservationError> {
        lock(&self.inner)
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ReservationError::NotFound(name.to_string()))
    }

    pub fn resolve_name(&self, id: &str) -> Option<String> {
        lock(&self.inner).by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
