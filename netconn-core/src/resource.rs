//! Buffer hand-off: byte buffers live in a host-side table and are checked out exclusively
//! while a transfer is in flight.

use std::collections::HashMap;

/// Identifies a buffer in a [`ResourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u32);

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("unknown resource {0}")]
    Unknown(ResourceHandle),
    #[error("resource {0} is in flight")]
    InFlight(ResourceHandle),
    #[error("resource {0} was not checked out")]
    NotInFlight(ResourceHandle),
}

/// Contract the engine needs from the host's buffer table.
///
/// `checkout` hands the buffer over and leaves an in-flight marker behind; `release`
/// puts the (possibly modified) buffer back and clears the marker.
pub trait ResourceTable {
    fn checkout(&mut self, handle: ResourceHandle) -> Result<Vec<u8>, ResourceError>;
    fn release(&mut self, handle: ResourceHandle, buffer: Vec<u8>) -> Result<(), ResourceError>;
}

enum Slot {
    Binary(Vec<u8>),
    InFlight,
}

/// In-memory [`ResourceTable`].
#[derive(Default)]
pub struct BufferTable {
    slots: HashMap<ResourceHandle, Slot>,
    next: u32,
}

impl BufferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a buffer and return its new handle.
    pub fn insert(&mut self, data: Vec<u8>) -> ResourceHandle {
        self.next = self.next.wrapping_add(1);
        let handle = ResourceHandle(self.next);
        self.slots.insert(handle, Slot::Binary(data));
        handle
    }

    /// Borrow a buffer. `None` if unknown or in flight.
    pub fn get(&self, handle: ResourceHandle) -> Option<&[u8]> {
        match self.slots.get(&handle)? {
            Slot::Binary(data) => Some(data),
            Slot::InFlight => None,
        }
    }

    /// Remove a buffer that is not in flight.
    pub fn remove(&mut self, handle: ResourceHandle) -> Result<Vec<u8>, ResourceError> {
        match self.slots.remove(&handle) {
            Some(Slot::Binary(data)) => Ok(data),
            Some(Slot::InFlight) => {
                self.slots.insert(handle, Slot::InFlight);
                Err(ResourceError::InFlight(handle))
            }
            None => Err(ResourceError::Unknown(handle)),
        }
    }

    pub fn is_in_flight(&self, handle: ResourceHandle) -> bool {
        matches!(self.slots.get(&handle), Some(Slot::InFlight))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl ResourceTable for BufferTable {
    fn checkout(&mut self, handle: ResourceHandle) -> Result<Vec<u8>, ResourceError> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(ResourceError::Unknown(handle))?;
        match std::mem::replace(slot, Slot::InFlight) {
            Slot::Binary(data) => Ok(data),
            Slot::InFlight => Err(ResourceError::InFlight(handle)),
        }
    }

    fn release(&mut self, handle: ResourceHandle, buffer: Vec<u8>) -> Result<(), ResourceError> {
        match self.slots.get_mut(&handle) {
            Some(slot) if matches!(slot, Slot::InFlight) => {
                *slot = Slot::Binary(buffer);
                Ok(())
            }
            _ => Err(ResourceError::NotInFlight(handle)),
        }
    }
}
