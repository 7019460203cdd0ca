//! Bounded table of live CAN interfaces
//!
//! Slots are claimed in two steps: [`Registry::allocate`] reserves one and
//! returns a [`Reservation`] guard, and [`Reservation::commit`] fills it
//! once the connection is ready. A reservation dropped without commit gives
//! its slot back, so a failed bring-up never leaks capacity.
//!
//! Lookups are a linear scan; the table only ever holds a handful of entries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::bus::BusConnection;
use crate::error::{DriverError, DriverResult};

/// Upper-layer identifier of one interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceHandle(Arc<str>);

impl InterfaceHandle {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InterfaceHandle {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A live interface: the connection, the handle that owns it and the stop
/// flag of its receive loop
#[derive(Clone)]
pub struct Instance {
    pub handle: InterfaceHandle,
    pub channel: String,
    pub connection: Arc<dyn BusConnection>,
    pub(crate) stop: Arc<AtomicBool>,
}

impl Instance {
    /// Ask the receive loop of this interface to exit at its next read timeout
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity interface table
pub struct Registry {
    capacity: usize,
    instances: RwLock<Vec<Instance>>,
    pending: Mutex<Vec<InterfaceHandle>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            instances: RwLock::new(Vec::with_capacity(capacity)),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed instances
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Handles of every committed instance, in registration order
    pub fn handles(&self) -> Vec<InterfaceHandle> {
        self.instances
            .read()
            .iter()
            .map(|inst| inst.handle.clone())
            .collect()
    }

    /// Reserve a slot for `handle`.
    ///
    /// Fails with [`DriverError::CapacityExceeded`] when committed plus
    /// reserved slots already reach capacity, and with
    /// [`DriverError::AlreadyRegistered`] if `handle` is live or reserved.
    pub fn allocate(&self, handle: &InterfaceHandle) -> DriverResult<Reservation<'_>> {
        let mut pending = self.pending.lock();
        let instances = self.instances.read();

        if pending.contains(handle) || instances.iter().any(|inst| &inst.handle == handle) {
            return Err(DriverError::AlreadyRegistered(handle.clone()));
        }
        if instances.len() + pending.len() >= self.capacity {
            return Err(DriverError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        pending.push(handle.clone());
        debug!(interface = %handle, used = instances.len() + pending.len(), "Registry slot reserved");

        Ok(Reservation {
            registry: self,
            handle: handle.clone(),
            committed: false,
        })
    }

    /// Connection owned by `handle`
    pub fn resolve(&self, handle: &InterfaceHandle) -> DriverResult<Arc<dyn BusConnection>> {
        self.instances
            .read()
            .iter()
            .find(|inst| &inst.handle == handle)
            .map(|inst| inst.connection.clone())
            .ok_or_else(|| DriverError::ChannelNotFound(handle.clone()))
    }

    /// Drop the instance owned by `handle`, freeing its slot
    pub fn remove(&self, handle: &InterfaceHandle) -> Option<Instance> {
        let mut instances = self.instances.write();
        let pos = instances.iter().position(|inst| &inst.handle == handle)?;
        Some(instances.remove(pos))
    }

    /// Remove every instance, e.g. when the owning driver goes away
    pub(crate) fn drain(&self) -> Vec<Instance> {
        std::mem::take(&mut *self.instances.write())
    }

    fn release(&self, handle: &InterfaceHandle) {
        self.pending.lock().retain(|h| h != handle);
    }
}

/// A reserved but not yet filled registry slot
#[must_use = "dropping a reservation releases the slot"]
pub struct Reservation<'a> {
    registry: &'a Registry,
    handle: InterfaceHandle,
    committed: bool,
}

impl Reservation<'_> {
    pub fn handle(&self) -> &InterfaceHandle {
        &self.handle
    }

    /// Fill the slot with a ready connection
    pub fn commit(mut self, channel: &str, connection: Arc<dyn BusConnection>) -> Instance {
        let instance = Instance {
            handle: self.handle.clone(),
            channel: channel.to_string(),
            connection,
            stop: Arc::new(AtomicBool::new(false)),
        };

        let mut pending = self.registry.pending.lock();
        let mut instances = self.registry.instances.write();
        pending.retain(|h| h != &self.handle);
        instances.push(instance.clone());
        self.committed = true;

        instance
    }
}

impl fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("handle", &self.handle)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(&self.handle);
            debug!(interface = %self.handle, "Registry slot released");
        }
    }
}
