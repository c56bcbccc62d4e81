//! Port ownership registry.
//!
//! At most one device handle may drive a port at a time. The registry keeps,
//! per port, an optional owner and a generation counter that increases on
//! every acquisition. An [`Ownership`] token remembers the generation it was
//! issued under, so releasing a stale token (one whose port has since been
//! released and re-acquired) is a no-op instead of evicting the new owner.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use hatlink_core::{HatError, PortId, Result, constants::NUM_PORTS};

/// Hooks the engine calls on a port's owner.
pub trait PortOwner: Send + Sync {
    /// Commands that put the port in a safe idle state on release.
    fn shutdown_commands(&self, port: PortId) -> Vec<String>;

    /// Commands that restore the owner's configuration after the HAT rebooted.
    fn reset_commands(&self, port: PortId) -> Vec<String>;
}

/// Proof of ownership of one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    port: PortId,
    generation: u64,
}

impl Ownership {
    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    owner: Option<Arc<dyn PortOwner>>,
}

/// Ownership table for the four ports.
#[derive(Default)]
pub struct Registry {
    slots: Mutex<[Slot; NUM_PORTS]>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, [Slot; NUM_PORTS]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `port` for `owner`.
    ///
    /// # Errors
    /// Returns `HatError::PortInUse` if the port already has an owner.
    pub fn acquire(&self, port: PortId, owner: Arc<dyn PortOwner>) -> Result<Ownership> {
        let mut slots = self.lock();
        let slot = &mut slots[port.index()];
        if slot.owner.is_some() {
            return Err(HatError::PortInUse { port });
        }
        slot.generation += 1;
        slot.owner = Some(owner);
        debug!(%port, generation = slot.generation, "Port acquired");
        Ok(Ownership {
            port,
            generation: slot.generation,
        })
    }

    /// Give up a port. Returns the owner if `ownership` was current.
    pub fn release(&self, ownership: &Ownership) -> Option<Arc<dyn PortOwner>> {
        let mut slots = self.lock();
        let slot = &mut slots[ownership.port.index()];
        if slot.generation != ownership.generation {
            return None;
        }
        let owner = slot.owner.take();
        if owner.is_some() {
            debug!(port = %ownership.port, generation = ownership.generation, "Port released");
        }
        owner
    }

    /// True while `ownership` is the live claim on its port.
    pub fn is_current(&self, ownership: &Ownership) -> bool {
        let slots = self.lock();
        let slot = &slots[ownership.port.index()];
        slot.generation == ownership.generation && slot.owner.is_some()
    }

    pub fn is_in_use(&self, port: PortId) -> bool {
        self.lock()[port.index()].owner.is_some()
    }

    /// Snapshot of every current owner.
    pub fn owners(&self) -> Vec<(PortId, Arc<dyn PortOwner>)> {
        let slots = self.lock();
        PortId::ALL
            .iter()
            .filter_map(|port| {
                slots[port.index()]
                    .owner
                    .as_ref()
                    .map(|owner| (*port, Arc::clone(owner)))
            })
            .collect()
    }

    /// Drop every owner, invalidating all outstanding tokens.
    pub fn clear(&self) {
        let mut slots = self.lock();
        for slot in slots.iter_mut() {
            if slot.owner.take().is_some() {
                slot.generation += 1;
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.lock();
        let in_use: Vec<bool> = slots.iter().map(|s| s.owner.is_some()).collect();
        f.debug_struct("Registry").field("in_use", &in_use).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Owner(&'static str);

    impl PortOwner for Owner {
        fn shutdown_commands(&self, port: PortId) -> Vec<String> {
            vec![format!("{} off {port}", self.0)]
        }

        fn reset_commands(&self, port: PortId) -> Vec<String> {
            vec![format!("{} reset {port}", self.0)]
        }
    }

    fn port(index: u8) -> PortId {
        PortId::new(index).unwrap()
    }

    #[test]
    fn test_second_acquire_fails_until_release() {
        let registry = Registry::new();
        let first = registry.acquire(port(1), Arc::new(Owner("a"))).unwrap();

        let err = registry.acquire(port(1), Arc::new(Owner("b"))).err().unwrap();
        assert!(matches!(err, HatError::PortInUse { port: p } if p == port(1)));

        let owner = registry.release(&first).unwrap();
        assert_eq!(owner.shutdown_commands(port(1)), ["a off B"]);
        assert!(registry.acquire(port(1), Arc::new(Owner("b"))).is_ok());
    }

    #[test]
    fn test_stale_release_is_noop() {
        let registry = Registry::new();
        let first = registry.acquire(port(0), Arc::new(Owner("a"))).unwrap();
        registry.release(&first);
        let second = registry.acquire(port(0), Arc::new(Owner("b"))).unwrap();

        assert!(registry.release(&first).is_none());
        assert!(registry.is_current(&second));
        assert!(!registry.is_current(&first));
        assert_ne!(first.generation(), second.generation());
    }

    #[test]
    fn test_concurrent_acquire_succeeds_once() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.acquire(port(2), Arc::new(Owner("t"))).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_owners_and_clear() {
        let registry = Registry::new();
        let a = registry.acquire(port(0), Arc::new(Owner("a"))).unwrap();
        registry.acquire(port(3), Arc::new(Owner("d"))).unwrap();

        let owners: Vec<PortId> = registry.owners().into_iter().map(|(p, _)| p).collect();
        assert_eq!(owners, [port(0), port(3)]);

        registry.clear();
        assert!(registry.owners().is_empty());
        assert!(registry.release(&a).is_none());
    }

    proptest! {
        #[test]
        fn prop_one_owner_per_port(ops in proptest::collection::vec((0u8..4, any::<bool>()), 1..64)) {
            let registry = Registry::new();
            let mut held: Vec<Option<Ownership>> = vec![None; NUM_PORTS];
            let mut stale = Vec::new();

            for (index, acquire) in ops {
                let p = port(index);
                let slot = &mut held[p.index()];
                if acquire {
                    let result = registry.acquire(p, Arc::new(Owner("p")));
                    prop_assert_eq!(result.is_ok(), slot.is_none());
                    if let Ok(token) = result {
                        *slot = Some(token);
                    }
                } else if let Some(token) = slot.take() {
                    prop_assert!(registry.release(&token).is_some());
                    stale.push(token);
                }
                // Tokens already given back never evict anyone.
                for token in &stale {
                    prop_assert!(registry.release(token).is_none());
                }
                prop_assert_eq!(registry.is_in_use(p), held[p.index()].is_some());
            }
        }
    }
}
