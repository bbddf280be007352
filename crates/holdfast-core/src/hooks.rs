//! Interceptor registry.
//!
//! Hooks run operator-supplied code inside the target, which makes them an
//! untrusted capability. The registry only tracks which hook the substrate
//! attached at which address; it never executes hook code itself and shares no
//! state with the trap coordinator.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::error::{HoldfastError, HoldfastResult};
use crate::substrate::{HookId, Substrate};
use crate::types::Address;

/// Tracks hooks attached through the substrate, at most one per address.
pub struct InterceptorRegistry
{
    substrate: Arc<dyn Substrate>,
    hooks: Mutex<BTreeMap<Address, HookId>>,
}

impl fmt::Debug for InterceptorRegistry
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("InterceptorRegistry")
            .field("hooks", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl InterceptorRegistry
{
    /// Create an empty registry.
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>) -> Self
    {
        Self {
            substrate,
            hooks: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Address, HookId>>
    {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `code` at `address`, replacing any hook already there.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `code` is empty
    /// - `Substrate`: the substrate could not attach the hook
    pub fn intercept(&self, address: Address, code: &str) -> HoldfastResult<HookId>
    {
        if code.trim().is_empty() {
            return Err(HoldfastError::InvalidArgument("hook code must not be empty".to_string()));
        }

        let mut hooks = self.lock();
        if let Some(previous) = hooks.remove(&address) {
            if let Err(err) = self.substrate.detach_hook(previous) {
                warn!(address = %address, error = %err, "Failed to detach previous hook");
            }
        }
        let hook = self.substrate.attach_hook(address, code)?;
        hooks.insert(address, hook);
        info!(address = %address, hook = hook.0, "Interceptor attached");
        Ok(hook)
    }

    /// Detach the hook at `address`. Returns `false` if there was none.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: the substrate failed to detach the hook (it stays registered)
    pub fn detach(&self, address: Address) -> HoldfastResult<bool>
    {
        let mut hooks = self.lock();
        let Some(hook) = hooks.get(&address).copied() else {
            return Ok(false);
        };
        self.substrate.detach_hook(hook)?;
        hooks.remove(&address);
        info!(address = %address, "Interceptor detached");
        Ok(true)
    }

    /// Detach every hook. Returns how many were detached.
    ///
    /// Detach failures are logged; the registry is emptied either way.
    pub fn detach_all(&self) -> usize
    {
        let hooks = std::mem::take(&mut *self.lock());
        let mut detached = 0;
        for (address, hook) in hooks {
            match self.substrate.detach_hook(hook) {
                Ok(()) => detached += 1,
                Err(err) => warn!(address = %address, error = %err, "Failed to detach hook"),
            }
        }
        if detached > 0 {
            info!(count = detached, "All interceptors detached");
        }
        detached
    }

    /// Addresses with an attached hook.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address>
    {
        self.lock().keys().copied().collect()
    }
}
