use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use crate::{FacadeError, Host, HostClock, MonotonicClock, Provider, ProviderConfig, Result};

/// Process-wide entry point: owns the provider behind a lock so that every
/// provider-level operation is serialised, and performs one-time setup.
///
/// Built once at startup and handed to collaborators by reference.
pub struct CameraService {
    provider: Mutex<Provider>,
    initialized: AtomicBool,
}

impl CameraService {
    pub fn new(config: ProviderConfig, host: Arc<dyn Host>) -> Result<Self> {
        Self::with_clock(config, host, Arc::new(MonotonicClock::start()))
    }

    pub fn with_clock(
        config: ProviderConfig,
        host: Arc<dyn Host>,
        clock: Arc<dyn HostClock>,
    ) -> Result<Self> {
        Ok(Self {
            provider: Mutex::new(Provider::with_clock(config, host, clock)?),
            initialized: AtomicBool::new(false),
        })
    }

    /// Runs one-time setup on the first call; later calls return immediately.
    ///
    /// If setup fails the service stays uninitialised and the next call tries
    /// again.
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut provider = self.lock_provider()?;
        // Another caller may have finished setup while we waited for the lock.
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        provider.config().validate()?;
        if provider.config().create_default_device && provider.is_empty() {
            let name = provider.config().default_device_name.clone();
            let id = provider.create_device(&name)?;
            tracing::info!(device = %id, name = %name, "default device created");
        }

        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            provider = %provider.config().provider_name,
            devices = provider.len(),
            "camera service initialised"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Runs `f` with exclusive access to the provider.
    pub fn with_provider<T>(&self, f: impl FnOnce(&mut Provider) -> Result<T>) -> Result<T> {
        let mut provider = self.lock_provider()?;
        f(&mut provider)
    }

    fn lock_provider(&self) -> Result<MutexGuard<'_, Provider>> {
        self.provider
            .lock()
            .map_err(|_| FacadeError::Poisoned("provider"))
    }
}
