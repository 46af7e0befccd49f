use crate::{DeviceId, DeviceProperty, ProviderProperty, Result};

/// What the host learns about a device when it is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
}

/// The OS video subsystem hosting the provider.
///
/// The provider tells the host about devices coming and going and about
/// property changes; the host drives everything else by calling into the
/// provider and its devices.
pub trait Host: Send + Sync {
    /// Registers a device. A failure aborts the device's creation.
    fn add_device(&self, device: &DeviceDescriptor) -> Result<()>;

    fn remove_device(&self, id: DeviceId);

    fn device_properties_changed(&self, id: DeviceId, changed: &[DeviceProperty]);

    fn provider_properties_changed(&self, changed: &[ProviderProperty]);
}

/// Host that accepts everything and listens to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    fn add_device(&self, _device: &DeviceDescriptor) -> Result<()> {
        Ok(())
    }

    fn remove_device(&self, _id: DeviceId) {}

    fn device_properties_changed(&self, _id: DeviceId, _changed: &[DeviceProperty]) {}

    fn provider_properties_changed(&self, _changed: &[ProviderProperty]) {}
}
