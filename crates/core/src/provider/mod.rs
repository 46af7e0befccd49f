//! The provider owns the device set and is the single writer over it:
//! device lifecycle, format changes, property access and desired-state
//! import/export all go through here.

use std::{fmt, sync::Arc};

use crate::{
    reconcile::{self, CreateOp, DesiredDocument, EntryWarning},
    Device, DeviceDescriptor, DeviceId, DeviceProperty, DevicePropertyKey, DeviceSnapshot,
    Dimensions, FacadeError, FormatBounds, Host, HostClock, MonotonicClock, PropertyUpdate,
    ProviderConfig, ProviderProperty, ProviderPropertyKey, Result, VideoFormat, MAGIC_VALUE,
};

/// Outcome of applying a desired-state document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub updated: Vec<DeviceId>,
    pub created: Vec<DeviceId>,
    pub deleted: Vec<DeviceId>,
    /// Entries skipped while planning.
    pub warnings: Vec<EntryWarning>,
    /// Planned operations that failed while being applied.
    pub failures: Vec<String>,
}

impl ImportReport {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.created.is_empty() && self.deleted.is_empty()
    }

    fn fail(&mut self, failure: String) {
        tracing::error!(%failure, "desired-state operation failed");
        self.failures.push(failure);
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "updated {}, created {}, deleted {}, skipped {}, failed {}",
            self.updated.len(),
            self.created.len(),
            self.deleted.len(),
            self.warnings.len(),
            self.failures.len()
        )
    }
}

pub struct Provider {
    config: ProviderConfig,
    host: Arc<dyn Host>,
    clock: Arc<dyn HostClock>,
    /// Kept in creation order, which is also the export order.
    devices: Vec<Device>,
}

impl Provider {
    pub fn new(config: ProviderConfig, host: Arc<dyn Host>) -> Result<Self> {
        Self::with_clock(config, host, Arc::new(MonotonicClock::start()))
    }

    pub fn with_clock(
        config: ProviderConfig,
        host: Arc<dyn Host>,
        clock: Arc<dyn HostClock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            host,
            clock,
            devices: Vec::new(),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(Device::id).collect()
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices
            .iter()
            .find(|device| device.id() == id)
            .ok_or(FacadeError::UnknownDevice(id))
    }

    /// Creates a device with the configured default format.
    pub fn create_device(&mut self, name: &str) -> Result<DeviceId> {
        let format = self.config.default_format;
        self.create_device_with_format(name, format)
    }

    /// Creates and registers a device. Fails without side effects if the
    /// device set is full, the buffers cannot be allocated or the host
    /// refuses the device.
    pub fn create_device_with_format(&mut self, name: &str, format: VideoFormat) -> Result<DeviceId> {
        self.register(DeviceId::new_random(), name, format)
    }

    /// Rebuilds a device set saved with [`export`](Self::export), keeping
    /// every device's id. Only an empty provider can be restored; entries
    /// that do not describe a complete device are skipped with a warning.
    pub fn restore(&mut self, document: &str) -> Result<Vec<DeviceId>> {
        if !self.devices.is_empty() {
            return Err(FacadeError::msg("cannot restore over an existing device set"));
        }

        let (saved, warnings) = DesiredDocument::from_json(document)?.saved_devices();
        for warning in &warnings {
            tracing::warn!(entry = warning.index, reason = %warning.reason, "skipping saved device");
        }

        let restored = saved
            .into_iter()
            .map(|device| self.register(device.id, &device.name, device.format))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(devices = restored.len(), "device set restored");
        Ok(restored)
    }

    fn register(&mut self, id: DeviceId, name: &str, format: VideoFormat) -> Result<DeviceId> {
        if self.devices.len() >= self.config.max_devices {
            tracing::warn!(name, limit = self.config.max_devices, "device set is full");
            return Err(FacadeError::CapacityReached {
                limit: self.config.max_devices,
            });
        }

        let device = Device::new(id, name, format, &self.config, self.clock.clone())?;
        let descriptor = DeviceDescriptor {
            id,
            name: name.to_string(),
        };
        if let Err(err) = self.host.add_device(&descriptor) {
            tracing::error!(device = %id, error = %err, "host refused device registration");
            return Err(err);
        }

        self.devices.push(device);
        Ok(id)
    }

    /// Stops and removes a device whatever its stream reference count.
    pub fn destroy_device(&mut self, id: DeviceId) -> Result<()> {
        let index = self
            .devices
            .iter()
            .position(|device| device.id() == id)
            .ok_or(FacadeError::UnknownDevice(id))?;

        let device = self.devices.remove(index);
        device.shutdown();
        self.host.remove_device(id);
        Ok(())
    }

    /// Applies a new format and tells the host when it changed.
    pub fn set_format(&mut self, id: DeviceId, width: u32, height: u32, frame_rate: u32) -> Result<bool> {
        self.apply_format(id, VideoFormat::new(width, height, frame_rate))
    }

    /// Loosely typed property writes. Values that do not parse or fall out of
    /// bounds are ignored with a warning; the rest are applied together.
    pub fn set_properties(&mut self, id: DeviceId, updates: &[PropertyUpdate]) -> Result<bool> {
        let current = self.device(id)?.format()?;
        let bounds = FormatBounds::CANONICAL;

        let mut target = current;
        for update in updates {
            match update {
                PropertyUpdate::Dimensions(text) => match text.parse::<Dimensions>() {
                    Ok(dimensions)
                        if bounds.dimension_in_range(dimensions.width)
                            && bounds.dimension_in_range(dimensions.height) =>
                    {
                        target = target.with_dimensions(dimensions);
                    }
                    _ => tracing::warn!(device = %id, value = %text, "ignoring invalid dimensions"),
                },
                PropertyUpdate::FrameRate(rate) if bounds.frame_rate_in_range(*rate) => {
                    target.frame_rate = *rate;
                }
                PropertyUpdate::FrameRate(rate) => {
                    tracing::warn!(device = %id, value = rate, "ignoring invalid frame rate");
                }
            }
        }

        if target == current {
            return Ok(false);
        }
        self.apply_format(id, target)
    }

    pub fn get_properties(&self, id: DeviceId, keys: &[DevicePropertyKey]) -> Result<Vec<DeviceProperty>> {
        self.device(id)?.properties(keys)
    }

    pub fn provider_properties(&self, keys: &[ProviderPropertyKey]) -> Result<Vec<ProviderProperty>> {
        keys.iter()
            .map(|key| -> Result<ProviderProperty> {
                Ok(match key {
                    ProviderPropertyKey::Name => ProviderProperty::Name(self.config.provider_name.clone()),
                    ProviderPropertyKey::Manufacturer => {
                        ProviderProperty::Manufacturer(self.config.manufacturer.clone())
                    }
                    ProviderPropertyKey::Magic => ProviderProperty::Magic(MAGIC_VALUE),
                    ProviderPropertyKey::State => ProviderProperty::State(self.export()?),
                })
            })
            .collect()
    }

    pub fn snapshots(&self) -> Result<Vec<DeviceSnapshot>> {
        self.devices.iter().map(Device::snapshot).collect()
    }

    /// Current device set as a desired-state document.
    pub fn export(&self) -> Result<String> {
        reconcile::export_document(&self.snapshots()?)
    }

    /// Reconciles the device set with `document`.
    ///
    /// A document that fails a top-level check is rejected before anything
    /// is touched. Otherwise updates run first, then creates, then deletes;
    /// creates that do not fit until the deletes have run are applied last.
    pub fn import(&mut self, document: &str) -> Result<ImportReport> {
        let desired = DesiredDocument::from_json(document).map_err(|err| {
            tracing::warn!(error = %err, "desired-state import aborted");
            err
        })?;
        let plan = desired.plan(&self.snapshots()?);
        tracing::info!(
            entries = desired.entry_count(),
            updates = plan.updates.len(),
            creates = plan.creates.len(),
            deletes = plan.deletes.len(),
            skipped = plan.warnings.len(),
            "importing desired state"
        );

        let mut report = ImportReport {
            warnings: plan.warnings,
            ..Default::default()
        };

        for update in plan.updates {
            match self.apply_format(update.id, update.format) {
                Ok(_) => report.updated.push(update.id),
                Err(err) => report.fail(format!("update {}: {err}", update.id)),
            }
        }

        let mut deferred = Vec::new();
        for create in plan.creates {
            if self.devices.len() >= self.config.max_devices {
                deferred.push(create);
            } else {
                self.apply_create(create, &mut report);
            }
        }

        for delete in plan.deletes {
            match self.destroy_device(delete.id) {
                Ok(()) => report.deleted.push(delete.id),
                Err(err) => report.fail(format!("delete {}: {err}", delete.id)),
            }
        }

        for create in deferred {
            self.apply_create(create, &mut report);
        }

        if !report.is_noop() {
            let state = self.export()?;
            self.host
                .provider_properties_changed(&[ProviderProperty::State(state)]);
        }
        tracing::info!(%report, "desired state imported");
        Ok(report)
    }

    fn apply_create(&mut self, create: CreateOp, report: &mut ImportReport) {
        match self.create_device_with_format(&create.name, create.format) {
            Ok(id) => report.created.push(id),
            Err(err) => report.fail(format!("create `{}`: {err}", create.name)),
        }
    }

    fn apply_format(&mut self, id: DeviceId, format: VideoFormat) -> Result<bool> {
        let device = self.device(id)?;
        if !device.set_format(format)? {
            return Ok(false);
        }
        let changed = device.properties(&[DevicePropertyKey::Dimensions, DevicePropertyKey::FrameRate])?;
        self.host.device_properties_changed(id, &changed);
        Ok(true)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.config.provider_name)
            .field("devices", &self.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum HostEvent {
        Added(DeviceId),
        Removed(DeviceId),
        DeviceChanged(DeviceId, Vec<DevicePropertyKey>),
        StateChanged,
    }

    #[derive(Default)]
    struct RecordingHost {
        events: Mutex<Vec<HostEvent>>,
        live: Mutex<usize>,
        peak: Mutex<usize>,
        refuse: bool,
    }

    impl RecordingHost {
        fn events(&self) -> Vec<HostEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Host for RecordingHost {
        fn add_device(&self, device: &DeviceDescriptor) -> Result<()> {
            if self.refuse {
                return Err(FacadeError::Host("registration disabled".into()));
            }
            let mut live = self.live.lock().unwrap();
            *live += 1;
            let mut peak = self.peak.lock().unwrap();
            *peak = (*peak).max(*live);
            self.events.lock().unwrap().push(HostEvent::Added(device.id));
            Ok(())
        }

        fn remove_device(&self, id: DeviceId) {
            *self.live.lock().unwrap() -= 1;
            self.events.lock().unwrap().push(HostEvent::Removed(id));
        }

        fn device_properties_changed(&self, id: DeviceId, changed: &[DeviceProperty]) {
            let keys = changed.iter().map(DeviceProperty::key).collect();
            self.events.lock().unwrap().push(HostEvent::DeviceChanged(id, keys));
        }

        fn provider_properties_changed(&self, _changed: &[ProviderProperty]) {
            self.events.lock().unwrap().push(HostEvent::StateChanged);
        }
    }

    fn small_config() -> ProviderConfig {
        ProviderConfig {
            default_format: VideoFormat::new(64, 48, 30),
            pool_prewarm: 0,
            ..Default::default()
        }
    }

    fn provider() -> (Provider, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        let provider = Provider::new(small_config(), host.clone()).unwrap();
        (provider, host)
    }

    fn new_device_document(count: usize) -> String {
        let entries: Vec<String> = (0..count)
            .map(|index| {
                format!(
                    r#"{{ "video": {{ "name": "Cam {index}", "width": "32", "height": "32", "frameRate": "30" }} }}"#
                )
            })
            .collect();
        format!(
            r#"{{ "facade": {{ "apiVersion": "v1", "devices": [{}] }} }}"#,
            entries.join(",")
        )
    }

    #[test]
    fn create_stops_at_capacity() {
        let (mut provider, host) = provider();
        for index in 0..4 {
            provider.create_device(&format!("Cam {index}")).unwrap();
        }
        assert!(matches!(
            provider.create_device("Cam 5"),
            Err(FacadeError::CapacityReached { limit: 4 })
        ));
        assert_eq!(provider.len(), 4);
        assert_eq!(host.events().len(), 4);
    }

    #[test]
    fn host_refusal_aborts_creation() {
        let host = Arc::new(RecordingHost {
            refuse: true,
            ..Default::default()
        });
        let mut provider = Provider::new(small_config(), host).unwrap();
        assert!(matches!(provider.create_device("Cam"), Err(FacadeError::Host(_))));
        assert!(provider.is_empty());
    }

    #[test]
    fn set_format_round_trips_through_properties() {
        let (mut provider, host) = provider();
        let id = provider.create_device("Cam").unwrap();

        for (width, height, frame_rate) in [(16, 16, 10), (1280, 720, 30), (8192, 8192, 120)] {
            provider.set_format(id, width, height, frame_rate).unwrap();
            let values = provider
                .get_properties(id, &[DevicePropertyKey::Dimensions, DevicePropertyKey::FrameRate])
                .unwrap();
            assert_eq!(values[0].to_string(), format!("{width}x{height}"));
            assert_eq!(values[1], DeviceProperty::FrameRate(frame_rate));
        }

        assert!(host.events().contains(&HostEvent::DeviceChanged(
            id,
            vec![DevicePropertyKey::Dimensions, DevicePropertyKey::FrameRate]
        )));
    }

    #[test]
    fn unchanged_or_invalid_format_is_not_announced() {
        let (mut provider, host) = provider();
        let id = provider.create_device("Cam").unwrap();

        assert!(!provider.set_format(id, 64, 48, 30).unwrap());
        assert!(provider.set_format(id, 0, 48, 30).is_err());
        assert!(provider.set_format(id, 64, 48, 121).is_err());
        assert_eq!(host.events(), vec![HostEvent::Added(id)]);
        assert_eq!(
            provider.device(id).unwrap().format().unwrap(),
            VideoFormat::new(64, 48, 30)
        );
    }

    #[test]
    fn set_properties_ignores_invalid_values() {
        let (mut provider, _host) = provider();
        let id = provider.create_device("Cam").unwrap();

        let changed = provider
            .set_properties(
                id,
                &[
                    PropertyUpdate::Dimensions("huge".into()),
                    PropertyUpdate::FrameRate(500),
                    PropertyUpdate::Dimensions("320x240".into()),
                ],
            )
            .unwrap();
        assert!(changed);
        assert_eq!(
            provider.device(id).unwrap().format().unwrap(),
            VideoFormat::new(320, 240, 30)
        );

        assert!(!provider
            .set_properties(id, &[PropertyUpdate::Dimensions("8x8".into())])
            .unwrap());
    }

    #[test]
    fn destroy_removes_and_unregisters() {
        let (mut provider, host) = provider();
        let id = provider.create_device("Cam").unwrap();
        provider.destroy_device(id).unwrap();
        assert!(provider.is_empty());
        assert_eq!(host.events().last(), Some(&HostEvent::Removed(id)));
        assert!(matches!(
            provider.destroy_device(id),
            Err(FacadeError::UnknownDevice(_))
        ));
    }

    #[test]
    fn rejected_documents_leave_devices_alone() {
        let (mut provider, _host) = provider();
        let id = provider.create_device("Cam").unwrap();

        assert!(provider.import(&new_device_document(5)).is_err());
        let wrong_version = r#"{ "facade": { "apiVersion": "v9", "devices": [] } }"#;
        assert!(matches!(provider.import(wrong_version), Err(FacadeError::Schema(_))));
        assert_eq!(provider.device_ids(), vec![id]);
    }

    #[test]
    fn import_of_export_changes_nothing() {
        let (mut provider, host) = provider();
        provider.create_device("Front").unwrap();
        provider.create_device("Back").unwrap();
        let before = host.events().len();

        let report = provider.import(&provider.export().unwrap()).unwrap();
        assert!(report.is_noop());
        assert_eq!(host.events().len(), before);
    }

    #[test]
    fn created_devices_survive_reimport() {
        let (mut provider, host) = provider();
        let report = provider.import(&new_device_document(1)).unwrap();
        assert_eq!(report.created.len(), 1);
        assert!(host.events().contains(&HostEvent::StateChanged));

        let report = provider.import(&provider.export().unwrap()).unwrap();
        assert!(report.is_noop());
        assert_eq!(provider.len(), 1);
    }

    #[test]
    fn replacing_a_full_set_never_exceeds_capacity() {
        let (mut provider, host) = provider();
        let old: Vec<DeviceId> = (0..4)
            .map(|index| provider.create_device(&format!("Old {index}")).unwrap())
            .collect();

        let report = provider.import(&new_device_document(4)).unwrap();
        assert_eq!(report.deleted, old);
        assert_eq!(report.created.len(), 4);
        assert!(report.failures.is_empty());
        assert_eq!(provider.len(), 4);
        assert_eq!(*host.peak.lock().unwrap(), 4);
    }

    #[test]
    fn restore_rebuilds_a_saved_set_with_its_ids() {
        let (mut original, _host) = provider();
        let front = original.create_device("Front").unwrap();
        original.set_format(front, 320, 240, 24).unwrap();
        let back = original.create_device("Back").unwrap();
        let saved = original.export().unwrap();

        let (mut restored, host) = provider();
        assert_eq!(restored.restore(&saved).unwrap(), vec![front, back]);
        assert_eq!(restored.export().unwrap(), saved);
        assert_eq!(host.events(), vec![HostEvent::Added(front), HostEvent::Added(back)]);

        assert!(restored.restore(&saved).is_err());
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn provider_properties_include_state() {
        let (mut provider, _host) = provider();
        provider.create_device("Cam").unwrap();
        let values = provider
            .provider_properties(&[
                ProviderPropertyKey::Name,
                ProviderPropertyKey::Magic,
                ProviderPropertyKey::State,
            ])
            .unwrap();
        assert_eq!(values[0], ProviderProperty::Name("Facade".into()));
        assert_eq!(values[1], ProviderProperty::Magic(MAGIC_VALUE));
        assert!(matches!(&values[2], ProviderProperty::State(doc) if doc.contains("\"Cam\"")));
    }
}
