//! A single virtual camera: its format, buffer pools, animator, stream
//! endpoints and the frame loop that ties them together.

mod frame_loop;
mod relay;

use std::{
    cell::Cell,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use serde::Serialize;
use uuid::Uuid;

use self::{frame_loop::FrameLoop, relay::CancelToken, relay::RelayWorker};
use crate::{
    ClientId, Consumed, ConsumerId, DeviceProperty, DevicePropertyKey, Discontinuity,
    FacadeError, Frame, FrameAnimator, FrameBufferPool, FrameConsumer, HostClock, HostTime,
    ProviderConfig, Result, ScheduledOutput, SinkClient, SinkDelivery, SinkEndpoint,
    SourceEndpoint, TransportType, VideoFormat, MAGIC_VALUE,
};

/// Stable identifier of a device, rendered as an uppercase hyphenated UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First block of the UUID; enough to tell devices apart in thread names.
    pub(crate) fn short(&self) -> String {
        self.to_string().chars().take(8).collect()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Uuid::encode_buffer();
        f.write_str(self.0.hyphenated().encode_upper(&mut buf))
    }
}

impl FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// Where a device's frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// Placeholder animation rendered locally.
    Synthetic,
    /// Frames pushed in through the sink by the bound client.
    Relay(ClientId),
}

/// Point-in-time view of a device used for export and reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub name: String,
    pub format: VideoFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub relay_frames: u64,
    pub stream_ref_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct PoolSettings {
    main_capacity: usize,
    aux_capacity: usize,
    prewarm: usize,
}

#[derive(Debug, Default)]
struct Counters {
    frames_dropped: AtomicU64,
    relay_frames: AtomicU64,
}

struct DeviceState {
    format: VideoFormat,
    main_pool: FrameBufferPool,
    aux_pool: FrameBufferPool,
    animator: FrameAnimator,
    stream_ref_count: u32,
    producer: ProducerMode,
    relay: Option<RelayWorker>,
    frame_loop: Option<FrameLoop>,
    last_tick: Option<HostTime>,
    /// A frame was skipped since the last one delivered.
    gap: bool,
    closed: bool,
}

thread_local! {
    /// Device whose source is delivering on this thread, if any.
    static DELIVERING: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

pub(crate) struct DeviceShared {
    id: DeviceId,
    name: String,
    model: String,
    pools: PoolSettings,
    clock: Arc<dyn HostClock>,
    source: SourceEndpoint,
    sink: SinkEndpoint,
    state: Mutex<DeviceState>,
    /// `false` once destruction has begun; guards every source delivery.
    delivery_open: RwLock<bool>,
    frame_interval_ns: AtomicU64,
    counters: Counters,
}

/// One virtual camera exposed to the host.
///
/// All methods take `&self`; the format, pools and animator sit behind one
/// lock shared by the property path and the frame loop.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Builds a device and its initial buffer pools. Fails if the pools
    /// cannot be allocated.
    pub fn new(
        id: DeviceId,
        name: impl Into<String>,
        format: VideoFormat,
        config: &ProviderConfig,
        clock: Arc<dyn HostClock>,
    ) -> Result<Self> {
        let format = format.validated()?;
        let pools = PoolSettings {
            main_capacity: config.main_pool_capacity,
            aux_capacity: config.aux_pool_capacity,
            prewarm: config.pool_prewarm,
        };
        let (main_pool, aux_pool) = build_pools(&format, pools)?;
        let name = name.into();

        tracing::info!(device = %id, name = %name, %format, "device created");

        Ok(Self {
            shared: Arc::new(DeviceShared {
                id,
                name,
                model: config.model.clone(),
                pools,
                clock,
                source: SourceEndpoint::new(),
                sink: SinkEndpoint::new(),
                state: Mutex::new(DeviceState {
                    format,
                    main_pool,
                    aux_pool,
                    animator: FrameAnimator::new(&format),
                    stream_ref_count: 0,
                    producer: ProducerMode::Synthetic,
                    relay: None,
                    frame_loop: None,
                    last_tick: None,
                    gap: false,
                    closed: false,
                }),
                delivery_open: RwLock::new(true),
                frame_interval_ns: AtomicU64::new(format.frame_interval().as_nanos() as u64),
                counters: Counters::default(),
            }),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn format(&self) -> Result<VideoFormat> {
        Ok(self.shared.lock_state()?.format)
    }

    pub fn snapshot(&self) -> Result<DeviceSnapshot> {
        Ok(DeviceSnapshot {
            id: self.shared.id,
            name: self.shared.name.clone(),
            format: self.format()?,
        })
    }

    pub fn producer_mode(&self) -> Result<ProducerMode> {
        Ok(self.shared.lock_state()?.producer)
    }

    pub fn stream_ref_count(&self) -> Result<u32> {
        Ok(self.shared.lock_state()?.stream_ref_count)
    }

    /// `true` while the frame loop is armed.
    pub fn is_producing(&self) -> Result<bool> {
        Ok(self.shared.lock_state()?.frame_loop.is_some())
    }

    pub fn stats(&self) -> Result<DeviceStats> {
        let stream_ref_count = self.stream_ref_count()?;
        Ok(DeviceStats {
            frames_sent: self.shared.source.frames_sent(),
            frames_dropped: self.shared.counters.frames_dropped.load(Ordering::Relaxed),
            relay_frames: self.shared.counters.relay_frames.load(Ordering::Relaxed),
            stream_ref_count,
        })
    }

    /// Replaces the format, rebuilding pools and animator.
    ///
    /// Returns `Ok(false)` when the format is already current. Out-of-bounds
    /// values are rejected without touching the device.
    pub fn set_format(&self, format: VideoFormat) -> Result<bool> {
        let format = format.validated()?;
        let mut state = self.shared.lock_state()?;
        if state.closed {
            return Err(FacadeError::UnknownDevice(self.shared.id));
        }
        if state.format == format {
            return Ok(false);
        }

        let (main_pool, aux_pool) = build_pools(&format, self.shared.pools)?;
        std::mem::replace(&mut state.main_pool, main_pool).retire();
        std::mem::replace(&mut state.aux_pool, aux_pool).retire();
        state.animator = FrameAnimator::new(&format);
        state.last_tick = None;
        let previous = std::mem::replace(&mut state.format, format);
        self.shared
            .frame_interval_ns
            .store(format.frame_interval().as_nanos() as u64, Ordering::Release);

        tracing::info!(device = %self.shared.id, from = %previous, to = %format, "device reformatted");
        Ok(true)
    }

    pub fn property(&self, key: DevicePropertyKey) -> Result<DeviceProperty> {
        Ok(match key {
            DevicePropertyKey::Magic => DeviceProperty::Magic(MAGIC_VALUE),
            DevicePropertyKey::Uid => DeviceProperty::Uid(self.shared.id),
            DevicePropertyKey::Name => DeviceProperty::Name(self.shared.name.clone()),
            DevicePropertyKey::Dimensions => DeviceProperty::Dimensions(self.format()?.dimensions()),
            DevicePropertyKey::FrameRate => DeviceProperty::FrameRate(self.format()?.frame_rate),
            DevicePropertyKey::TransportType => DeviceProperty::TransportType(TransportType::Virtual),
            DevicePropertyKey::Model => DeviceProperty::Model(self.shared.model.clone()),
        })
    }

    pub fn properties(&self, keys: &[DevicePropertyKey]) -> Result<Vec<DeviceProperty>> {
        keys.iter().map(|key| self.property(*key)).collect()
    }

    pub fn attach_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> Result<ConsumerId> {
        self.shared.source.attach_consumer(consumer)
    }

    pub fn detach_consumer(&self, id: ConsumerId) -> Result<bool> {
        self.shared.source.detach_consumer(id)
    }

    /// Source `start`: adds a stream reference and arms the frame loop on the
    /// first one. Returns the new reference count.
    pub fn start_source(&self) -> Result<u32> {
        let mut state = self.shared.lock_state()?;
        if state.closed {
            return Err(FacadeError::UnknownDevice(self.shared.id));
        }
        if state.frame_loop.is_none() {
            state.frame_loop = Some(FrameLoop::spawn(self.shared.clone())?);
            state.last_tick = None;
            tracing::info!(device = %self.shared.id, "frame loop armed");
        }
        state.stream_ref_count += 1;
        tracing::info!(device = %self.shared.id, ref_count = state.stream_ref_count, "source started");
        Ok(state.stream_ref_count)
    }

    /// Source `stop`: drops a stream reference (never below zero) and tears
    /// the frame loop down when the last one goes. Returns the new count.
    pub fn stop_source(&self) -> Result<u32> {
        let (ref_count, finished) = {
            let mut state = self.shared.lock_state()?;
            state.stream_ref_count = state.stream_ref_count.saturating_sub(1);
            let finished = if state.stream_ref_count == 0 {
                state.frame_loop.take()
            } else {
                None
            };
            (state.stream_ref_count, finished)
        };

        if let Some(frame_loop) = finished {
            frame_loop.stop();
            tracing::info!(device = %self.shared.id, "frame loop torn down");
        }
        tracing::info!(device = %self.shared.id, ref_count, "source stopped");
        Ok(ref_count)
    }

    /// Sink `authorize`: binds `client` unless another client holds the sink.
    pub fn authorize_sink(&self, client: Arc<dyn SinkClient>) -> Result<bool> {
        if self.shared.lock_state()?.closed {
            return Ok(false);
        }
        self.shared.sink.authorize(client)
    }

    /// Sink `start`: switches the device to relaying the bound client's frames.
    pub fn start_sink(&self) -> Result<()> {
        let client = self.shared.sink.start()?;
        let client_id = client.id();
        let worker = RelayWorker::spawn(self.shared.clone(), client)?;

        {
            let mut state = self.shared.lock_state()?;
            if state.closed {
                worker.cancel();
                return Err(FacadeError::UnknownDevice(self.shared.id));
            }
            state.producer = ProducerMode::Relay(client_id);
            // Cancelled under the lock so a forward already waiting on it
            // sees the token set.
            if let Some(previous) = state.relay.replace(worker) {
                previous.cancel();
            }
        }

        tracing::info!(device = %self.shared.id, client = %client_id, "relaying from sink");
        Ok(())
    }

    /// Sink `stop`: releases the binding and falls back to synthetic frames.
    pub fn stop_sink(&self) -> Result<()> {
        let client = self.shared.sink.stop()?;
        {
            let mut state = self.shared.lock_state()?;
            state.producer = ProducerMode::Synthetic;
            if let Some(worker) = state.relay.take() {
                worker.cancel();
            }
        }

        if let Some(client) = client {
            tracing::info!(device = %self.shared.id, client = %client.id(), "sink stopped");
        }
        Ok(())
    }

    pub fn sink_client(&self) -> Result<Option<ClientId>> {
        self.shared.sink.bound_client()
    }

    /// Sink `consumeNext`, for hosts that pull from the sink themselves.
    pub fn consume_next(&self, client: &dyn SinkClient) -> Result<Consumed> {
        self.shared.sink.consume_next(client)
    }

    /// Tears the device down regardless of its stream reference count.
    ///
    /// Delivery through the source is closed before anything else, and the
    /// frame loop is joined before the pools are released. Safe to call more
    /// than once.
    ///
    /// When called from inside one of this device's own deliveries the gate
    /// is already held for reading on this thread, so it is left alone; the
    /// closed flag still stops every later tick and relayed sample.
    pub(crate) fn shutdown(&self) {
        let reentrant = DELIVERING.with(|current| current.get() == Some(self.shared.id));
        if reentrant {
            tracing::warn!(device = %self.shared.id, "device destroyed from inside its own frame delivery");
        } else {
            *self
                .shared
                .delivery_open
                .write()
                .unwrap_or_else(PoisonError::into_inner) = false;
        }

        let (frame_loop, pools) = {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.closed = true;
            state.stream_ref_count = 0;
            state.producer = ProducerMode::Synthetic;
            if let Some(relay) = state.relay.take() {
                relay.cancel();
            }
            (
                state.frame_loop.take(),
                (state.main_pool.clone(), state.aux_pool.clone()),
            )
        };

        if let Some(frame_loop) = frame_loop {
            frame_loop.stop();
        }
        let _ = self.shared.sink.stop();
        pools.0.retire();
        pools.1.retire();

        tracing::info!(device = %self.shared.id, "device destroyed");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("source", &self.shared.source)
            .field("sink", &self.shared.sink)
            .finish()
    }
}

impl DeviceShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| FacadeError::Poisoned("device state"))
    }

    /// One frame loop period.
    fn tick(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.closed || state.stream_ref_count == 0 {
            return Ok(());
        }

        if let ProducerMode::Relay(_) = state.producer {
            if let Some(relay) = &state.relay {
                relay.request();
            }
            return Ok(());
        }

        let now = self.clock.now();
        let elapsed = match state.last_tick {
            Some(last) => now.saturating_duration_since(last),
            None => state.format.frame_interval(),
        };
        state.last_tick = Some(now);

        let mut buffer = match state.main_pool.acquire() {
            Ok(buffer) => buffer,
            Err(exhausted) => {
                state.gap = true;
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device = %self.id, "{exhausted}; skipping tick");
                return Ok(());
            }
        };
        buffer.copy_from_slice(state.animator.next_frame(elapsed));
        let format = state.format;
        let discontinuity = state.take_gap(Discontinuity::NONE);
        drop(state);

        let frame = Frame::new(buffer, format, self.clock.now(), discontinuity, None);
        self.deliver(&frame)
    }

    /// Copies a relayed sample into an auxiliary buffer, sends it and
    /// acknowledges it to the client. Discarded if the relay was cancelled
    /// or `client` no longer feeds the device.
    fn forward_relayed(
        &self,
        delivery: SinkDelivery,
        cancel: &CancelToken,
        client: &dyn SinkClient,
    ) -> Result<()> {
        let staged = {
            let mut state = self.lock_state()?;
            let relaying = state.producer == ProducerMode::Relay(client.id());
            if cancel.is_cancelled() || state.closed || !relaying {
                tracing::debug!(
                    device = %self.id,
                    sequence = delivery.sequence_number,
                    "relay cancelled; dropping sample"
                );
                return Ok(());
            }

            if delivery.data.len() != state.format.frame_len() {
                tracing::warn!(
                    device = %self.id,
                    got = delivery.data.len(),
                    expected = state.format.frame_len(),
                    "relayed sample does not match the device format"
                );
                state.gap = true;
                None
            } else {
                match state.aux_pool.acquire() {
                    Ok(mut buffer) if state.stream_ref_count > 0 => {
                        buffer.copy_from_slice(&delivery.data);
                        let discontinuity = state.take_gap(delivery.discontinuity);
                        Some(Some((buffer, state.format, discontinuity)))
                    }
                    Ok(_) => Some(None),
                    Err(exhausted) => {
                        tracing::debug!(device = %self.id, "{exhausted}; dropping relayed sample");
                        state.gap = true;
                        None
                    }
                }
            }
        };

        let host_time = self.clock.now();
        match staged {
            Some(Some((buffer, format, discontinuity))) => {
                let frame = Frame::new(
                    buffer,
                    format,
                    host_time,
                    discontinuity,
                    Some(delivery.sequence_number),
                );
                self.counters.relay_frames.fetch_add(1, Ordering::Relaxed);
                self.deliver(&frame)?;
            }
            // Nobody is streaming; the sample is acknowledged and let go.
            Some(None) => {}
            None => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        client.scheduled_output(ScheduledOutput {
            sequence_number: delivery.sequence_number,
            host_time,
        });
        Ok(())
    }

    fn deliver(&self, frame: &Frame) -> Result<()> {
        let open = self
            .delivery_open
            .read()
            .map_err(|_| FacadeError::Poisoned("device delivery gate"))?;
        if !*open {
            return Ok(());
        }

        let outer = DELIVERING.with(|current| current.replace(Some(self.id)));
        let sent = self.source.send(frame);
        DELIVERING.with(|current| current.set(outer));
        sent
    }
}

impl DeviceState {
    /// Flags `discontinuity` as following a gap if frames were skipped since
    /// the last delivery, and clears the gap.
    fn take_gap(&mut self, mut discontinuity: Discontinuity) -> Discontinuity {
        if std::mem::take(&mut self.gap) {
            discontinuity.insert(Discontinuity::SAMPLE_DROPPED);
        }
        discontinuity
    }
}

fn build_pools(
    format: &VideoFormat,
    settings: PoolSettings,
) -> Result<(FrameBufferPool, FrameBufferPool)> {
    let main = FrameBufferPool::new("main", format, settings.main_capacity, settings.prewarm)?;
    let aux = FrameBufferPool::new("aux", format, settings.aux_capacity, settings.prewarm)?;
    Ok((main, aux))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{ManualClock, MonotonicClock, SinkSample};

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            pool_prewarm: 0,
            ..Default::default()
        }
    }

    fn device(format: VideoFormat) -> Device {
        Device::new(
            DeviceId::new_random(),
            "Test Camera",
            format,
            &test_config(),
            Arc::new(MonotonicClock::start()),
        )
        .unwrap()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    struct Idle(ClientId);

    impl SinkClient for Idle {
        fn id(&self) -> ClientId {
            self.0
        }

        fn consume_sample(&self) -> Option<SinkSample> {
            None
        }

        fn scheduled_output(&self, _output: ScheduledOutput) {}
    }

    #[test]
    fn device_ids_render_uppercase_and_parse_back() {
        let id = DeviceId::new_random();
        let text = id.to_string();
        assert_eq!(text, text.to_uppercase());
        assert_eq!(text.to_lowercase().parse::<DeviceId>().unwrap(), id);
        assert!("not-a-uuid".parse::<DeviceId>().is_err());
    }

    #[test]
    fn set_format_replaces_only_on_change() {
        let device = device(VideoFormat::new(64, 48, 30));
        assert!(!device.set_format(VideoFormat::new(64, 48, 30)).unwrap());
        assert!(device.set_format(VideoFormat::new(128, 96, 60)).unwrap());
        assert_eq!(device.format().unwrap(), VideoFormat::new(128, 96, 60));
    }

    #[test]
    fn out_of_bounds_format_leaves_device_untouched() {
        let device = device(VideoFormat::new(64, 48, 30));
        for format in [
            VideoFormat::new(8, 48, 30),
            VideoFormat::new(64, 9000, 30),
            VideoFormat::new(64, 48, 5),
            VideoFormat::new(64, 48, 240),
        ] {
            assert!(matches!(
                device.set_format(format),
                Err(FacadeError::InvalidFormat { .. })
            ));
            assert_eq!(device.format().unwrap(), VideoFormat::new(64, 48, 30));
        }
    }

    #[test]
    fn properties_project_current_state() {
        let device = device(VideoFormat::new(640, 480, 24));
        let values = device
            .properties(&[DevicePropertyKey::Dimensions, DevicePropertyKey::FrameRate])
            .unwrap();
        assert_eq!(values[0].to_string(), "640x480");
        assert_eq!(values[1], DeviceProperty::FrameRate(24));
        assert_eq!(
            device.property(DevicePropertyKey::Name).unwrap(),
            DeviceProperty::Name("Test Camera".to_string())
        );
    }

    #[test]
    fn source_references_are_counted() {
        let device = device(VideoFormat::new(32, 32, 30));
        assert_eq!(device.start_source().unwrap(), 1);
        assert_eq!(device.start_source().unwrap(), 2);
        assert!(device.is_producing().unwrap());

        assert_eq!(device.stop_source().unwrap(), 1);
        assert!(device.is_producing().unwrap());
        assert_eq!(device.stop_source().unwrap(), 0);
        assert!(!device.is_producing().unwrap());

        assert_eq!(device.stop_source().unwrap(), 0);
    }

    #[test]
    fn producing_device_delivers_synthetic_frames() {
        let device = device(VideoFormat::new(32, 32, 120));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        device
            .attach_consumer(Arc::new(move |frame: &Frame| {
                assert_eq!(frame.data().len(), 32 * 32 * 4);
                assert!(frame.sequence_number().is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        device.start_source().unwrap();
        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) >= 3));
        device.stop_source().unwrap();
    }

    #[test]
    fn sink_mode_follows_start_and_stop() {
        let device = device(VideoFormat::new(32, 32, 30));
        assert!(device.authorize_sink(Arc::new(Idle(ClientId(1)))).unwrap());
        assert!(!device.authorize_sink(Arc::new(Idle(ClientId(2)))).unwrap());

        device.start_sink().unwrap();
        assert_eq!(device.producer_mode().unwrap(), ProducerMode::Relay(ClientId(1)));

        device.stop_sink().unwrap();
        assert_eq!(device.producer_mode().unwrap(), ProducerMode::Synthetic);
        assert!(device.authorize_sink(Arc::new(Idle(ClientId(2)))).unwrap());
    }

    #[test]
    fn exhausted_pool_skips_the_tick() {
        let config = ProviderConfig {
            main_pool_capacity: 2,
            pool_prewarm: 0,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::default());
        let device = Device::new(
            DeviceId::new_random(),
            "Hoarded",
            VideoFormat::new(16, 16, 30),
            &config,
            clock,
        )
        .unwrap();

        let held = Arc::new(Mutex::new(Vec::new()));
        let hoard = held.clone();
        device
            .attach_consumer(Arc::new(move |frame: &Frame| {
                hoard.lock().unwrap().push(frame.clone());
            }))
            .unwrap();

        device.shared.lock_state().unwrap().stream_ref_count = 1;
        for _ in 0..4 {
            device.shared.tick().unwrap();
        }

        assert_eq!(held.lock().unwrap().len(), 2);
        let stats = device.stats().unwrap();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_dropped, 2);

        held.lock().unwrap().clear();
        device.shared.tick().unwrap();
        assert_eq!(device.stats().unwrap().frames_sent, 3);
        let resumed = held.lock().unwrap()[0].discontinuity();
        assert!(resumed.contains(Discontinuity::SAMPLE_DROPPED));

        held.lock().unwrap().clear();
        device.shared.tick().unwrap();
        assert_eq!(held.lock().unwrap()[0].discontinuity(), Discontinuity::NONE);
    }

    struct Counted {
        id: ClientId,
        acknowledged: AtomicUsize,
    }

    impl SinkClient for Counted {
        fn id(&self) -> ClientId {
            self.id
        }

        fn consume_sample(&self) -> Option<SinkSample> {
            None
        }

        fn scheduled_output(&self, _output: ScheduledOutput) {
            self.acknowledged.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sample_consumed_before_sink_stop_is_not_forwarded() {
        let format = VideoFormat::new(16, 16, 30);
        let device = device(format);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        device
            .attach_consumer(Arc::new(move |_: &Frame| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        device.shared.lock_state().unwrap().stream_ref_count = 1;

        let client = Arc::new(Counted {
            id: ClientId(4),
            acknowledged: AtomicUsize::new(0),
        });
        device.authorize_sink(client.clone()).unwrap();
        device.start_sink().unwrap();

        // A token the worker held before the stop; the producer mode alone
        // must keep the sample out.
        let stale = CancelToken::new();
        device.stop_sink().unwrap();
        let sample = SinkDelivery {
            data: vec![1; format.frame_len()].into(),
            sequence_number: 0,
            discontinuity: Discontinuity::NONE,
        };
        device
            .shared
            .forward_relayed(sample, &stale, client.as_ref())
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(client.acknowledged.load(Ordering::SeqCst), 0);
        assert_eq!(device.stats().unwrap().relay_frames, 0);
    }

    #[test]
    fn consumer_may_destroy_its_own_device() {
        let device = device(VideoFormat::new(32, 32, 120));
        let slot = Arc::new(Mutex::new(None::<Device>));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let owner = slot.clone();
        device
            .attach_consumer(Arc::new(move |_: &Frame| {
                let taken = owner.lock().unwrap().take();
                if let Some(device) = taken {
                    drop(device);
                    let _ = done_tx.try_send(());
                }
            }))
            .unwrap();
        device.start_source().unwrap();
        let shared = device.shared.clone();
        *slot.lock().unwrap() = Some(device);

        assert!(done_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        // Let the delivery that did the destroying finish counting itself.
        thread::sleep(Duration::from_millis(20));
        let after = shared.source.frames_sent();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(shared.source.frames_sent(), after);
        assert!(shared.lock_state().unwrap().closed);
    }

    #[test]
    fn shutdown_closes_delivery_and_rejects_restart() {
        let device = device(VideoFormat::new(32, 32, 120));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        device
            .attach_consumer(Arc::new(move |_: &Frame| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        device.start_source().unwrap();
        device.start_source().unwrap();
        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) > 0));

        device.shutdown();
        let after = seen.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), after);
        assert_eq!(device.stream_ref_count().unwrap(), 0);
        assert!(device.start_source().is_err());
    }
}
