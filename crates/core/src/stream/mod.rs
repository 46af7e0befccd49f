//! Stream endpoints of a device.
//!
//! The [`SourceEndpoint`] is what host-side consumers read frames from; the
//! [`SinkEndpoint`] is where one external producer pushes frames in. Both are
//! owned by a [`Device`](crate::Device), which drives them from its frame loop.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use bytes::Bytes;

use crate::{FacadeError, HostTime, PooledBuffer, Result, VideoFormat};

/// Discontinuity flags carried alongside a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Discontinuity(pub u32);

impl Discontinuity {
    pub const NONE: Discontinuity = Discontinuity(0);
    /// Frames before this one were lost or skipped.
    pub const SAMPLE_DROPPED: Discontinuity = Discontinuity(1 << 6);

    pub fn contains(&self, flags: Discontinuity) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn insert(&mut self, flags: Discontinuity) {
        self.0 |= flags.0;
    }
}

/// One frame as delivered through a source endpoint.
///
/// Cloning is cheap; the pixel buffer goes back to its pool once every clone
/// has been dropped, so a consumer that holds on to frames applies
/// backpressure to the producing device.
#[derive(Clone)]
pub struct Frame {
    buffer: Arc<PooledBuffer>,
    format: VideoFormat,
    host_time: HostTime,
    discontinuity: Discontinuity,
    sequence_number: Option<u64>,
}

impl Frame {
    pub fn new(
        buffer: PooledBuffer,
        format: VideoFormat,
        host_time: HostTime,
        discontinuity: Discontinuity,
        sequence_number: Option<u64>,
    ) -> Self {
        Self {
            buffer: Arc::new(buffer),
            format,
            host_time,
            discontinuity,
            sequence_number,
        }
    }

    /// BGRA pixel data, `format().frame_len()` bytes long.
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    /// Host time sampled when the frame was sent.
    pub fn host_time(&self) -> HostTime {
        self.host_time
    }

    pub fn discontinuity(&self) -> Discontinuity {
        self.discontinuity
    }

    /// Sink sequence number for relayed frames, `None` for synthetic ones.
    pub fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("format", &self.format)
            .field("host_time", &self.host_time)
            .field("discontinuity", &self.discontinuity)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

/// Host-side reader attached to a source endpoint.
///
/// `deliver` runs on the device's timer or relay thread and must not block.
/// A consumer that destroys its own device from `deliver` stops later frames,
/// but a frame already being relayed on the other thread may still arrive.
pub trait FrameConsumer: Send + Sync {
    fn deliver(&self, frame: &Frame);
}

impl<F> FrameConsumer for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn deliver(&self, frame: &Frame) {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

/// Outward-facing stream that consumers read frames from.
pub struct SourceEndpoint {
    consumers: Mutex<Vec<(ConsumerId, Arc<dyn FrameConsumer>)>>,
    next_consumer: AtomicU64,
    frames_sent: AtomicU64,
}

impl SourceEndpoint {
    pub fn new() -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            next_consumer: AtomicU64::new(1),
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn attach_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> Result<ConsumerId> {
        let id = ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed));
        self.lock()?.push((id, consumer));
        Ok(id)
    }

    /// Returns `true` if the consumer was attached.
    pub fn detach_consumer(&self, id: ConsumerId) -> Result<bool> {
        let mut consumers = self.lock()?;
        let before = consumers.len();
        consumers.retain(|(attached, _)| *attached != id);
        Ok(consumers.len() != before)
    }

    /// Hands the frame to every attached consumer.
    ///
    /// Consumers are called without the list locked, so they may attach or
    /// detach from inside `deliver`.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let consumers: Vec<_> = self
            .lock()?
            .iter()
            .map(|(_, consumer)| consumer.clone())
            .collect();
        for consumer in &consumers {
            consumer.deliver(frame);
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<(ConsumerId, Arc<dyn FrameConsumer>)>>> {
        self.consumers
            .lock()
            .map_err(|_| FacadeError::Poisoned("source consumer list"))
    }
}

impl Default for SourceEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceEndpoint")
            .field("frames_sent", &self.frames_sent())
            .finish()
    }
}

/// Opaque identity of an external producer talking to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A frame pushed in by an external producer.
#[derive(Debug, Clone)]
pub struct SinkSample {
    pub data: Bytes,
    pub discontinuity: Discontinuity,
}

impl SinkSample {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            discontinuity: Discontinuity::NONE,
        }
    }
}

/// A sample taken from the sink, numbered in consumption order.
#[derive(Debug, Clone)]
pub struct SinkDelivery {
    pub data: Bytes,
    pub sequence_number: u64,
    pub discontinuity: Discontinuity,
}

#[derive(Debug, Clone)]
pub enum Consumed {
    Sample(SinkDelivery),
    NoMoreSamples,
}

/// Acknowledges that a consumed sample has been scheduled for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledOutput {
    pub sequence_number: u64,
    pub host_time: HostTime,
}

/// Host-side handle to an external producer bound to a sink.
pub trait SinkClient: Send + Sync {
    fn id(&self) -> ClientId;

    /// Takes the producer's next frame. May block until one is ready;
    /// `None` means the producer has nothing to offer right now.
    fn consume_sample(&self) -> Option<SinkSample>;

    /// Tells the producer a sample went out so it may supply the next one.
    fn scheduled_output(&self, output: ScheduledOutput);
}

#[derive(Default)]
struct SinkBinding {
    client: Option<Arc<dyn SinkClient>>,
    started: bool,
}

/// Inward-facing stream that accepts frames from at most one producer.
pub struct SinkEndpoint {
    binding: Mutex<SinkBinding>,
    next_sequence: AtomicU64,
}

impl SinkEndpoint {
    pub fn new() -> Self {
        Self {
            binding: Mutex::new(SinkBinding::default()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Binds `client` if no other client is bound.
    pub fn authorize(&self, client: Arc<dyn SinkClient>) -> Result<bool> {
        let mut binding = self.lock()?;
        if let Some(bound) = &binding.client {
            tracing::debug!(bound = %bound.id(), refused = %client.id(), "sink already bound");
            return Ok(false);
        }
        tracing::info!(client = %client.id(), "sink authorized");
        binding.client = Some(client);
        Ok(true)
    }

    /// Marks the bound client as streaming and returns it.
    pub fn start(&self) -> Result<Arc<dyn SinkClient>> {
        let mut binding = self.lock()?;
        let client = binding.client.clone().ok_or(FacadeError::SinkNotBound)?;
        binding.started = true;
        Ok(client)
    }

    /// Releases the binding. Returns the client that was bound, if any.
    pub fn stop(&self) -> Result<Option<Arc<dyn SinkClient>>> {
        let mut binding = self.lock()?;
        binding.started = false;
        Ok(binding.client.take())
    }

    pub fn bound_client(&self) -> Result<Option<ClientId>> {
        Ok(self.lock()?.client.as_ref().map(|client| client.id()))
    }

    pub fn is_started(&self) -> Result<bool> {
        Ok(self.lock()?.started)
    }

    /// Pulls the next sample from `client`, which must be the bound one.
    ///
    /// The binding lock is released before calling into the client, so a
    /// blocking producer never stalls `authorize`, `stop` or the frame loop.
    pub fn consume_next(&self, client: &dyn SinkClient) -> Result<Consumed> {
        {
            let binding = self.lock()?;
            match &binding.client {
                None => return Err(FacadeError::SinkNotBound),
                Some(bound) if bound.id() != client.id() => {
                    return Err(FacadeError::ClientMismatch)
                }
                Some(_) => {}
            }
        }

        Ok(match client.consume_sample() {
            Some(sample) => Consumed::Sample(SinkDelivery {
                data: sample.data,
                sequence_number: self.next_sequence.fetch_add(1, Ordering::AcqRel),
                discontinuity: sample.discontinuity,
            }),
            None => Consumed::NoMoreSamples,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, SinkBinding>> {
        self.binding
            .lock()
            .map_err(|_| FacadeError::Poisoned("sink binding"))
    }
}

impl Default for SinkEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = self.bound_client().ok().flatten();
        f.debug_struct("SinkEndpoint")
            .field("bound", &bound)
            .finish()
    }
}
