//! Core library for the Facade virtual camera provider.
//!
//! A [`Provider`] owns up to four [`Device`]s. Each device renders a
//! placeholder animation, or relays frames pushed into its sink by an
//! external producer, and delivers them through its source to whatever
//! consumers the host attached. The device set can be exported as, and
//! reconciled against, a desired-state document.

pub mod animator;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod host;
pub mod property;
pub mod provider;
pub mod reconcile;
pub mod service;
pub mod stream;

pub use animator::{FrameAnimator, PHASE_PERIOD};
pub use buffer::{FrameBufferPool, PoolExhausted, PooledBuffer};
pub use clock::{HostClock, HostTime, ManualClock, MonotonicClock};
pub use config::{AppConfig, ProviderConfig, MAX_DEVICES};
pub use device::{Device, DeviceId, DeviceSnapshot, DeviceStats, ProducerMode};
pub use error::{FacadeError, Result};
pub use format::{Dimensions, FormatBounds, VideoFormat, BYTES_PER_PIXEL};
pub use host::{DeviceDescriptor, Host, NullHost};
pub use property::{
    DeviceProperty, DevicePropertyKey, PropertyUpdate, ProviderProperty, ProviderPropertyKey,
    TransportType, MAGIC_VALUE,
};
pub use provider::{ImportReport, Provider};
pub use reconcile::{DesiredDocument, EntryWarning, ReconcilePlan, SkipReason};
pub use service::CameraService;
pub use stream::{
    ClientId, Consumed, ConsumerId, Discontinuity, Frame, FrameConsumer, ScheduledOutput,
    SinkClient, SinkDelivery, SinkEndpoint, SinkSample, SourceEndpoint,
};
