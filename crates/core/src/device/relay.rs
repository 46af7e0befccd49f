use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender};

use super::DeviceShared;
use crate::{Consumed, FacadeError, Result, SinkClient};

/// Shared flag that tells a relay worker its results are no longer wanted.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Moves samples from the sink's bound client to the source, one at a time.
///
/// The frame loop asks for a sample with [`request`](Self::request); a new
/// request is only accepted once the previous consume has completed, so at
/// most one sample is ever outstanding.
pub(crate) struct RelayWorker {
    cancel: CancelToken,
    requests: Sender<()>,
    in_flight: Arc<AtomicBool>,
}

impl RelayWorker {
    pub(crate) fn spawn(shared: Arc<DeviceShared>, client: Arc<dyn SinkClient>) -> Result<Self> {
        let cancel = CancelToken::new();
        let in_flight = Arc::new(AtomicBool::new(false));
        let (requests, requests_rx) = crossbeam_channel::bounded(1);

        let worker_cancel = cancel.clone();
        let worker_in_flight = in_flight.clone();
        let name = format!("facade-relay-{}", shared.id.short());
        thread::Builder::new()
            .name(name)
            .spawn(move || run(shared, client, requests_rx, worker_cancel, worker_in_flight))
            .map_err(|err| FacadeError::msg(format!("failed to spawn relay worker: {err}")))?;

        Ok(Self {
            cancel,
            requests,
            in_flight,
        })
    }

    /// Asks for the next sample unless one is still being consumed.
    pub(crate) fn request(&self) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.requests.try_send(()).is_err() {
            self.in_flight.store(false, Ordering::Release);
        }
    }

    /// Abandons the worker. A consume already in progress runs to completion
    /// but its sample is discarded.
    pub(crate) fn cancel(self) {
        self.cancel.cancel();
    }
}

fn run(
    shared: Arc<DeviceShared>,
    client: Arc<dyn SinkClient>,
    requests: Receiver<()>,
    cancel: CancelToken,
    in_flight: Arc<AtomicBool>,
) {
    tracing::debug!(device = %shared.id, client = %client.id(), "relay worker started");

    while requests.recv().is_ok() {
        if cancel.is_cancelled() {
            break;
        }

        match shared.sink.consume_next(client.as_ref()) {
            Ok(Consumed::Sample(delivery)) => {
                if let Err(err) = shared.forward_relayed(delivery, &cancel, client.as_ref()) {
                    tracing::warn!(device = %shared.id, error = %err, "failed to forward relayed sample");
                }
            }
            Ok(Consumed::NoMoreSamples) => {
                tracing::trace!(device = %shared.id, "sink has no sample ready");
            }
            Err(err) => {
                tracing::debug!(device = %shared.id, error = %err, "sink consume refused; relay exits");
                break;
            }
        }

        in_flight.store(false, Ordering::Release);
    }

    tracing::debug!(device = %shared.id, client = %client.id(), "relay worker stopped");
}
