use std::{
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{select, Receiver, Sender};

use super::DeviceShared;
use crate::{FacadeError, Result};

/// Periodic timer thread that drives one device's frame production.
///
/// Each tick re-reads the device's frame interval, so a frame rate change
/// takes effect from the next tick on.
pub(crate) struct FrameLoop {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl FrameLoop {
    pub(crate) fn spawn(shared: Arc<DeviceShared>) -> Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded(1);
        let name = format!("facade-frames-{}", shared.id.short());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(shared, stop_rx))
            .map_err(|err| FacadeError::msg(format!("failed to spawn frame loop: {err}")))?;

        Ok(Self { stop, handle })
    }

    /// Stops the loop and waits for the in-progress tick, if any, to finish.
    pub(crate) fn stop(self) {
        let _ = self.stop.try_send(());
        if self.handle.thread().id() == thread::current().id() {
            // Stopped from inside a tick; the loop exits once the tick returns.
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!("frame loop panicked");
        }
    }
}

fn run(shared: Arc<DeviceShared>, stop: Receiver<()>) {
    tracing::debug!(device = %shared.id, "frame loop started");

    let mut next_tick = Instant::now();
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(crossbeam_channel::at(next_tick)) -> _ => {
                if let Err(err) = shared.tick() {
                    tracing::error!(device = %shared.id, error = %err, "frame tick failed; stopping loop");
                    break;
                }

                let interval = Duration::from_nanos(shared.frame_interval_ns.load(Ordering::Acquire));
                next_tick += interval;
                let now = Instant::now();
                if next_tick < now {
                    next_tick = now + interval;
                }
            }
        }
    }

    tracing::debug!(device = %shared.id, "frame loop stopped");
}
