//! tokio driver pumping transport events, timers and user commands into a
//! [`DfuController`].

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::error::{DfuError, DfuResult};
use super::protocol::{DfuController, DfuOutcome, DfuStage};
use super::transport::{GattEvent, GattTransport};
use crate::traits::PeripheralSelector;

/// User requests accepted while an update runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuCommand {
    Pause,
    Resume,
    Abort,
}

/// Cloneable remote control for a running update.
#[derive(Debug, Clone)]
pub struct DfuHandle {
    commands: UnboundedSender<DfuCommand>,
}

impl DfuHandle {
    /// Returns false once the update has finished.
    pub fn pause(&self) -> bool {
        self.commands.send(DfuCommand::Pause).is_ok()
    }

    pub fn resume(&self) -> bool {
        self.commands.send(DfuCommand::Resume).is_ok()
    }

    pub fn abort(&self) -> bool {
        self.commands.send(DfuCommand::Abort).is_ok()
    }
}

/// Create a handle and the command receiver to pass to [`run`].
pub fn channel() -> (DfuHandle, UnboundedReceiver<DfuCommand>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    (DfuHandle { commands }, receiver)
}

/// Run an update to the end.
///
/// `events` carries every [`GattEvent`] the platform adapter produces for
/// `transport`. Stages are passed to `on_stage` as they happen.
pub async fn run<T, S, F>(
    mut controller: DfuController<S>,
    transport: &mut T,
    mut events: UnboundedReceiver<GattEvent>,
    mut commands: UnboundedReceiver<DfuCommand>,
    mut on_stage: F,
) -> DfuResult<DfuOutcome>
where
    T: GattTransport + ?Sized,
    S: PeripheralSelector,
    F: FnMut(DfuStage),
{
    controller.start(transport);
    let mut deadline: Option<Instant> = None;

    loop {
        while let Some(stage) = controller.poll_stage() {
            on_stage(stage);
        }
        if let Some(delay) = controller.take_timer() {
            debug!("Timer set for {}ms", delay.as_millis());
            deadline = Some(Instant::now() + delay);
        }
        if let Some(outcome) = controller.take_outcome() {
            return outcome;
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => controller.handle_event(event, transport),
                None => {
                    return Err(DfuError::DeviceDisconnected {
                        reason: "transport event channel closed".to_string(),
                    })
                }
            },
            Some(command) = commands.recv() => {
                info!("Command: {:?}", command);
                match command {
                    DfuCommand::Pause => {
                        controller.pause();
                    }
                    DfuCommand::Resume => {
                        controller.resume(transport);
                    }
                    DfuCommand::Abort => controller.abort(transport),
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                controller.timer_fired(transport);
            }
        }
    }
}
