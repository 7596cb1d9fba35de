use crossfire::mpmc;
use crossfire::{MAsyncTx, MRx, TryRecvError, TrySendError, detect_backoff_cfg};
use tracing::{debug, warn};
use universe_core::UniverseConfig;

/// Instructions delivered to the scheduler thread between ticks.
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Run one tick as soon as the current one (if any) has finished.
    TickNow,
    /// Swap in a validated configuration at the next tick boundary.
    UpdateConfig(Box<UniverseConfig>),
    /// Finish the in-flight tick, then stop scheduling.
    Shutdown,
}

pub type CommandSender = MAsyncTx<SchedulerCommand>;
pub type CommandReceiver = MRx<SchedulerCommand>;

pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity)
}

/// Pull everything currently queued without blocking.
pub fn drain_pending_commands(receiver: &CommandReceiver) -> Vec<SchedulerCommand> {
    let mut drained = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(command) => {
                debug!(?command, "received scheduler command");
                drained.push(command);
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    drained
}

/// Non-blocking submit; `false` when the queue is full or closed.
pub fn submit(sender: &CommandSender, command: SchedulerCommand) -> bool {
    match sender.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(cmd)) => {
            warn!(?cmd, "scheduler command queue full; dropping command");
            false
        }
        Err(TrySendError::Disconnected(cmd)) => {
            warn!(?cmd, "scheduler command queue disconnected");
            false
        }
    }
}
