//! Scheduler, command bus and control surfaces for running a universe.

pub mod command;
pub mod console;
pub mod control;
pub mod scheduler;

pub use command::{CommandReceiver, CommandSender, SchedulerCommand, create_command_bus};
pub use control::{
    ConfigSnapshot, ControlError, ControlHandle, KnobEntry, KnobKind, KnobUpdate, knobs_for,
    patch_config, updates_to_patch,
};
pub use scheduler::{
    Scheduler, SchedulerOptions, SchedulerStatus, SchedulerSummary, SharedStatus,
};

/// Install the global `fmt` subscriber, filtered by `RUST_LOG`. Safe to call twice.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
