//! Line-oriented control console for a running scheduler.
//!
//! Commands: `tick`, `status`, `knobs`, `set PATH=VALUE`, `quit`.

use std::io::{BufRead, Write};

use tracing::warn;

use crate::control::{ControlError, ControlHandle, KnobUpdate};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Tick,
    Status,
    Knobs,
    Set(Vec<KnobUpdate>),
    Quit,
}

pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ControlError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let command = match verb {
        "tick" => ConsoleCommand::Tick,
        "status" => ConsoleCommand::Status,
        "knobs" => ConsoleCommand::Knobs,
        "quit" | "exit" => ConsoleCommand::Quit,
        "set" => {
            let updates = rest
                .split_whitespace()
                .map(KnobUpdate::parse_assignment)
                .collect::<Result<Vec<_>, _>>()?;
            if updates.is_empty() {
                return Err(ControlError::InvalidPatch("set needs PATH=VALUE".into()));
            }
            ConsoleCommand::Set(updates)
        }
        other => {
            return Err(ControlError::InvalidPatch(format!(
                "unknown console command '{other}'"
            )));
        }
    };
    Ok(Some(command))
}

/// Serve console commands until `quit` or end of input. Either way the scheduler is
/// asked to shut down afterwards.
pub fn serve<R: BufRead, W: Write>(handle: &ControlHandle, input: R, mut output: W) -> std::io::Result<()> {
    for line in input.lines() {
        let line = line?;
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                writeln!(output, "error: {err}")?;
                continue;
            }
        };
        match command {
            ConsoleCommand::Tick => match handle.trigger_tick() {
                Ok(()) => writeln!(output, "tick queued")?,
                Err(err) => writeln!(output, "error: {err}")?,
            },
            ConsoleCommand::Status => match handle.latest_snapshot() {
                Some(snapshot) => writeln!(output, "{}", to_json(&snapshot))?,
                None => writeln!(output, "no ticks yet")?,
            },
            ConsoleCommand::Knobs => match handle.list_knobs() {
                Ok(knobs) => {
                    for knob in knobs {
                        writeln!(output, "{} = {}", knob.path, knob.value)?;
                    }
                }
                Err(err) => writeln!(output, "error: {err}")?,
            },
            ConsoleCommand::Set(updates) => match handle.apply_updates(&updates) {
                Ok(snapshot) => writeln!(output, "queued config for tick {}", snapshot.tick + 1)?,
                Err(err) => writeln!(output, "error: {err}")?,
            },
            ConsoleCommand::Quit => break,
        }
        output.flush()?;
    }
    if let Err(err) = handle.shutdown() {
        warn!(error = %err, "could not request scheduler shutdown");
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{SchedulerCommand, create_command_bus, drain_pending_commands};
    use crate::scheduler::SchedulerStatus;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use universe_core::{Tick, TickGate, UniverseConfig};

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_line("  tick ").expect("tick"), Some(ConsoleCommand::Tick));
        assert_eq!(parse_line("# comment").expect("comment"), None);
        assert_eq!(
            parse_line("set thresholds.bond=0.7 tick_interval_ms=500").expect("set"),
            Some(ConsoleCommand::Set(vec![
                KnobUpdate {
                    path: "thresholds.bond".into(),
                    value: Value::from(0.7),
                },
                KnobUpdate {
                    path: "tick_interval_ms".into(),
                    value: Value::from(500),
                },
            ]))
        );
        assert!(parse_line("set").is_err());
        assert!(parse_line("explode").is_err());
    }

    #[test]
    fn serve_queues_ticks_and_shuts_down_at_end_of_input() {
        let status = Arc::new(Mutex::new(SchedulerStatus::new(
            UniverseConfig::default(),
            Tick(0),
        )));
        let (sender, receiver) = create_command_bus(8);
        let handle = ControlHandle::new(status, TickGate::new(), sender);
        let mut output = Vec::new();
        serve(&handle, "tick\nstatus\nbogus\n".as_bytes(), &mut output).expect("serve");

        let text = String::from_utf8(output).expect("utf8");
        assert!(text.contains("tick queued"));
        assert!(text.contains("no ticks yet"));
        assert!(text.contains("unknown console command"));
        assert!(matches!(
            drain_pending_commands(&receiver).as_slice(),
            [SchedulerCommand::TickNow, SchedulerCommand::Shutdown]
        ));
    }
}
