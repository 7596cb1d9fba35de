use std::sync::{Arc, Mutex};

use crossfire::TrySendError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use universe_core::{TickGate, UniverseConfig, WorldSnapshot};

use crate::command::{CommandSender, SchedulerCommand};
use crate::scheduler::{SharedStatus, lock_status};

/// Snapshot of configuration state returned to external clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub tick: u64,
    pub config: Value,
}

impl ConfigSnapshot {
    fn new(config: &UniverseConfig, tick: u64) -> Result<Self, ControlError> {
        let config = serde_json::to_value(config).map_err(ControlError::serialization)?;
        Ok(Self { tick, config })
    }
}

/// Enumeration describing the primitive type of a knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobKind {
    Number,
    Integer,
    Boolean,
    String,
    Array,
    Object,
    Null,
}

/// Public descriptor for a single configuration knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnobEntry {
    pub path: String,
    pub kind: KnobKind,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Request payload for updating a configuration knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobUpdate {
    pub path: String,
    pub value: Value,
}

impl KnobUpdate {
    /// Parse `path=value`. The value is read as JSON, falling back to a raw string.
    pub fn parse_assignment(raw: &str) -> Result<Self, ControlError> {
        let Some((path, value)) = raw.split_once('=') else {
            return Err(ControlError::InvalidPatch(format!(
                "expected PATH=VALUE, got '{raw}'"
            )));
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(ControlError::InvalidPatch("empty knob path".into()));
        }
        let value = value.trim();
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
        Ok(Self {
            path: path.to_owned(),
            value,
        })
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    InvalidPatch(String),
    #[error("unknown knob path: {0}")]
    UnknownPath(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("a tick is already in flight; try again after it completes")]
    TickInProgress,
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
}

impl ControlError {
    fn serialization(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

type KnobsCache = Arc<Mutex<Option<(u64, Vec<KnobEntry>)>>>;

/// Shared handle used by the CLI and console surfaces to steer the running scheduler.
#[derive(Clone)]
pub struct ControlHandle {
    status: SharedStatus,
    gate: TickGate,
    commands: CommandSender,
    knobs_cache: KnobsCache,
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("tick_busy", &self.gate.is_busy())
            .finish_non_exhaustive()
    }
}

impl ControlHandle {
    pub fn new(status: SharedStatus, gate: TickGate, commands: CommandSender) -> Self {
        Self {
            status,
            gate,
            commands,
            knobs_cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Current configuration as last accepted by the scheduler.
    pub fn snapshot(&self) -> Result<ConfigSnapshot, ControlError> {
        let status = lock_status(&self.status);
        ConfigSnapshot::new(&status.config, status.tick.0)
    }

    #[must_use]
    pub fn latest_snapshot(&self) -> Option<WorldSnapshot> {
        lock_status(&self.status).latest.clone()
    }

    /// Ask for one tick now.
    ///
    /// Rejected while a tick is running; otherwise queued behind whatever the
    /// scheduler is doing, so it never overlaps another tick.
    pub fn trigger_tick(&self) -> Result<(), ControlError> {
        if self.gate.is_busy() {
            return Err(ControlError::TickInProgress);
        }
        self.enqueue(SchedulerCommand::TickNow)
    }

    /// Let the in-flight tick finish, then stop scheduling.
    pub fn shutdown(&self) -> Result<(), ControlError> {
        self.enqueue(SchedulerCommand::Shutdown)
    }

    /// Flatten the configuration into individual knob descriptors for discovery.
    pub fn list_knobs(&self) -> Result<Vec<KnobEntry>, ControlError> {
        let (revision, config) = {
            let status = lock_status(&self.status);
            (status.config_revision, status.config.clone())
        };
        let mut cache = self
            .knobs_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((cached_revision, cached)) = cache.as_ref()
            && *cached_revision == revision
        {
            return Ok(cached.clone());
        }
        let entries = knobs_for(&config)?;
        *cache = Some((revision, entries.clone()));
        Ok(entries)
    }

    /// Validate a JSON patch against the current configuration and queue it.
    ///
    /// The returned snapshot shows the configuration that will be in force from the
    /// next tick boundary.
    pub fn apply_patch(&self, patch: &Value) -> Result<ConfigSnapshot, ControlError> {
        let (tick, current) = {
            let status = lock_status(&self.status);
            (status.tick.0, status.config.clone())
        };
        let next = patch_config(&current, patch)?;
        if next.world_size.to_bits() != current.world_size.to_bits() {
            return Err(ControlError::InvalidPatch(
                "changing world_size at runtime is not supported; restart the universe with the new configuration"
                    .into(),
            ));
        }
        let snapshot = ConfigSnapshot::new(&next, tick)?;
        self.enqueue(SchedulerCommand::UpdateConfig(Box::new(next)))?;
        Ok(snapshot)
    }

    /// Apply a list of knob updates by path.
    pub fn apply_updates(&self, updates: &[KnobUpdate]) -> Result<ConfigSnapshot, ControlError> {
        self.apply_patch(&updates_to_patch(updates)?)
    }

    fn enqueue(&self, command: SchedulerCommand) -> Result<(), ControlError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ControlError::CommandQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::CommandQueueClosed),
        }
    }
}

/// Flatten `config` into dot-delimited knobs.
pub fn knobs_for(config: &UniverseConfig) -> Result<Vec<KnobEntry>, ControlError> {
    let value = serde_json::to_value(config).map_err(ControlError::serialization)?;
    let mut entries = Vec::with_capacity(48);
    let mut prefix = String::new();
    flatten_value(&mut prefix, &value, &mut entries);
    Ok(entries)
}

/// Merge a JSON object onto `current`, then deserialize and validate the result.
///
/// Unknown paths and type mismatches are rejected; numeric and boolean knobs also
/// accept their string spellings.
pub fn patch_config(current: &UniverseConfig, patch: &Value) -> Result<UniverseConfig, ControlError> {
    if !patch.is_object() {
        return Err(ControlError::InvalidPatch(
            "configuration patch must be a JSON object".into(),
        ));
    }
    let mut value = serde_json::to_value(current).map_err(ControlError::serialization)?;
    let mut path = Vec::with_capacity(4);
    merge_value(&mut value, patch, &mut path)?;
    let next: UniverseConfig = serde_json::from_value(value)
        .map_err(|err| ControlError::InvalidPatch(err.to_string()))?;
    next.validate()
        .map_err(|err| ControlError::InvalidPatch(err.to_string()))?;
    Ok(next)
}

/// Fold path/value pairs into one nested patch object.
pub fn updates_to_patch(updates: &[KnobUpdate]) -> Result<Value, ControlError> {
    let mut patch = Map::new();
    for update in updates {
        insert_path(&mut patch, &update.path, update.value.clone())?;
    }
    Ok(Value::Object(patch))
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), ControlError> {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let Some(mut segment) = segments.next() else {
        return Err(ControlError::InvalidPatch("empty knob path".into()));
    };
    let mut cursor = map;
    for next in segments {
        let entry = cursor
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        cursor = entry.as_object_mut().ok_or_else(|| {
            ControlError::InvalidPatch(format!("segment '{segment}' is not an object"))
        })?;
        segment = next;
    }
    cursor.insert(segment.to_owned(), value);
    Ok(())
}

fn mismatch(path: &[&str]) -> ControlError {
    ControlError::InvalidPatch(format!("type mismatch at {}", path.join(".")))
}

fn unparsable(path: &[&str], raw: &str) -> ControlError {
    ControlError::InvalidPatch(format!("cannot parse '{raw}' for {}", path.join(".")))
}

fn merge_value<'a>(
    target: &mut Value,
    patch: &'a Value,
    path: &mut Vec<&'a str>,
) -> Result<(), ControlError> {
    match target {
        Value::Object(target_map) => {
            let Value::Object(patch_map) = patch else {
                return Err(mismatch(path));
            };
            for (key, patch_value) in patch_map {
                path.push(key);
                let Some(slot) = target_map.get_mut(key) else {
                    return Err(ControlError::UnknownPath(path.join(".")));
                };
                merge_value(slot, patch_value, path)?;
                path.pop();
            }
            Ok(())
        }
        Value::Number(_) => {
            let replacement = match patch {
                Value::Number(n) => Value::Number(n.clone()),
                Value::String(raw) => parse_number_like(target, raw.trim(), path)?,
                // Clears optional knobs; required numbers fail deserialization instead.
                Value::Null => Value::Null,
                _ => return Err(mismatch(path)),
            };
            *target = replacement;
            Ok(())
        }
        Value::Bool(_) => {
            let replacement = match patch {
                Value::Bool(b) => *b,
                Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" | "on" => true,
                    "false" | "0" | "no" | "off" => false,
                    _ => return Err(unparsable(path, raw)),
                },
                _ => return Err(mismatch(path)),
            };
            *target = Value::Bool(replacement);
            Ok(())
        }
        Value::String(_) => match patch {
            Value::String(_) => {
                *target = patch.clone();
                Ok(())
            }
            _ => Err(mismatch(path)),
        },
        Value::Array(_) => match patch {
            Value::Array(_) => {
                *target = patch.clone();
                Ok(())
            }
            _ => Err(mismatch(path)),
        },
        // Optional knobs (the RNG seed) serialize as null; deserialization checks the type.
        Value::Null => {
            *target = patch.clone();
            Ok(())
        }
    }
}

fn parse_number_like(target: &Value, raw: &str, path: &[&str]) -> Result<Value, ControlError> {
    if target.is_u64() {
        return raw
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| unparsable(path, raw));
    }
    if target.is_i64() {
        return raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| unparsable(path, raw));
    }
    let parsed: f64 = raw.parse().map_err(|_| unparsable(path, raw))?;
    serde_json::Number::from_f64(parsed)
        .map(Value::Number)
        .ok_or_else(|| {
            ControlError::InvalidPatch(format!("non-finite float at {}", path.join(".")))
        })
}

fn flatten_value(prefix: &mut String, value: &Value, entries: &mut Vec<KnobEntry>) {
    match value {
        Value::Object(map) => {
            let base = prefix.len();
            for (key, child) in map {
                if base != 0 {
                    prefix.push('.');
                }
                prefix.push_str(key);
                flatten_value(prefix, child, entries);
                prefix.truncate(base);
            }
        }
        _ => entries.push(KnobEntry {
            path: prefix.clone(),
            kind: knob_kind(value),
            value: value.clone(),
            description: knob_description(prefix).map(str::to_owned),
        }),
    }
}

fn knob_kind(value: &Value) -> KnobKind {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => KnobKind::Integer,
        Value::Number(_) => KnobKind::Number,
        Value::String(_) => KnobKind::String,
        Value::Bool(_) => KnobKind::Boolean,
        Value::Array(_) => KnobKind::Array,
        Value::Object(_) => KnobKind::Object,
        Value::Null => KnobKind::Null,
    }
}

fn knob_description(path: &str) -> Option<&'static str> {
    let description = match path {
        "world_size" => "side length of the toroidal world; fixed once running",
        "interaction_radius" => "pairs closer than this may interact",
        "max_axis_velocity" => "per-axis velocity clamp",
        "movement_energy_cost" => "energy drained per unit of speed",
        "rng_seed" => "seed for reproducible worlds; null draws from entropy",
        "tick_interval_ms" => "scheduler cadence",
        "thresholds.merge" => "minimum compatibility for a merge",
        "thresholds.bond" => "minimum compatibility for a bond",
        "thresholds.attract" => "minimum compatibility for attraction",
        "lifecycle.inactivity_threshold_secs" => "idle time before decay starts",
        "lifecycle.fission_probability" => "chance an unstable particle splits each tick",
        _ => return None,
    };
    Some(description)
}
