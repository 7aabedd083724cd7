//! Cross-tick bookkeeping for GridBot agents.
//!
//! Everything here leans on a persisted key-value store as the sole channel
//! of continuity between tick invocations: repeat suppression keeps a
//! two-generation message log, restart detection fingerprints durable state
//! through spawner identifiers, and both survive arbitrary tick skips and
//! clock resets.

use gridbot_core::Tick;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Durable structured storage owned by the host environment. Values survive
/// process restarts; writes are plain overwrites with no transactions.
pub trait MemoryStore {
    /// Read the value stored under `key`, if any.
    fn read(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`, replacing any previous value.
    fn write(&mut self, key: &str, value: Value);
}

/// Single-blob JSON implementation of [`MemoryStore`], used by tests and by
/// hosts that keep the whole memory tree in one serialized object.
#[derive(Debug, Default, Clone)]
pub struct JsonMemory {
    root: Map<String, Value>,
}

impl JsonMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a memory from a previously serialized blob.
    #[must_use]
    pub fn from_object(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// The underlying object, for serialization by the host.
    #[must_use]
    pub fn as_object(&self) -> &Map<String, Value> {
        &self.root
    }
}

impl MemoryStore for JsonMemory {
    fn read(&self, key: &str) -> Option<Value> {
        self.root.get(key).cloned()
    }

    fn write(&mut self, key: &str, value: Value) {
        self.root.insert(key.to_owned(), value);
    }
}

/// Store keys and thresholds used by the bookkeeping primitives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookkeepingConfig {
    /// Store key holding the repeat-suppression log.
    pub repeat_log_key: String,
    /// Store key holding the restart record.
    pub restart_record_key: String,
    /// Restart detections closer together than this many ticks coalesce
    /// into a single history entry.
    pub restart_debounce: u64,
}

impl Default for BookkeepingConfig {
    fn default() -> Self {
        Self {
            repeat_log_key: "repeat_log".to_owned(),
            restart_record_key: "permanent".to_owned(),
            restart_debounce: 10,
        }
    }
}

/// Outcome of a repeat-suppression check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatDecision {
    /// Not seen during the current or previous tick.
    New,
    /// Already recorded earlier in the current tick.
    DuplicateSameTick,
    /// Seen during the immediately preceding tick.
    DuplicatePreviousTick,
}

impl RepeatDecision {
    #[must_use]
    pub const fn is_new(self) -> bool {
        matches!(self, Self::New)
    }
}

/// Persisted two-generation key log behind [`RepeatSuppressor`].
///
/// `log_current` holds keys seen during `time`; `log_previous` holds keys
/// seen during `time - 1` and is cleared whenever a tick was skipped. At
/// most two generations are ever retained.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepeatLog {
    pub time: Tick,
    pub log_current: BTreeMap<String, bool>,
    pub log_previous: BTreeMap<String, bool>,
}

/// Answers whether a namespaced message is new or a duplicate of something
/// recorded in the current or previous tick.
#[derive(Debug, Clone)]
pub struct RepeatSuppressor {
    memory_key: String,
}

impl Default for RepeatSuppressor {
    fn default() -> Self {
        Self::new(&BookkeepingConfig::default())
    }
}

impl RepeatSuppressor {
    #[must_use]
    pub fn new(config: &BookkeepingConfig) -> Self {
        Self {
            memory_key: config.repeat_log_key.clone(),
        }
    }

    /// Deduplication key for `(namespace, message)`. Only the first
    /// underscore of the namespace is stripped, so distinct namespaces can
    /// collide (`"ab_c"` and `"a_bc"` both map to `"abc"`); the scheme is
    /// kept as-is.
    #[must_use]
    pub fn repeat_key(namespace: &str, message: &str) -> String {
        format!("{}_{}", namespace.replacen('_', "", 1), message)
    }

    /// Check `message` against the persisted log and record it for the
    /// current tick. Every call except the same-tick-duplicate case writes
    /// the rotated log back as one unit.
    pub fn check(
        &self,
        store: &mut dyn MemoryStore,
        now: Tick,
        message: &str,
        namespace: &str,
    ) -> RepeatDecision {
        let mut log = self.load(store, now);

        if log.time != now {
            let carried = std::mem::take(&mut log.log_current);
            log.log_previous = if log.time.next() == now {
                carried
            } else {
                // A skipped tick or a backward clock invalidates history.
                BTreeMap::new()
            };
            log.time = now;
        }

        let key = Self::repeat_key(namespace, message);
        if log.log_current.contains_key(&key) {
            return RepeatDecision::DuplicateSameTick;
        }

        let seen_previous = log.log_previous.contains_key(&key);
        log.log_current.insert(key, true);
        self.persist(store, &log);

        if seen_previous {
            RepeatDecision::DuplicatePreviousTick
        } else {
            RepeatDecision::New
        }
    }

    fn load(&self, store: &dyn MemoryStore, now: Tick) -> RepeatLog {
        store
            .read(&self.memory_key)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_else(|| RepeatLog {
                time: now,
                ..RepeatLog::default()
            })
    }

    fn persist(&self, store: &mut dyn MemoryStore, log: &RepeatLog) {
        match serde_json::to_value(log) {
            Ok(value) => store.write(&self.memory_key, value),
            Err(err) => warn!(key = %self.memory_key, "failed to serialize repeat log: {err}"),
        }
    }
}

/// Destination for operator-facing messages emitted by [`OnceLogger`].
pub trait MessageSink {
    /// Emit a regular message line.
    fn line(&mut self, message: &str);

    /// Emit a warning.
    fn warn(&mut self, message: &str);
}

/// Routes messages through the installed `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn line(&mut self, message: &str) {
        info!(target: "gridbot::console", "{message}");
    }

    fn warn(&mut self, message: &str) {
        warn!(target: "gridbot::console", "{message}");
    }
}

const LOG_NAMESPACE: &str = "log";

/// Spam-controlled logging: a message reaches the sink only when it was not
/// emitted during the current or previous tick.
#[derive(Debug, Clone)]
pub struct OnceLogger<S: MessageSink = TracingSink> {
    suppressor: RepeatSuppressor,
    sink: S,
}

impl OnceLogger<TracingSink> {
    #[must_use]
    pub fn new(config: &BookkeepingConfig) -> Self {
        Self::with_sink(config, TracingSink)
    }
}

impl Default for OnceLogger<TracingSink> {
    fn default() -> Self {
        Self::new(&BookkeepingConfig::default())
    }
}

impl<S: MessageSink> OnceLogger<S> {
    /// Build a logger that emits into a caller-supplied sink.
    pub fn with_sink(config: &BookkeepingConfig, sink: S) -> Self {
        Self {
            suppressor: RepeatSuppressor::new(config),
            sink,
        }
    }

    /// [`Self::log_once_with`] warning on same-tick reuse.
    pub fn log_once(
        &mut self,
        store: &mut dyn MemoryStore,
        now: Tick,
        message: &str,
    ) -> RepeatDecision {
        self.log_once_with(store, now, message, true)
    }

    /// Emit `message` unless it repeats. A same-tick repeat produces a
    /// distinct, non-deduplicated warning when `warn_on_same_tick` is set; a
    /// previous-tick repeat is silently suppressed.
    pub fn log_once_with(
        &mut self,
        store: &mut dyn MemoryStore,
        now: Tick,
        message: &str,
        warn_on_same_tick: bool,
    ) -> RepeatDecision {
        let decision = self.suppressor.check(store, now, message, LOG_NAMESPACE);
        match decision {
            RepeatDecision::New => self.sink.line(message),
            RepeatDecision::DuplicateSameTick if warn_on_same_tick => self
                .sink
                .warn(&format!("reusing message {message:?} in the same tick")),
            _ => {}
        }
        decision
    }

    /// The sink messages are routed into.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Enumerates the persistent spawner structures currently known to the host
/// world. Their identifiers live in durable state, so at least one survives
/// any restart that kept that state intact.
pub trait SpawnerRegistry {
    fn spawner_ids(&self) -> Vec<String>;
}

impl SpawnerRegistry for Vec<String> {
    fn spawner_ids(&self) -> Vec<String> {
        self.clone()
    }
}

impl SpawnerRegistry for &[&str] {
    fn spawner_ids(&self) -> Vec<String> {
        self.iter().map(|id| (*id).to_owned()).collect()
    }
}

/// One entry in the append-only restart history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartEntry {
    /// Tick at which the restart was detected.
    pub start: Tick,
    /// Spawner identifiers visible at detection time.
    pub spawners: Vec<String>,
    /// Set when earlier restarts were coalesced by the debounce window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_restarts_since: Option<Tick>,
}

/// Persisted record behind [`RestartDetector`]. The `restarts` history only
/// grows and is kept for debugging.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_turn: Option<Tick>,
    #[serde(default, deserialize_with = "lenient_id_list")]
    pub spawner_ids: Option<Vec<String>>,
    #[serde(default)]
    pub restarts: Vec<RestartEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_restarts_since: Option<Tick>,
}

/// A `spawner_ids` field that is not a string array degrades to `None`,
/// which is the first-run case rather than an error.
fn lenient_id_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Decides whether this process instance is freshly started or continuing an
/// existing run.
///
/// Spawner-identifier overlap is the durable-state fingerprint: if persisted
/// state survived, at least one previously recorded identifier still
/// resolves. The answer is memoized for the process lifetime; the memo being
/// absent after a restart is exactly the event being detected, so it is
/// never seeded from the store.
#[derive(Debug, Clone)]
pub struct RestartDetector {
    memory_key: String,
    debounce: u64,
    cached: Option<bool>,
}

impl Default for RestartDetector {
    fn default() -> Self {
        Self::new(&BookkeepingConfig::default())
    }
}

impl RestartDetector {
    #[must_use]
    pub fn new(config: &BookkeepingConfig) -> Self {
        Self {
            memory_key: config.restart_record_key.clone(),
            debounce: config.restart_debounce,
            cached: None,
        }
    }

    /// Whether this process instance is executing its first tick.
    pub fn is_first_tick(
        &mut self,
        store: &mut dyn MemoryStore,
        now: Tick,
        spawners: &dyn SpawnerRegistry,
    ) -> bool {
        if let Some(answer) = self.cached {
            return answer;
        }

        let mut record = self.load(store);
        let previous = record.spawner_ids.take();
        let mut current = spawners.spawner_ids();
        current.sort();
        record.spawner_ids = Some(current.clone());

        let answer = match previous {
            None => {
                debug!(tick = %now, "no prior spawner record; first run");
                record.first_turn = Some(now);
                record.restarts.push(RestartEntry {
                    start: now,
                    spawners: current,
                    multiple_restarts_since: None,
                });
                true
            }
            Some(previous) => {
                if previous
                    .iter()
                    .any(|id| current.binary_search(id).is_ok())
                {
                    false
                } else if record
                    .first_turn
                    .is_some_and(|first| now.saturating_since(first) < self.debounce)
                {
                    // Crash-loop: coalesce into the existing history entry.
                    warn!(tick = %now, "restart detected inside debounce window");
                    if record.multiple_restarts_since.is_none() {
                        record.multiple_restarts_since = Some(now);
                    }
                    record.first_turn = Some(now);
                    true
                } else {
                    warn!(tick = %now, "restart detected; recording history entry");
                    record.restarts.push(RestartEntry {
                        start: now,
                        spawners: current,
                        multiple_restarts_since: record.multiple_restarts_since.take(),
                    });
                    record.first_turn = Some(now);
                    true
                }
            }
        };

        self.persist(store, &record);
        self.cached = Some(answer);
        answer
    }

    /// Memoized answer, if one has been computed this process lifetime.
    #[must_use]
    pub const fn cached(&self) -> Option<bool> {
        self.cached
    }

    /// Clears the process-lifetime memo. Tests use this to simulate a
    /// restart without rebuilding the detector.
    pub fn reset_cache(&mut self) {
        self.cached = None;
    }

    fn load(&self, store: &dyn MemoryStore) -> RestartRecord {
        store
            .read(&self.memory_key)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    fn persist(&self, store: &mut dyn MemoryStore, record: &RestartRecord) {
        match serde_json::to_value(record) {
            Ok(value) => store.write(&self.memory_key, value),
            Err(err) => {
                warn!(key = %self.memory_key, "failed to serialize restart record: {err}");
            }
        }
    }
}

/// Errors raised by [`CommandRegistry::exec`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("expected at least one argument naming the command to execute")]
    MissingName,
    #[error("command {0:?} does not exist")]
    UnknownCommand(String),
    #[error("command {0:?} cannot be executed natively")]
    NotNative(String),
}

type NativeHandler = Box<dyn Fn(&[Value]) -> Value + Send + Sync + 'static>;

/// Registry of named command extensions. A command may or may not carry a
/// native handler that can be invoked directly.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Option<NativeHandler>>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("command_count", &self.commands.len())
            .finish()
    }
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command that has no native entry point.
    pub fn register(&mut self, name: impl Into<String>) {
        self.commands.insert(name.into(), None);
    }

    /// Register a command with a directly invokable native handler.
    pub fn register_native<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.commands.insert(name.into(), Some(Box::new(handler)));
    }

    /// Returns whether a command is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Dispatch `argv[0]` as a command name. The native handler receives the
    /// full argv, name included. Fails fast; nothing is retried.
    pub fn exec(&self, argv: &[Value]) -> Result<Value, CommandError> {
        let Some(first) = argv.first() else {
            return Err(CommandError::MissingName);
        };
        let name = match first.as_str() {
            Some(name) => name.to_owned(),
            None => first.to_string(),
        };
        match self.commands.get(&name) {
            None => Err(CommandError::UnknownCommand(name)),
            Some(None) => Err(CommandError::NotNative(name)),
            Some(Some(handler)) => Ok(handler(argv)),
        }
    }
}

/// Per-process scratch storage. Never persisted; its contents vanish on
/// restart, which makes it safe for caches that must not outlive the
/// process.
#[derive(Debug, Default, Clone)]
pub struct Scratch {
    values: Map<String, Value>,
}

impl Scratch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Mutable access to the value under `key`, inserting an empty object
    /// when absent.
    pub fn value_mut(&mut self, key: impl Into<String>) -> &mut Value {
        self.values
            .entry(key.into())
            .or_insert_with(|| Value::Object(Map::new()))
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
