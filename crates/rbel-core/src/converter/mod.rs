//! Converter pipeline.
//!
//! Converters recognise structure in an element and attach facets and child
//! elements. Children are converted recursively, which is how
//! HTTP → base64 → gzip → JSON → JWT chains come about.
//!
//! ## Ordering
//!
//! Converters declare the converters they depend on. The registry is filtered
//! by activation and topologically sorted once, when the [`RbelConverter`] is
//! built. Each element is then offered to the sorted converters in repeated
//! passes until a pass adds nothing.
//!
//! ## Cross-message ordering
//!
//! Every message gets a sequence number. A converter that reads state written
//! while converting earlier messages (keys, sessions) sets
//! [`Converter::requires_predecessors`]; before it runs, the pipeline blocks
//! until all messages with a lower sequence number are finished.
//!
//! ## Failures
//!
//! A converter error or panic is recorded as an error note on the element it
//! was working on. Sibling and ancestor conversion carries on.

mod base64;
mod compression;
mod form;
pub mod http;
mod json;
mod jwe;
mod jwt;
mod uri;
pub mod vau;

pub use self::base64::Base64Converter;
pub use self::compression::CompressionConverter;
pub use self::form::FormConverter;
pub use self::http::HttpConverter;
pub use self::json::JsonConverter;
pub use self::jwe::JweConverter;
pub use self::jwt::JwtConverter;
pub use self::uri::UriConverter;
pub use self::vau::{VauDecryptionConverter, VauHandshakeConverter, VauTracingKeyConverter};

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::config::RbelConfig;
use crate::element::{Facet, MessageMetadata, NodeId, NoteSeverity, RbelMessage};
use crate::error::{ConversionError, CoreError, Result};
use crate::keys::RbelKeyManager;
use crate::session::{BoundedMap, SessionRegistry};

/// Upper bound on passes over the converter list for one element.
const MAX_PASSES: usize = 4;

/// Number of finished messages kept for lookups by uuid.
const RECENT_MESSAGE_CAPACITY: usize = 1024;

/// Hook run on a message before conversion starts.
pub type PreConversionHook = Arc<dyn Fn(&mut RbelMessage) + Send + Sync>;

/// When a converter takes part in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Always active.
    Always,
    /// Active only when the named family is listed in `activate_converters`.
    Feature(&'static str),
}

/// A pluggable unit of the pipeline.
pub trait Converter: Send + Sync {
    /// Unique converter name, referenced by `depends_on`.
    fn name(&self) -> &'static str;

    /// Converters that must run before this one.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    /// Activation predicate.
    fn activation(&self) -> Activation {
        Activation::Always
    }

    /// Whether earlier messages must be finished before this converter runs.
    fn requires_predecessors(&self) -> bool {
        false
    }

    /// Examines an element. Returns true if structure was added.
    ///
    /// Must be idempotent: a second call on the same element adds nothing.
    fn consider(
        &self,
        ctx: &mut ConversionContext<'_>,
        node: NodeId,
    ) -> std::result::Result<bool, ConversionError>;
}

/// Static registration table of converters.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: Vec<Arc<dyn Converter>>,
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("converters", &self.names())
            .finish()
    }
}

impl ConverterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with all built-in converters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpConverter));
        registry.register(Arc::new(UriConverter));
        registry.register(Arc::new(CompressionConverter));
        registry.register(Arc::new(FormConverter));
        registry.register(Arc::new(JsonConverter));
        registry.register(Arc::new(Base64Converter));
        registry.register(Arc::new(JwtConverter));
        registry.register(Arc::new(JweConverter));
        registry.register(Arc::new(VauTracingKeyConverter));
        registry.register(Arc::new(VauHandshakeConverter));
        registry.register(Arc::new(VauDecryptionConverter));
        registry
    }

    /// Registers a converter.
    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        self.converters.push(converter);
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    /// Active converters for a configuration, in dependency order.
    ///
    /// Ties are broken by registration order. Dependencies on converters
    /// that are unknown or inactive are ignored.
    pub fn sorted_for(&self, config: &RbelConfig) -> Result<Vec<Arc<dyn Converter>>> {
        let active: Vec<Arc<dyn Converter>> = self
            .converters
            .iter()
            .filter(|c| match c.activation() {
                Activation::Always => true,
                Activation::Feature(feature) => config.is_converter_active(feature),
            })
            .cloned()
            .collect();

        let index_of = |name: &str| active.iter().position(|c| c.name() == name);
        let mut pending: Vec<Vec<usize>> = active
            .iter()
            .map(|c| {
                c.depends_on()
                    .iter()
                    .filter_map(|dep| {
                        let idx = index_of(dep);
                        if idx.is_none() {
                            tracing::debug!(
                                "Converter '{}' depends on inactive converter '{}'",
                                c.name(),
                                dep
                            );
                        }
                        idx
                    })
                    .collect()
            })
            .collect();

        let mut emitted = vec![false; active.len()];
        let mut sorted = Vec::with_capacity(active.len());
        while sorted.len() < active.len() {
            let next = (0..active.len()).find(|&i| !emitted[i] && pending[i].is_empty());
            let Some(next) = next else {
                let stuck: Vec<&str> = (0..active.len())
                    .filter(|&i| !emitted[i])
                    .map(|i| active[i].name())
                    .collect();
                return Err(CoreError::ConverterCycle(stuck.join(", ")));
            };
            emitted[next] = true;
            sorted.push(active[next].clone());
            for deps in pending.iter_mut() {
                deps.retain(|&d| d != next);
            }
        }
        Ok(sorted)
    }
}

#[derive(Debug, Default)]
struct SequenceState {
    /// Every sequence number below this one is finished.
    finished_below: u64,
    finished_ahead: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct Sequencer {
    next: AtomicU64,
    state: Mutex<SequenceState>,
    changed: Condvar,
}

impl Sequencer {
    fn finish(&self, sequence: u64) {
        let mut state = self.state.lock();
        state.finished_ahead.insert(sequence);
        loop {
            let below = state.finished_below;
            if !state.finished_ahead.remove(&below) {
                break;
            }
            state.finished_below += 1;
        }
        self.changed.notify_all();
    }

    fn wait_for_predecessors(&self, sequence: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.finished_below < sequence {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.finished_below >= sequence;
            }
        }
        true
    }
}

/// A reserved position in the conversion order.
///
/// Dropping the ticket marks the position finished, also when the message
/// was never converted, so later messages cannot wait forever.
#[derive(Debug)]
pub struct SequenceTicket {
    sequence: u64,
    sequencer: Arc<Sequencer>,
}

impl SequenceTicket {
    /// The reserved sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for SequenceTicket {
    fn drop(&mut self) {
        self.sequencer.finish(self.sequence);
    }
}

/// The pipeline executor.
pub struct RbelConverter {
    converters: Vec<Arc<dyn Converter>>,
    keys: Arc<RbelKeyManager>,
    sessions: Arc<SessionRegistry>,
    config: RbelConfig,
    sequencer: Arc<Sequencer>,
    recent: Mutex<BoundedMap<Uuid, Arc<RbelMessage>>>,
}

impl std::fmt::Debug for RbelConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbelConverter")
            .field("converters", &self.converter_names())
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl RbelConverter {
    /// Creates a pipeline with the built-in converters and configured keys.
    pub fn new(config: RbelConfig) -> Result<Self> {
        let keys = Arc::new(RbelKeyManager::from_config(&config)?);
        Self::with_registry(config, &ConverterRegistry::with_defaults(), keys)
    }

    /// Creates a pipeline from an explicit registry and key manager.
    pub fn with_registry(
        config: RbelConfig,
        registry: &ConverterRegistry,
        keys: Arc<RbelKeyManager>,
    ) -> Result<Self> {
        config.validate()?;
        let converters = registry.sorted_for(&config)?;
        tracing::info!(
            "Converter pipeline: {}",
            converters
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(Self {
            converters,
            keys,
            sessions: Arc::new(SessionRegistry::new(config.session_cache_capacity)),
            config,
            sequencer: Arc::new(Sequencer::default()),
            recent: Mutex::new(BoundedMap::new(RECENT_MESSAGE_CAPACITY)),
        })
    }

    /// Names of the active converters in execution order.
    pub fn converter_names(&self) -> Vec<&'static str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    /// The shared key manager.
    pub fn key_manager(&self) -> &Arc<RbelKeyManager> {
        &self.keys
    }

    /// The shared session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The configuration in use.
    pub fn config(&self) -> &RbelConfig {
        &self.config
    }

    /// Reserves the next position in the conversion order.
    ///
    /// Callers that convert messages concurrently reserve in arrival order,
    /// then convert in any order.
    pub fn reserve_sequence(&self) -> SequenceTicket {
        SequenceTicket {
            sequence: self.sequencer.next.fetch_add(1, Ordering::SeqCst),
            sequencer: self.sequencer.clone(),
        }
    }

    /// Converts a message, reserving a sequence number for it.
    pub fn parse_message(
        &self,
        content: impl Into<Bytes>,
        metadata: MessageMetadata,
    ) -> Arc<RbelMessage> {
        let ticket = self.reserve_sequence();
        self.parse_message_with(ticket, content, metadata, &[])
    }

    /// Converts a message at a previously reserved position.
    pub fn parse_message_with(
        &self,
        ticket: SequenceTicket,
        content: impl Into<Bytes>,
        mut metadata: MessageMetadata,
        hooks: &[PreConversionHook],
    ) -> Arc<RbelMessage> {
        metadata.sequence_number = ticket.sequence();
        let mut message = RbelMessage::new(content, metadata);
        for hook in hooks {
            hook(&mut message);
        }

        if message.size() > self.config.max_message_size {
            tracing::debug!(
                "Message {} exceeds {} bytes, skipping conversion",
                message.uuid(),
                self.config.max_message_size
            );
            message.add_note(
                NodeId::ROOT,
                NoteSeverity::Warn,
                format!(
                    "message of {} bytes exceeds conversion limit",
                    message.size()
                ),
            );
        } else {
            let mut ctx = ConversionContext {
                message: &mut message,
                pipeline: self,
                sequence: ticket.sequence(),
                predecessors_done: false,
            };
            self.run(&mut ctx, NodeId::ROOT);
        }

        let message = Arc::new(message);
        self.recent.lock().insert(message.uuid(), message.clone());
        drop(ticket);
        message
    }

    /// Looks up a recently converted message.
    pub fn find_message(&self, uuid: &Uuid) -> Option<Arc<RbelMessage>> {
        self.recent.lock().get(uuid).cloned()
    }

    fn run(&self, ctx: &mut ConversionContext<'_>, node: NodeId) {
        let mut failed: Vec<&'static str> = Vec::new();
        for _ in 0..MAX_PASSES {
            let mut changed = false;
            for converter in &self.converters {
                if failed.contains(&converter.name()) {
                    continue;
                }
                if converter.requires_predecessors() {
                    ctx.wait_for_predecessors();
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| converter.consider(ctx, node)));
                let error = match outcome {
                    Ok(Ok(added)) => {
                        changed |= added;
                        continue;
                    }
                    Ok(Err(e)) => e,
                    Err(panic) => ConversionError::new(panic_message(panic.as_ref())),
                };
                let error = error.bind(converter.name(), &ctx.message.path_of(node));
                tracing::warn!("{}", error);
                ctx.message
                    .add_note(node, NoteSeverity::Error, error.to_string());
                failed.push(converter.name());
            }
            if !changed {
                break;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// State handed to converters while a message is being converted.
pub struct ConversionContext<'a> {
    message: &'a mut RbelMessage,
    pipeline: &'a RbelConverter,
    sequence: u64,
    predecessors_done: bool,
}

impl<'a> ConversionContext<'a> {
    /// The message under conversion.
    pub fn message(&self) -> &RbelMessage {
        self.message
    }

    /// Shared key manager.
    pub fn keys(&self) -> &RbelKeyManager {
        &self.pipeline.keys
    }

    /// Shared session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.pipeline.sessions
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &RbelConfig {
        &self.pipeline.config
    }

    /// Content of an element (cheap clone).
    pub fn content(&self, node: NodeId) -> Bytes {
        self.message.element(node).content().clone()
    }

    /// Attaches a facet.
    pub fn add_facet(&mut self, node: NodeId, facet: Facet) {
        self.message.add_facet(node, facet);
    }

    /// Attaches a note.
    pub fn add_note(&mut self, node: NodeId, severity: NoteSeverity, text: impl Into<String>) {
        self.message.add_note(node, severity, text);
    }

    /// Mutable facets of an element, for converters that complete a facet later.
    pub fn facets_mut(&mut self, node: NodeId) -> &mut Vec<Facet> {
        self.message.facets_mut(node)
    }

    /// Adds a child without converting it.
    pub fn add_child(&mut self, parent: NodeId, key: &str, content: Bytes) -> NodeId {
        self.message.push_child(parent, key, content)
    }

    /// Adds a child and runs the pipeline on it.
    pub fn convert_child(&mut self, parent: NodeId, key: &str, content: Bytes) -> NodeId {
        let child = self.message.push_child(parent, key, content);
        self.convert(child);
        child
    }

    /// Runs the pipeline on an element added with [`Self::add_child`].
    ///
    /// Beyond the configured depth the element is left unconverted with a note.
    pub fn convert(&mut self, node: NodeId) {
        if self.message.element(node).depth() > self.pipeline.config.max_conversion_depth {
            self.message
                .add_note(node, NoteSeverity::Warn, "maximum conversion depth reached");
            return;
        }
        let pipeline = self.pipeline;
        pipeline.run(self, node);
    }

    /// Blocks until all earlier messages are finished. Returns false on timeout.
    pub fn wait_for_predecessors(&mut self) -> bool {
        if self.predecessors_done {
            return true;
        }
        let done = self
            .pipeline
            .sequencer
            .wait_for_predecessors(self.sequence, self.pipeline.config.predecessor_timeout());
        if done {
            self.predecessors_done = true;
        } else {
            tracing::warn!(
                "Timed out waiting for predecessors of message #{}",
                self.sequence
            );
        }
        done
    }

    /// The request this message answers, once it has been converted.
    pub fn paired_request(&mut self) -> Option<Arc<RbelMessage>> {
        let uuid = self.message.metadata().paired_request?;
        self.wait_for_predecessors();
        self.pipeline.find_message(&uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        deps: &'static [&'static str],
        activation: Activation,
    }

    impl Converter for Named {
        fn name(&self) -> &'static str {
            self.name
        }

        fn depends_on(&self) -> &'static [&'static str] {
            self.deps
        }

        fn activation(&self) -> Activation {
            self.activation
        }

        fn consider(
            &self,
            _ctx: &mut ConversionContext<'_>,
            _node: NodeId,
        ) -> std::result::Result<bool, ConversionError> {
            Ok(false)
        }
    }

    fn named(name: &'static str, deps: &'static [&'static str]) -> Arc<dyn Converter> {
        Arc::new(Named {
            name,
            deps,
            activation: Activation::Always,
        })
    }

    #[test]
    fn sort_respects_dependencies_and_registration_order() {
        let mut registry = ConverterRegistry::new();
        registry.register(named("c", &["b"]));
        registry.register(named("a", &[]));
        registry.register(named("b", &["a"]));
        registry.register(named("d", &[]));

        let sorted = registry.sorted_for(&RbelConfig::default()).unwrap();
        let names: Vec<_> = sorted.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn sort_detects_cycles() {
        let mut registry = ConverterRegistry::new();
        registry.register(named("x", &["y"]));
        registry.register(named("y", &["x"]));
        registry.register(named("z", &[]));

        match registry.sorted_for(&RbelConfig::default()) {
            Err(CoreError::ConverterCycle(names)) => {
                assert!(names.contains('x'));
                assert!(!names.contains('z'));
            }
            other => panic!("expected cycle, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn inactive_converters_are_filtered() {
        let mut registry = ConverterRegistry::new();
        registry.register(Arc::new(Named {
            name: "optional",
            deps: &[],
            activation: Activation::Feature("extra"),
        }));
        registry.register(named("needs-optional", &["optional"]));

        let sorted = registry.sorted_for(&RbelConfig::default()).unwrap();
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].name(), "needs-optional");

        let config = RbelConfig::default().with_converter("extra");
        let sorted = registry.sorted_for(&config).unwrap();
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].name(), "optional");
    }

    #[test]
    fn default_pipeline_order() {
        let config = RbelConfig::default().with_converter("vau");
        let converter = RbelConverter::new(config).unwrap();
        let names = converter.converter_names();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("http") < pos("uri"));
        assert!(pos("json") < pos("base64"));
        assert!(pos("vau-tracing-keys") < pos("vau-decrypt"));
        assert!(pos("vau-handshake") < pos("vau-decrypt"));
    }

    #[test]
    fn vau_inactive_by_default() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        assert!(!converter.converter_names().contains(&"vau-decrypt"));
    }

    struct Failing;

    impl Converter for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn consider(
            &self,
            _ctx: &mut ConversionContext<'_>,
            _node: NodeId,
        ) -> std::result::Result<bool, ConversionError> {
            Err(ConversionError::new("boom"))
        }
    }

    struct Panicking;

    impl Converter for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn consider(
            &self,
            _ctx: &mut ConversionContext<'_>,
            _node: NodeId,
        ) -> std::result::Result<bool, ConversionError> {
            panic!("unexpected input")
        }
    }

    #[test]
    fn failures_become_notes_and_conversion_continues() {
        let mut registry = ConverterRegistry::with_defaults();
        registry.register(Arc::new(Failing));
        registry.register(Arc::new(Panicking));
        let converter = RbelConverter::with_registry(
            RbelConfig::default(),
            &registry,
            Arc::new(RbelKeyManager::new()),
        )
        .unwrap();

        let msg = converter.parse_message(&br#"{"a":"b"}"#[..], MessageMetadata::new());
        let root_notes = msg.root().notes();
        assert_eq!(root_notes.len(), 2);
        assert!(root_notes[0].contains("failing"));
        assert!(root_notes[0].contains("boom"));
        assert!(root_notes[1].contains("panicked: unexpected input"));

        // JSON still parsed, and the child got its own notes.
        let a = msg.find_first("$.a").unwrap();
        assert_eq!(a.content().as_ref(), b"b");
        assert_eq!(a.notes().len(), 2);
    }

    #[test]
    fn sequence_numbers_are_assigned_in_order() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let first = converter.parse_message(&b"one"[..], MessageMetadata::new());
        let second = converter.parse_message(&b"two"[..], MessageMetadata::new());
        assert_eq!(first.metadata().sequence_number, 0);
        assert_eq!(second.metadata().sequence_number, 1);
        assert!(converter.find_message(&first.uuid()).is_some());
    }

    #[test]
    fn predecessors_wait_for_out_of_order_completion() {
        let sequencer = Arc::new(Sequencer::default());
        let first = SequenceTicket {
            sequence: sequencer.next.fetch_add(1, Ordering::SeqCst),
            sequencer: sequencer.clone(),
        };
        let second_seq = sequencer.next.fetch_add(1, Ordering::SeqCst);

        assert!(!sequencer.wait_for_predecessors(second_seq, Duration::from_millis(10)));

        let waiter = {
            let sequencer = sequencer.clone();
            std::thread::spawn(move || {
                sequencer.wait_for_predecessors(second_seq, Duration::from_secs(5))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(first);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn oversized_messages_are_not_converted() {
        let mut config = RbelConfig::default();
        config.max_message_size = 4;
        let converter = RbelConverter::new(config).unwrap();
        let msg = converter.parse_message(&br#"{"a":1}"#[..], MessageMetadata::new());
        assert!(msg.children(NodeId::ROOT).is_empty());
        assert_eq!(msg.root().notes().len(), 1);
    }

    #[test]
    fn hooks_run_before_conversion() {
        let converter = RbelConverter::new(RbelConfig::default()).unwrap();
        let hook: PreConversionHook = Arc::new(|msg: &mut RbelMessage| {
            msg.metadata_mut()
                .extra
                .insert("hooked".to_string(), "yes".to_string());
        });
        let ticket = converter.reserve_sequence();
        let msg = converter.parse_message_with(ticket, &b"x"[..], MessageMetadata::new(), &[hook]);
        assert_eq!(msg.metadata().extra.get("hooked").map(String::as_str), Some("yes"));
    }
}
