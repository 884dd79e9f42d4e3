//! Log pipeline setup and the maintenance noise filter
//!
//! The maintenance task logs [`STORAGE_CLEAN_SKIPPED`] at info on every tick
//! that does not clean storage. The first occurrence after startup is pure
//! noise (storage was just cleaned by the previous process), so it is
//! dropped; every later one is written.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use keygate_config::{LogFormat, LogLevel, LoggingConfig};
use tracing::field::{Field, Visit};
use tracing::{Event, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Filter, Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Message logged when storage cleaning is skipped
pub const STORAGE_CLEAN_SKIPPED: &str = "storage cleaning happened too recently; skipping for now";

// State constants for AtomicU8
const STATE_FILTERING: u8 = 0;
const STATE_PASSTHROUGH: u8 = 1;

/// Observable state of a [`NoiseFilter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// The skip message has not been seen yet; its first occurrence will be dropped
    Filtering,
    /// Terminal: everything passes
    Passthrough,
}

// ============================================================================
// Noise filter
// ============================================================================

/// Drops the first maintenance "skipping" line and nothing else
///
/// Clones share state, so a filter attached to several layers, or events
/// recorded inside spans with extra fields, still drop at most one line for
/// the whole process.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    state: Arc<AtomicU8>,
}

impl NoiseFilter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(STATE_FILTERING)),
        }
    }

    /// Filter for a configured level, or `None` at debug and trace where
    /// every line is wanted
    pub fn for_level(level: LogLevel) -> Option<Self> {
        match level {
            LogLevel::Info | LogLevel::Warn | LogLevel::Error => Some(Self::new()),
            LogLevel::Debug | LogLevel::Trace => None,
        }
    }

    pub fn state(&self) -> FilterState {
        match self.state.load(Ordering::Acquire) {
            STATE_FILTERING => FilterState::Filtering,
            _ => FilterState::Passthrough,
        }
    }

    /// Whether a line with this message should be written
    pub fn admit(&self, message: &str) -> bool {
        if self.state.load(Ordering::Acquire) == STATE_PASSTHROUGH {
            return true;
        }
        if message != STORAGE_CLEAN_SKIPPED {
            return true;
        }

        // Exactly one caller wins the transition and has its line dropped
        self.state
            .compare_exchange(
                STATE_FILTERING,
                STATE_PASSTHROUGH,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Filter<S> for NoiseFilter {
    fn enabled(&self, _meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        true
    }

    fn event_enabled(&self, event: &Event<'_>, _cx: &Context<'_, S>) -> bool {
        if self.state.load(Ordering::Acquire) == STATE_PASSTHROUGH {
            return true;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.map_or(true, |message| self.admit(&message))
    }
}

/// Pulls the `message` field out of an event
#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Attach the noise filter to `layer` when `level` calls for it
pub fn with_noise_filter<S, L>(layer: L, level: LogLevel) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    L: Layer<S> + Send + Sync + 'static,
{
    match NoiseFilter::for_level(level) {
        Some(filter) => layer.with_filter(filter).boxed(),
        None => layer.boxed(),
    }
}

type BaseSubscriber = Layered<EnvFilter, Registry>;

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level; the noise filter decision
/// follows the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let fmt_layer: Box<dyn Layer<BaseSubscriber> + Send + Sync> = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(false).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(with_noise_filter(fmt_layer, config.level))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing::{info, info_span, warn};

    /// Layer that records every message it is given
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<String>>>);

    impl Capture {
        fn messages(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &Event<'_>, _cx: tracing_subscriber::layer::Context<'_, S>) {
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            self.0.lock().push(visitor.message.unwrap_or_default());
        }
    }

    fn emit_sequence() {
        info!("A");
        info!("{}", STORAGE_CLEAN_SKIPPED);
        info!("B");
        info!("{}", STORAGE_CLEAN_SKIPPED);
        info!("C");
    }

    fn captured_at(level: LogLevel, emit: impl FnOnce()) -> Vec<String> {
        let capture = Capture::default();
        let subscriber =
            tracing_subscriber::registry().with(with_noise_filter(capture.clone(), level));
        tracing::subscriber::with_default(subscriber, emit);
        capture.messages()
    }

    #[test]
    fn test_info_drops_first_skip_message_only() {
        let messages = captured_at(LogLevel::Info, emit_sequence);

        assert_eq!(messages, vec!["A", "B", STORAGE_CLEAN_SKIPPED, "C"]);
    }

    #[test]
    fn test_debug_passes_everything() {
        let messages = captured_at(LogLevel::Debug, emit_sequence);

        assert_eq!(
            messages,
            vec!["A", STORAGE_CLEAN_SKIPPED, "B", STORAGE_CLEAN_SKIPPED, "C"]
        );
    }

    #[test]
    fn test_span_fields_share_state() {
        let messages = captured_at(LogLevel::Warn, || {
            let span = info_span!("maintenance", domain = "a.test");
            let _enter = span.enter();
            info!("{}", STORAGE_CLEAN_SKIPPED);
            warn!(attempt = 2, "{}", STORAGE_CLEAN_SKIPPED);
        });

        assert_eq!(messages, vec![STORAGE_CLEAN_SKIPPED]);
    }

    #[test]
    fn test_similar_messages_pass() {
        let messages = captured_at(LogLevel::Info, || {
            info!("{} ", STORAGE_CLEAN_SKIPPED);
            info!("Storage cleaning happened too recently; skipping for now");
        });

        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_installed_only_above_debug() {
        assert!(NoiseFilter::for_level(LogLevel::Info).is_some());
        assert!(NoiseFilter::for_level(LogLevel::Warn).is_some());
        assert!(NoiseFilter::for_level(LogLevel::Error).is_some());
        assert!(NoiseFilter::for_level(LogLevel::Debug).is_none());
        assert!(NoiseFilter::for_level(LogLevel::Trace).is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let filter = NoiseFilter::new();
        let derived = filter.clone();

        assert!(!derived.admit(STORAGE_CLEAN_SKIPPED));
        assert_eq!(filter.state(), FilterState::Passthrough);
        assert!(filter.admit(STORAGE_CLEAN_SKIPPED));
    }

    #[test]
    fn test_single_transition_under_contention() {
        let filter = NoiseFilter::new();

        let dropped: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let filter = filter.clone();
                    scope.spawn(move || {
                        (0..100)
                            .filter(|_| !filter.admit(STORAGE_CLEAN_SKIPPED))
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(dropped, 1);
    }
}
