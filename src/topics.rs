//! Topic subscriptions and pattern dispatch.
//!
//! Server-originated notifications carry a dotted/colon-separated topic
//! string. Subscriptions register a pattern over those tokens:
//!
//! - a literal token matches itself,
//! - `*` matches exactly one token,
//! - a trailing `**` matches one or more remaining tokens.
//!
//! Dispatch order is priority (higher first), then registration order.
//! Non-persistent subscriptions are dropped when the connection is torn
//! down by an explicit disconnect.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;

// ============================================================================
// TopicPattern
// ============================================================================

/// A compiled topic pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal(String),
    Single,
    Tail,
}

impl TopicPattern {
    /// Compiles a pattern string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] for empty patterns, empty tokens,
    /// or a `**` anywhere but the final position.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::invalid_pattern(pattern, "pattern is empty"));
        }

        let parts: Vec<&str> = split_tokens(pattern);
        let mut tokens = Vec::with_capacity(parts.len());

        for (index, part) in parts.iter().enumerate() {
            match *part {
                "" => return Err(Error::invalid_pattern(pattern, "empty token")),
                "*" => tokens.push(PatternToken::Single),
                "**" => {
                    if index != parts.len() - 1 {
                        return Err(Error::invalid_pattern(
                            pattern,
                            "'**' is only valid as the final token",
                        ));
                    }
                    tokens.push(PatternToken::Tail);
                }
                literal => tokens.push(PatternToken::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// Returns `true` if the topic matches this pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let topic_tokens = split_tokens(topic);
        let mut i = 0;

        for token in &self.tokens {
            match token {
                PatternToken::Tail => {
                    // Tail must swallow at least one remaining token.
                    return i < topic_tokens.len();
                }
                PatternToken::Single => {
                    if i >= topic_tokens.len() || topic_tokens[i].is_empty() {
                        return false;
                    }
                    i += 1;
                }
                PatternToken::Literal(literal) => {
                    if i >= topic_tokens.len() || topic_tokens[i] != literal {
                        return false;
                    }
                    i += 1;
                }
            }
        }

        i == topic_tokens.len()
    }

    /// The original pattern string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_tokens(s: &str) -> Vec<&str> {
    s.split(['.', ':']).collect()
}

// ============================================================================
// SubscribeOptions
// ============================================================================

/// Data filter run before a subscription handler. Returning `false` skips
/// the handler for that notification.
pub type TopicFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Options for [`TopicRouter::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Higher priorities are dispatched first.
    pub priority: i32,

    /// Persistent subscriptions survive an explicit disconnect.
    pub persistent: bool,

    /// Optional data filter.
    pub filter: Option<TopicFilter>,
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("priority", &self.priority)
            .field("persistent", &self.persistent)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// TopicEvent
// ============================================================================

/// What a subscription handler receives.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    /// The concrete topic that matched.
    pub topic: String,

    /// Notification data.
    pub data: Value,

    /// Frame timestamp, milliseconds since epoch.
    pub timestamp: u64,
}

// ============================================================================
// TopicRouter
// ============================================================================

type TopicHandler = Arc<dyn Fn(TopicEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    priority: i32,
    persistent: bool,
    filter: Option<TopicFilter>,
    handler: TopicHandler,
}

struct RouterInner {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

/// Routes inbound topic notifications to matching subscriptions.
pub struct TopicRouter {
    inner: Arc<Mutex<RouterInner>>,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RouterInner {
                subscriptions: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Registers a subscription and returns its disposer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the pattern does not compile.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: impl Fn(TopicEvent) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        let pattern = TopicPattern::compile(pattern)?;
        let mut inner = self.inner.lock();
        let id = SubscriptionId::new(inner.next_id);
        inner.next_id += 1;
        inner.subscriptions.push(Subscription {
            id,
            pattern,
            priority: options.priority,
            persistent: options.persistent,
            filter: options.filter,
            handler: Arc::new(handler),
        });

        Ok(SubscriptionHandle {
            id,
            router: Arc::downgrade(&self.inner),
        })
    }

    /// Dispatches a notification to every matching subscription.
    ///
    /// Matching handlers run on the calling task in priority-then-insertion
    /// order, outside the router lock.
    pub fn dispatch(&self, topic: &str, data: Value, timestamp: u64) {
        let mut matched: Vec<(i32, TopicHandler, Option<TopicFilter>)> = {
            let inner = self.inner.lock();
            inner
                .subscriptions
                .iter()
                .filter(|sub| sub.pattern.matches(topic))
                .map(|sub| {
                    (
                        sub.priority,
                        Arc::clone(&sub.handler),
                        sub.filter.clone(),
                    )
                })
                .collect()
        };

        if matched.is_empty() {
            trace!(topic, "notification matched no subscriptions");
            return;
        }

        // Stable sort keeps insertion order within one priority.
        matched.sort_by_key(|(priority, _, _)| std::cmp::Reverse(*priority));

        for (_, handler, filter) in matched {
            if let Some(filter) = &filter
                && !filter(&data)
            {
                continue;
            }
            handler(TopicEvent {
                topic: topic.to_string(),
                data: data.clone(),
                timestamp,
            });
        }
    }

    /// Drops all non-persistent subscriptions.
    pub fn clear_transient(&self) {
        let mut inner = self.inner.lock();
        inner.subscriptions.retain(|sub| sub.persistent);
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Returns `true` if no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// SubscriptionHandle
// ============================================================================

/// Disposer for a topic subscription.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    router: Weak<Mutex<RouterInner>>,
}

impl SubscriptionHandle {
    /// The subscription's ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes the subscription. Returns `false` if it was already gone.
    pub fn dispose(&self) -> bool {
        match self.router.upgrade() {
            Some(inner) => {
                let mut inner = inner.lock();
                let before = inner.subscriptions.len();
                inner.subscriptions.retain(|sub| sub.id != self.id);
                inner.subscriptions.len() != before
            }
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_match() {
        let p = TopicPattern::compile("chat.message").expect("compile");
        assert!(p.matches("chat.message"));
        assert!(!p.matches("chat.other"));
        assert!(!p.matches("chat.message.edited"));
        assert!(!p.matches("chat"));
    }

    #[test]
    fn test_colon_and_dot_separators_mix() {
        let p = TopicPattern::compile("game:round.start").expect("compile");
        assert!(p.matches("game:round.start"));
        assert!(p.matches("game.round:start"));
    }

    #[test]
    fn test_single_wildcard() {
        let p = TopicPattern::compile("chat.*.joined").expect("compile");
        assert!(p.matches("chat.lobby.joined"));
        assert!(!p.matches("chat.joined"));
        assert!(!p.matches("chat.a.b.joined"));
    }

    #[test]
    fn test_tail_wildcard() {
        let p = TopicPattern::compile("metrics.**").expect("compile");
        assert!(p.matches("metrics.cpu"));
        assert!(p.matches("metrics.cpu.core0.idle"));
        assert!(!p.matches("metrics"));
        assert!(!p.matches("other.cpu"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::compile("").is_err());
        assert!(TopicPattern::compile("a..b").is_err());
        assert!(TopicPattern::compile("a.**.b").is_err());
    }

    #[test]
    fn test_dispatch_priority_then_insertion() {
        let router = TopicRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [("low-1", 0), ("high", 5), ("low-2", 0)] {
            let o = Arc::clone(&order);
            router
                .subscribe(
                    "news.*",
                    move |_| o.lock().push(label),
                    SubscribeOptions {
                        priority,
                        ..Default::default()
                    },
                )
                .expect("subscribe");
        }

        router.dispatch("news.local", json!({}), 1);
        assert_eq!(*order.lock(), vec!["high", "low-1", "low-2"]);
    }

    #[test]
    fn test_filter_skips_handler() {
        let router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(0u32));

        let h = Arc::clone(&hits);
        router
            .subscribe(
                "sensor.**",
                move |_| *h.lock() += 1,
                SubscribeOptions {
                    filter: Some(Arc::new(|data| {
                        data.get("level").and_then(Value::as_i64).unwrap_or(0) > 3
                    })),
                    ..Default::default()
                },
            )
            .expect("subscribe");

        router.dispatch("sensor.temp", json!({"level": 1}), 1);
        router.dispatch("sensor.temp", json!({"level": 7}), 2);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_dispose() {
        let router = TopicRouter::new();
        let hits = Arc::new(Mutex::new(0u32));
        let h = Arc::clone(&hits);

        let handle = router
            .subscribe("a.b", move |_| *h.lock() += 1, SubscribeOptions::default())
            .expect("subscribe");

        router.dispatch("a.b", json!({}), 1);
        assert!(handle.dispose());
        router.dispatch("a.b", json!({}), 2);

        assert_eq!(*hits.lock(), 1);
        assert!(!handle.dispose());
    }

    #[test]
    fn test_clear_transient_keeps_persistent() {
        let router = TopicRouter::new();
        router
            .subscribe("a.b", |_| {}, SubscribeOptions::default())
            .expect("subscribe");
        router
            .subscribe(
                "c.d",
                |_| {},
                SubscribeOptions {
                    persistent: true,
                    ..Default::default()
                },
            )
            .expect("subscribe");

        router.clear_transient();
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_handler_receives_topic_and_timestamp() {
        let router = TopicRouter::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);

        router
            .subscribe(
                "tick.*",
                move |event| *s.lock() = Some((event.topic, event.timestamp)),
                SubscribeOptions::default(),
            )
            .expect("subscribe");

        router.dispatch("tick.minute", json!(null), 42);
        assert_eq!(*seen.lock(), Some(("tick.minute".to_string(), 42)));
    }
}
