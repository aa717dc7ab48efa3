//! Bounded in-memory copy of recent log lines, served by `/api/logs`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Keeps the newest `capacity` lines; older ones are dropped first.
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Snapshot, oldest first.
    pub fn read(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        self.fields.push(' ');
        self.fields.push_str(name);
        self.fields.push('=');
        self.fields.push_str(&value.to_string());
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogRing {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        self.append(format!(
            "[{}] {} - {}{}",
            event.metadata().level(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            visitor.message,
            visitor.fields
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn oldest_lines_are_evicted_at_capacity() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.append(format!("line {i}"));
        }
        assert_eq!(ring.read(), vec!["line 2", "line 3", "line 4"]);
        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn events_are_captured_with_level_and_fields() {
        let ring = LogRing::new(10);
        let subscriber = tracing_subscriber::registry().with(ring.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(store = "acme", items = 3, "inventory fetched");
        });
        let lines = ring.read();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[WARN] "));
        assert!(lines[0].ends_with("inventory fetched store=acme items=3"));
    }
}
