use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const RING_CAPACITY: usize = 500;

pub(crate) type LogRing = Arc<std::sync::Mutex<VecDeque<String>>>;

/// Mirrors every event as a JSON line to the dashboard: live over a
/// broadcast channel, recent history in a bounded ring.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: LogRing,
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            use std::fmt::Write;
            let _ = write!(self.message, "{value:?}");
            // Strip surrounding quotes added by Debug on &str
            if self.message.starts_with('"') && self.message.ends_with('"') && self.message.len() > 1 {
                *self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }
}

/// Dashboard category for an event target (module path).
pub(crate) fn category(target: &str) -> &'static str {
    if target.contains("orchestrator") || target.contains("::git") || target.contains("::patch") {
        "orchestrator"
    } else if target.contains("scheduler") || target.contains("resolver") {
        "scheduler"
    } else if target.starts_with("solver_sentry") || target.contains("tracker") {
        "tracker"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        event.record(&mut MessageVisitor {
            message: &mut message,
        });

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": message,
            "category": category(event.metadata().target()),
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.push_back(json);
        if ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
    }
}

/// Default directives when `RUST_LOG` is unset.
fn default_filter(level: &str) -> String {
    let level = match level.trim() {
        "" => "info",
        l => l,
    };
    format!("sentry_solver={level},solver_core={level},solver_sentry={level},tower_http=info")
}

/// Install fmt output plus the broadcast layer. Returns the handles the
/// dashboard reads from.
pub(crate) fn init(level: &str) -> (broadcast::Sender<String>, LogRing) {
    let (tx, _) = broadcast::channel(1024);
    let ring: LogRing = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(RING_CAPACITY)));

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: tx.clone(),
            ring: Arc::clone(&ring),
        })
        .init();
    (tx, ring)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_module_paths() {
        assert_eq!(category("solver_core::orchestrator"), "orchestrator");
        assert_eq!(category("solver_core::git"), "orchestrator");
        assert_eq!(category("solver_core::scheduler"), "scheduler");
        assert_eq!(category("solver_core::resolver"), "scheduler");
        assert_eq!(category("solver_sentry"), "tracker");
        assert_eq!(category("solver_sentry::parse"), "tracker");
        assert_eq!(category("sentry_solver::routes"), "system");
    }

    #[test]
    fn events_land_in_ring_and_channel() {
        let (tx, mut rx) = broadcast::channel(16);
        let ring: LogRing = Arc::new(std::sync::Mutex::new(VecDeque::new()));
        let subscriber = tracing_subscriber::registry().with(BroadcastLayer {
            tx,
            ring: Arc::clone(&ring),
        });

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("issue {}: push failed", 42);
            tracing::trace!("dropped");
        });

        let ring = ring.lock().unwrap();
        assert_eq!(ring.len(), 1);
        let line: serde_json::Value = serde_json::from_str(&ring[0]).unwrap();
        assert_eq!(line["level"], "warn");
        assert_eq!(line["message"], "issue 42: push failed");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn level_fills_default_filter() {
        assert!(default_filter("debug").starts_with("sentry_solver=debug,"));
        assert!(default_filter("").contains("solver_core=info"));
    }
}
