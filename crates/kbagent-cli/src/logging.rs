use std::sync::Arc;

use kbagent_core::events::{EventBus, LogLevel};

/// Bridges tracing records into the event bus as log_message events, so
/// subscribers of `kbagent run` see the same lines the tracing subscriber
/// prints to the terminal.
pub(crate) struct EventBusLayer {
    pub bus: Arc<EventBus>,
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() != "message" {
            return;
        }
        let rendered = format!("{value:?}");
        // A &str recorded through the Debug path arrives wrapped in quotes;
        // unwrap it so the event carries the bare text.
        self.message = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(&rendered)
            .to_string();
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventBusLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::TRACE => return,
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if !visitor.message.is_empty() {
            self.bus.log(level, visitor.message);
        }
    }
}
