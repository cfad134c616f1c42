//! Output sinks - where a provider session sends what it produces.

use serde_json::Value;
use tokio::sync::mpsc;

use super::TurnOutcome;
use crate::session::ContextUsage;

/// Receives streamed output and lifecycle events from a session.
///
/// Calls are made inline from the turn loop, so implementations must not
/// block.
pub trait OutputSink: Send + Sync {
    /// Visible text as it streams in.
    fn on_token(&self, text: &str);

    fn on_tool_start(&self, _name: &str, _args: &Value) {}

    fn on_tool_end(&self, _name: &str, _success: bool, _summary: &str) {}

    fn on_context_usage(&self, _usage: ContextUsage) {}

    /// Informational line for the user, e.g. a slow response warning.
    fn on_notice(&self, _text: &str) {}

    fn on_error(&self, message: &str);

    fn on_turn_end(&self, _outcome: &TurnOutcome) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_token(&self, _text: &str) {}
    fn on_error(&self, _message: &str) {}
}

/// A sink event, as delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Token(String),
    ToolStart { name: String, args: Value },
    ToolEnd { name: String, success: bool, summary: String },
    ContextUsage(ContextUsage),
    Notice(String),
    Error(String),
    TurnEnd(TurnOutcome),
}

/// Forwards events over an unbounded channel, for UI consumers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        // Receiver gone means nobody is watching
        let _ = self.tx.send(event);
    }
}

impl OutputSink for ChannelSink {
    fn on_token(&self, text: &str) {
        self.send(SessionEvent::Token(text.to_string()));
    }

    fn on_tool_start(&self, name: &str, args: &Value) {
        self.send(SessionEvent::ToolStart {
            name: name.to_string(),
            args: args.clone(),
        });
    }

    fn on_tool_end(&self, name: &str, success: bool, summary: &str) {
        self.send(SessionEvent::ToolEnd {
            name: name.to_string(),
            success,
            summary: summary.to_string(),
        });
    }

    fn on_context_usage(&self, usage: ContextUsage) {
        self.send(SessionEvent::ContextUsage(usage));
    }

    fn on_notice(&self, text: &str) {
        self.send(SessionEvent::Notice(text.to_string()));
    }

    fn on_error(&self, message: &str) {
        self.send(SessionEvent::Error(message.to_string()));
    }

    fn on_turn_end(&self, outcome: &TurnOutcome) {
        self.send(SessionEvent::TurnEnd(outcome.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_token("he");
        sink.on_tool_end("voice_inbox", true, "2 messages");
        sink.on_turn_end(&TurnOutcome::Cancelled);

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Token("he".into()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::ToolEnd { success: true, .. }
        ));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::TurnEnd(TurnOutcome::Cancelled));
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_error("nobody hears this");
    }
}
