use crate::errors::*;
use chrono::prelude::*;
use tokio::sync::mpsc;

/// Append-only observational record, produced everywhere and consumed by the event log
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub when: DateTime<Utc>,
    pub who: String,
    pub what: String,
}

impl Event {
    pub fn new<W: Into<String>, M: Into<String>>(who: W, what: M) -> Event {
        Event {
            when: Utc::now(),
            who: who.into(),
            what: what.into(),
        }
    }

    /// Renders the event as a single line of the event log
    pub fn format(&self) -> String {
        format!("{} : {}: {}", self.when.format("%F %T"), self.who, self.what.trim())
    }
}

pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Producer side of the shared event channel, cheap to clone
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn emit<W: Into<String>, M: Into<String>>(&self, who: W, what: M) {
        let event = Event::new(who, what);
        if let Err(err) = self.tx.send(event) {
            // the event log is gone, this only happens during shutdown
            warn!("Event log is closed, dropping event: {}", err.0.format());
        }
    }

    pub fn source<W: Into<String>>(&self, who: W) -> EventSource {
        EventSource {
            who: who.into(),
            sender: self.clone(),
        }
    }
}

/// An `EventSender` bound to a fixed identity
#[derive(Debug, Clone)]
pub struct EventSource {
    who: String,
    sender: EventSender,
}

impl EventSource {
    pub fn who(&self) -> &str {
        &self.who
    }

    pub fn emit<M: Into<String>>(&self, what: M) {
        self.sender.emit(self.who.as_str(), what);
    }
}
