//! Server-Sent Events framing.

use std::fmt;
use wfcore::{ExecutionEvent, ExecutionSnapshot};

/// One SSE message. Build it, then format it with `to_string()`.
#[derive(Debug, Default, Clone)]
pub struct Event {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
}

impl Event {
    pub fn id<T: Into<String>>(mut self, id: T) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the `event` field (the event type).
    pub fn event<T: Into<String>>(mut self, event: T) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Multi-line data is split into several `data:` lines.
    pub fn data<T: Into<String>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn snapshot(snapshot: &ExecutionSnapshot) -> Result<Self, serde_json::Error> {
        Ok(Event::default()
            .id(snapshot.last_seq.to_string())
            .event("snapshot")
            .data(serde_json::to_string(snapshot)?))
    }

    pub fn execution(event: &ExecutionEvent) -> Result<Self, serde_json::Error> {
        Ok(Event::default()
            .id(event.seq().to_string())
            .event(event.name())
            .data(serde_json::to_string(event)?))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.id {
            writeln!(f, "id: {}", id)?;
        }
        if let Some(event) = &self.event {
            writeln!(f, "event: {}", event)?;
        }
        if let Some(data) = &self.data {
            if data.is_empty() {
                writeln!(f, "data: ")?;
            } else {
                for line in data.lines() {
                    writeln!(f, "data: {}", line)?;
                }
            }
        }
        // blank line terminates the message
        f.write_str("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_event_construction() {
        let event = Event::default()
            .id("3")
            .event("node_start")
            .data("{}")
            .to_string();
        assert_eq!(event, "id: 3\nevent: node_start\ndata: {}\n\n");
    }

    #[test]
    fn multi_line_data() {
        let event = Event::default().data("line 1\nline 2").to_string();
        assert_eq!(event, "data: line 1\ndata: line 2\n\n");
    }

    #[test]
    fn empty_data_still_sends_data_line() {
        assert_eq!(Event::default().data("").to_string(), "data: \n\n");
        assert_eq!(Event::default().to_string(), "\n");
    }
}
