use serde::{Deserialize, Serialize};

use super::identity::SessionId;

/// One frame of the subflow call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStackItem {
    /// Flow type running in this frame
    pub flow_type: String,

    /// Whether this flow may open sessions under its own protocol
    pub is_initiating: bool,

    /// Sessions opened while this frame was on top
    pub session_ids: Vec<SessionId>,
}

/// Strict LIFO stack of running flow frames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStack {
    items: Vec<FlowStackItem>,
}

impl FlowStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame for a flow entering execution
    pub fn push(&mut self, flow_type: impl Into<String>, is_initiating: bool) {
        self.items.push(FlowStackItem {
            flow_type: flow_type.into(),
            is_initiating,
            session_ids: Vec::new(),
        });
    }

    /// Pop the top frame
    pub fn pop(&mut self) -> Option<FlowStackItem> {
        self.items.pop()
    }

    /// Top frame
    pub fn peek(&self) -> Option<&FlowStackItem> {
        self.items.last()
    }

    /// Record a session against the top frame
    pub fn add_session(&mut self, session_id: SessionId) -> bool {
        match self.items.last_mut() {
            Some(top) => {
                top.session_ids.push(session_id);
                true
            }
            None => false,
        }
    }

    /// Closest initiating frame, scanning from the top
    pub fn nearest_initiating(&self) -> Option<&FlowStackItem> {
        self.items.iter().rev().find(|item| item.is_initiating)
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the stack has no frames
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Frames from bottom to top
    pub fn items(&self) -> &[FlowStackItem] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_is_lifo() {
        let mut stack = FlowStack::new();
        stack.push("A", true);
        stack.push("B", false);

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.peek().map(|i| i.flow_type.as_str()), Some("B"));
        assert_eq!(stack.pop().map(|i| i.flow_type), Some("B".to_string()));
        assert_eq!(stack.pop().map(|i| i.flow_type), Some("A".to_string()));
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_nearest_initiating_scans_top_down() {
        let mut stack = FlowStack::new();
        assert!(stack.nearest_initiating().is_none());

        stack.push("Outer", true);
        stack.push("Inner", true);
        stack.push("Helper", false);

        assert_eq!(stack.nearest_initiating().map(|i| i.flow_type.as_str()), Some("Inner"));

        stack.pop();
        stack.pop();
        assert_eq!(stack.nearest_initiating().map(|i| i.flow_type.as_str()), Some("Outer"));
    }

    #[test]
    fn test_sessions_attach_to_top_frame() {
        let mut stack = FlowStack::new();
        assert!(!stack.add_session(SessionId("orphan".to_string())));

        stack.push("A", true);
        stack.push("B", false);
        assert!(stack.add_session(SessionId("s1".to_string())));

        assert_eq!(stack.items()[0].session_ids.len(), 0);
        assert_eq!(stack.items()[1].session_ids, vec![SessionId("s1".to_string())]);
    }
}
