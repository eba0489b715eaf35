//! Variable scope.
//!
//! A [`VariableScope`] is the mutable mapping that expression resolution
//! reads and step outputs write into.  It is a stack of frames: the root
//! frame holds workflow-level variables (including the read-only `inputs`
//! binding), and each loop iteration pushes a child frame holding `item`,
//! `item_index`, or `accumulator`.  Lookups walk from the innermost frame
//! outward; writes always land in the innermost frame, so nothing written
//! inside an iteration ever escapes it.

use serde_json::{Map, Value};

/// A stack of variable frames.  Owned by exactly one task at a time.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    /// `frames[0]` is the root; the last frame is the innermost.
    frames: Vec<Map<String, Value>>,
}

impl VariableScope {
    /// Create a scope with a single empty root frame.
    pub fn new() -> Self {
        Self {
            frames: vec![Map::new()],
        }
    }

    /// Create a scope whose root frame holds the given variables.
    pub fn from_root(root: Map<String, Value>) -> Self {
        Self { frames: vec![root] }
    }

    /// Look up a variable, walking from the innermost frame outward.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Whether a variable is defined in any frame.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Write a variable into the innermost frame.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    /// Clone this scope and push a fresh iteration frame onto the copy.
    ///
    /// The child observes everything the parent held at the time of the
    /// call; writes into the child never reach the parent.
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.frames.push(Map::new());
        child
    }

    /// Clone this scope without adding a frame (a launch-time snapshot for
    /// a parallel branch).
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Flatten the scope into a single map.  Inner frames shadow outer ones.
    pub fn flatten(&self) -> Map<String, Value> {
        let mut flat = Map::new();
        for frame in &self.frames {
            for (k, v) in frame {
                flat.insert(k.clone(), v.clone());
            }
        }
        flat
    }

    /// Number of frames currently on the stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
