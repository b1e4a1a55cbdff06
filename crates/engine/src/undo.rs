use std::collections::VecDeque;

use bibedit_core::UndoOperation;

/// Undo and redo stacks of editing operations.
///
/// Recording a new operation invalidates the redo history.
#[derive(Debug, Clone)]
pub struct UndoManager {
    undo_stack: VecDeque<UndoOperation>,
    redo_stack: VecDeque<UndoOperation>,
    max_depth: usize,
}

impl UndoManager {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_depth,
        }
    }

    /// Push a freshly performed operation and drop the redo history.
    pub fn record(&mut self, op: UndoOperation) {
        self.push_undo(op);
        self.clear_redo();
    }

    pub fn push_undo(&mut self, op: UndoOperation) {
        self.undo_stack.push_back(op);
        // Oldest entries fall off once the history is full.
        if self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
    }

    pub fn pop_undo(&mut self) -> Option<UndoOperation> {
        self.undo_stack.pop_back()
    }

    pub fn push_redo(&mut self, op: UndoOperation) {
        self.redo_stack.push_back(op);
        if self.redo_stack.len() > self.max_depth {
            self.redo_stack.pop_front();
        }
    }

    pub fn pop_redo(&mut self) -> Option<UndoOperation> {
        self.redo_stack.pop_back()
    }

    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Next operation `undo` would reverse.
    pub fn peek_undo(&self) -> Option<&UndoOperation> {
        self.undo_stack.back()
    }

    pub fn peek_redo(&self) -> Option<&UndoOperation> {
        self.redo_stack.back()
    }

    /// Both stacks, oldest entry first, for persisting a session.
    pub fn snapshot(&self) -> (Vec<UndoOperation>, Vec<UndoOperation>) {
        (
            self.undo_stack.iter().cloned().collect(),
            self.redo_stack.iter().cloned().collect(),
        )
    }

    pub fn restore(&mut self, undo: Vec<UndoOperation>, redo: Vec<UndoOperation>) {
        self.clear();
        for op in undo {
            self.push_undo(op);
        }
        for op in redo {
            self.push_redo(op);
        }
    }
}
