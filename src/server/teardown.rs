//! LIFO teardown stack
//!
//! One undo action is pushed per successfully created subsystem, in
//! creation order. Unwinding pops and executes every entry, so a partial
//! bootstrap rolls back exactly the subsystems that were created, newest
//! first, leaving no leaked handle behind.

#![allow(dead_code)]

use log::debug;

use crate::compositor::Compositor;

type Undo = Box<dyn FnOnce(&mut dyn Compositor)>;

struct TeardownEntry {
    step: &'static str,
    undo: Undo,
}

#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<TeardownEntry>,
}

impl TeardownStack {
    pub fn new() -> Self {
        TeardownStack::default()
    }

    /// Record the undo action for a subsystem that was just created.
    pub fn push(&mut self, step: &'static str, undo: impl FnOnce(&mut dyn Compositor) + 'static) {
        self.entries.push(TeardownEntry {
            step,
            undo: Box::new(undo),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop and execute every undo action in reverse creation order.
    pub fn unwind(&mut self, compositor: &mut dyn Compositor) {
        while let Some(entry) = self.entries.pop() {
            debug!("tearing down {}", entry.step);
            (entry.undo)(compositor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::fake::FakeCompositor;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unwind_runs_in_reverse_order_exactly_once() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut stack = TeardownStack::new();
        for step in ["first", "second", "third"] {
            let order = Rc::clone(&order);
            stack.push(step, move |_comp| order.borrow_mut().push(step));
        }
        assert_eq!(stack.len(), 3);

        let mut comp = FakeCompositor::new();
        stack.unwind(&mut comp);
        assert!(stack.is_empty());
        assert_eq!(*order.borrow(), ["third", "second", "first"]);

        // A second unwind has nothing left to execute.
        stack.unwind(&mut comp);
        assert_eq!(order.borrow().len(), 3);
    }
}
