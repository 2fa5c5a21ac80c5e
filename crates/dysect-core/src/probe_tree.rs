//! The session's root forest.
//!
//! Session scripts register root probes during the one-shot
//! `on_proc_start` entry; the forest is append-only while a session
//! runs and may only be cleared between sessions.

use serde::{Deserialize, Serialize};

use crate::error::{DysectError, Result};
use crate::probe::ProbeSpec;

/// Ordered forest of root probes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeTree {
    roots: Vec<ProbeSpec>,
    sealed: bool,
}

impl ProbeTree {
    /// Empty forest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root probe. Fails once a session has sealed the tree.
    pub fn add_root(&mut self, root: ProbeSpec) -> Result<()> {
        if self.sealed {
            return Err(DysectError::Fatal(
                "probe tree is sealed; roots can only be added between sessions".into(),
            ));
        }
        self.roots.push(root);
        Ok(())
    }

    /// Registered roots, in registration order.
    #[must_use]
    pub fn roots(&self) -> &[ProbeSpec] {
        &self.roots
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// True when no roots are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Freeze the forest for a session and hand out the roots.
    pub(crate) fn seal(&mut self) -> Vec<ProbeSpec> {
        self.sealed = true;
        self.roots.clone()
    }

    /// Clear between sessions; re-opens the forest.
    pub fn clear(&mut self) {
        self.roots.clear();
        self.sealed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::event::Event;

    #[test]
    fn append_only_while_sealed() {
        let mut tree = ProbeTree::new();
        tree.add_root(ProbeSpec::new(Event::signal(11), Domain::world()))
            .unwrap();
        let roots = tree.seal();
        assert_eq!(roots.len(), 1);
        assert!(tree
            .add_root(ProbeSpec::new(Event::exit(), Domain::world()))
            .is_err());
        tree.clear();
        assert!(tree
            .add_root(ProbeSpec::new(Event::exit(), Domain::world()))
            .is_ok());
    }
}
