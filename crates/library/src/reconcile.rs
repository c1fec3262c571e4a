use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use common::{FileDescriptor, FileSignature, IndexMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    New,
    Modified,
    Unchanged,
}

/// Compares one scan pass against the live index as it was when the pass began.
pub struct Reconciler {
    live: HashMap<String, FileSignature>,
    observed: HashSet<String>,
    root: PathBuf,
    mode: IndexMode,
}

impl Reconciler {
    pub fn new(
        live: HashMap<String, FileSignature>,
        root: impl Into<PathBuf>,
        mode: IndexMode,
    ) -> Self {
        Self {
            live,
            observed: HashSet::new(),
            root: root.into(),
            mode,
        }
    }

    pub fn observe(&mut self, file: &FileDescriptor) -> Classification {
        let key = file.key();
        let class = match self.live.get(&key) {
            None => Classification::New,
            Some(stored) if self.mode == IndexMode::Full || *stored != file.signature() => {
                Classification::Modified
            }
            Some(_) => Classification::Unchanged,
        };
        self.observed.insert(key);
        class
    }

    /// Live paths under the root that the pass never observed.
    pub fn finish(self) -> Vec<String> {
        let mut removed: Vec<String> = self
            .live
            .into_keys()
            .filter(|path| !self.observed.contains(path))
            .filter(|path| Path::new(path).starts_with(&self.root))
            .collect();
        removed.sort();
        removed
    }
}
