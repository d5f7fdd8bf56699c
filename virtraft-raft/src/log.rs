use virtraft_core::{Entry, Index, Term};

/// In-memory replicated log, 1-based.
#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> Index {
        self.entries.len() as Index
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term at `index`; index 0 has term 0, missing indices have none.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    /// Append and return the new entry's index.
    pub fn append(&mut self, entry: Entry) -> Index {
        self.entries.push(entry);
        self.last_index()
    }

    /// Remove every entry from `index` on, returned last-first with their indices.
    pub fn truncate_from(&mut self, index: Index) -> Vec<(Index, Entry)> {
        let mut popped = Vec::new();
        while self.last_index() >= index.max(1) {
            let at = self.last_index();
            match self.entries.pop() {
                Some(entry) => popped.push((at, entry)),
                None => break,
            }
        }
        popped
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<Entry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((from - 1) as usize)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as Index + 1, e))
    }
}
