use std::collections::HashSet;

/// Consumer tags active on one channel.
#[derive(Debug, Default, Clone)]
pub struct ConsumerRegistry {
    tags: HashSet<String>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the tag was already tracked.
    pub fn track(&mut self, consumer_tag: impl Into<String>) -> bool {
        self.tags.insert(consumer_tag.into())
    }

    pub fn forget(&mut self, consumer_tag: &str) -> bool {
        self.tags.remove(consumer_tag)
    }

    pub fn contains(&self, consumer_tag: &str) -> bool {
        self.tags.contains(consumer_tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }

    /// Empty the registry, returning every tag it held.
    pub fn drain(&mut self) -> Vec<String> {
        self.tags.drain().collect()
    }
}
