//! Sources and the per-job source registry

use crate::nexus_writer::modules::WriterModule;
use crate::nexus_writer::schema::source_hash;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Identity of a logical producer: `(topic, source_name)` plus the stable
/// 64-bit hash of the source name used for registry lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceKey {
    topic: String,
    source_name: String,
    hash: u64,
}

impl SourceKey {
    pub fn new(topic: &str, source_name: &str) -> SourceKey {
        SourceKey {
            topic: topic.to_string(),
            source_name: source_name.to_string(),
            hash: source_hash(source_name),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Cumulative per-source counters. Written by the demultiplexer and the
/// sink thread, read by the status reporter.
#[derive(Debug, Default)]
pub struct SourceStats {
    pub messages_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub bytes_written: AtomicU64,
    pub repeated_dropped: AtomicU64,
    pub unordered_timestamps: AtomicU64,
    /// Last timestamp accepted by the filter, `i64::MIN` before the first.
    pub last_timestamp_ns: AtomicI64,
    /// Row index of the last successful write.
    pub last_row_index: AtomicU64,
}

impl SourceStats {
    pub fn new() -> Arc<SourceStats> {
        let stats = SourceStats::default();
        stats.last_timestamp_ns.store(i64::MIN, Ordering::Relaxed);
        Arc::new(stats)
    }
}

/// One source registered at job start: its writer-module instance, the file
/// group it owns and its statistics. Owned by exactly one job; writer
/// modules are never shared across jobs.
pub struct SourceEntry {
    key: SourceKey,
    schema_id: String,
    group_path: String,
    module: Arc<Mutex<Box<dyn WriterModule>>>,
    accepts_repeated_timestamps: bool,
    stats: Arc<SourceStats>,
    removed: AtomicBool,
}

impl SourceEntry {
    pub fn new(
        key: SourceKey,
        schema_id: String,
        group_path: String,
        module: Box<dyn WriterModule>,
    ) -> SourceEntry {
        let accepts_repeated_timestamps = module.accepts_repeated_timestamps();
        SourceEntry {
            key,
            schema_id,
            group_path,
            module: Arc::new(Mutex::new(module)),
            accepts_repeated_timestamps,
            stats: SourceStats::new(),
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    /// The module handle; locked only on the file sink's writer thread.
    pub fn module(&self) -> Arc<Mutex<Box<dyn WriterModule>>> {
        self.module.clone()
    }

    pub fn accepts_repeated_timestamps(&self) -> bool {
        self.accepts_repeated_timestamps
    }

    pub fn stats(&self) -> &Arc<SourceStats> {
        &self.stats
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Marks the source removed. Returns true only on the transition, so
    /// removal stays idempotent.
    pub fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::SeqCst)
    }
}

/// Outcome of a removal attempt on a topic's source map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    AlreadyRemoved,
    NotFound,
}

/// The sources of one topic, keyed by source hash. Read-mostly: written at
/// job init and on source removal only.
#[derive(Default)]
pub struct TopicSources {
    sources: Mutex<HashMap<u64, Arc<SourceEntry>>>,
    active: AtomicUsize,
}

impl TopicSources {
    pub fn insert(&self, entry: Arc<SourceEntry>) {
        let mut sources = self.sources.lock().expect("source map poisoned");
        if sources.insert(entry.key().hash(), entry).is_none() {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self, hash: u64) -> Option<Arc<SourceEntry>> {
        self.sources
            .lock()
            .expect("source map poisoned")
            .get(&hash)
            .cloned()
    }

    /// Idempotent removal; the entry stays in the map (its statistics are
    /// still reported) but stops accepting messages.
    pub fn remove(&self, hash: u64) -> RemoveOutcome {
        let entry = match self.get(hash) {
            Some(entry) => entry,
            None => return RemoveOutcome::NotFound,
        };
        if entry.mark_removed() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            RemoveOutcome::Removed
        } else {
            RemoveOutcome::AlreadyRemoved
        }
    }

    /// Sources not yet removed. The topic's partitions retire when this
    /// reaches zero.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> Vec<Arc<SourceEntry>> {
        let mut entries: Vec<Arc<SourceEntry>> = self
            .sources
            .lock()
            .expect("source map poisoned")
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.key().source_name().cmp(b.key().source_name()));
        entries
    }
}

/// All sources of one job, grouped by topic.
#[derive(Default)]
pub struct SourceRegistry {
    topics: HashMap<String, Arc<TopicSources>>,
}

impl SourceRegistry {
    pub fn new() -> SourceRegistry {
        SourceRegistry::default()
    }

    pub fn insert(&mut self, entry: Arc<SourceEntry>) {
        self.topics
            .entry(entry.key().topic().to_string())
            .or_default()
            .insert(entry);
    }

    pub fn topic(&self, topic: &str) -> Option<Arc<TopicSources>> {
        self.topics.get(topic).cloned()
    }

    pub fn topics(&self) -> impl Iterator<Item = (&String, &Arc<TopicSources>)> {
        self.topics.iter()
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexus_writer::modules::writer_modules;

    fn entry(topic: &str, source: &str) -> Arc<SourceEntry> {
        Arc::new(SourceEntry::new(
            SourceKey::new(topic, source),
            "f142".to_string(),
            format!("/entry/{}", source),
            writer_modules().instantiate("f142").unwrap(),
        ))
    }

    #[test]
    fn removal_is_idempotent() {
        let sources = TopicSources::default();
        let e = entry("t", "s1");
        let hash = e.key().hash();
        sources.insert(e);
        assert_eq!(sources.active_count(), 1);
        assert_eq!(sources.remove(hash), RemoveOutcome::Removed);
        assert_eq!(sources.remove(hash), RemoveOutcome::AlreadyRemoved);
        assert_eq!(sources.active_count(), 0);
        assert_eq!(sources.remove(12345), RemoveOutcome::NotFound);
    }

    #[test]
    fn removed_entries_keep_reporting_stats() {
        let sources = TopicSources::default();
        let e = entry("t", "s1");
        let hash = e.key().hash();
        sources.insert(e);
        sources.remove(hash);
        assert!(sources.get(hash).unwrap().is_removed());
        assert_eq!(sources.entries().len(), 1);
    }

    #[test]
    fn registry_groups_by_topic() {
        let mut registry = SourceRegistry::new();
        registry.insert(entry("alpha", "s1"));
        registry.insert(entry("alpha", "s2"));
        registry.insert(entry("beta", "s3"));
        assert_eq!(registry.topic_names(), vec!["alpha", "beta"]);
        assert_eq!(registry.topic("alpha").unwrap().active_count(), 2);
        assert!(registry.topic("gamma").is_none());
    }
}
