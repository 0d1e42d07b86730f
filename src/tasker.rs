//! Concurrent page batching: accumulates per-kind caches, and once a
//! cache reaches `page_size * concurrency` entries, splits it into
//! `concurrency` equal slices and submits one job per slice to a
//! bounded `rayon` thread pool, blocking until all complete. `finish()`
//! flushes whatever remains.

use rayon::prelude::*;

use crate::model::{Node, Relation, Way};
use crate::rawwriter;
use crate::store::SqlSink;
use crate::{error::Result, info};

pub struct Tasker<'a, S: SqlSink> {
    store: &'a S,
    pool: rayon::ThreadPool,
    page_size: usize,
    concurrency: usize,
    nodecache: Vec<Node>,
    waycache: Vec<Way>,
    relcache: Vec<Relation>,
}

impl<'a, S: SqlSink> Tasker<'a, S> {
    pub fn new(store: &'a S, page_size: usize, concurrency: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .build()
            .expect("failed to build worker pool");
        Tasker {
            store,
            pool,
            page_size,
            concurrency: concurrency.max(1),
            nodecache: Vec::new(),
            waycache: Vec::new(),
            relcache: Vec::new(),
        }
    }

    fn threshold(&self) -> usize {
        self.page_size * self.concurrency
    }

    pub fn apply_node(&mut self, node: Node) -> Result<()> {
        self.nodecache.push(node);
        if self.nodecache.len() >= self.threshold() {
            self.flush_nodes()?;
        }
        Ok(())
    }

    pub fn apply_way(&mut self, way: Way) -> Result<()> {
        self.waycache.push(way);
        if self.waycache.len() >= self.threshold() {
            self.flush_ways()?;
        }
        Ok(())
    }

    pub fn apply_relation(&mut self, relation: Relation) -> Result<()> {
        self.relcache.push(relation);
        if self.relcache.len() >= self.threshold() {
            self.flush_relations()?;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.flush_nodes()?;
        self.flush_ways()?;
        self.flush_relations()?;
        Ok(())
    }

    fn flush_nodes(&mut self) -> Result<()> {
        if self.nodecache.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.nodecache);
        info!("flushing {} nodes", batch.len());
        self.run_slices(&batch, rawwriter::apply_node)
    }

    fn flush_ways(&mut self) -> Result<()> {
        if self.waycache.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.waycache);
        info!("flushing {} ways", batch.len());
        self.run_slices(&batch, rawwriter::apply_way)
    }

    fn flush_relations(&mut self) -> Result<()> {
        if self.relcache.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.relcache);
        info!("flushing {} relations", batch.len());
        self.run_slices(&batch, rawwriter::apply_relation)
    }

    /// Split `batch` into `concurrency` roughly-equal slices, run one
    /// job per slice in the pool, and propagate the first error seen
    /// (ordering across slices is not guaranteed; correctness relies
    /// on the version-guarded upsert invariant).
    fn run_slices<T: Sync>(&self, batch: &[T], build_sql: fn(&T) -> Vec<String>) -> Result<()> {
        let chunk_size = batch.len().div_ceil(self.concurrency).max(1);
        let store = self.store;
        self.pool.install(|| {
            batch
                .par_chunks(chunk_size)
                .map(|slice| {
                    let mut sql = String::new();
                    for item in slice {
                        for stmt in build_sql(item) {
                            sql.push_str(&stmt);
                            sql.push_str(";\n");
                        }
                    }
                    store.query(&sql)
                })
                .collect::<Result<Vec<()>>>()
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use crate::store::SqlSink;
    use std::sync::Mutex as StdMutex;

    /// Captures every batch of SQL text submitted to it, so the
    /// tasker's paging/flush behaviour can be exercised without a live
    /// PostgreSQL instance.
    #[derive(Default)]
    struct FakeSink {
        batches: StdMutex<Vec<String>>,
    }

    impl SqlSink for FakeSink {
        fn query(&self, sql: &str) -> Result<()> {
            self.batches.lock().unwrap().push(sql.to_string());
            Ok(())
        }
    }

    #[test]
    fn threshold_is_page_size_times_concurrency() {
        let page_size = 1000;
        let concurrency = 4;
        assert_eq!(page_size * concurrency, 4000);
    }

    #[test]
    fn flushes_once_threshold_is_reached() {
        let sink = FakeSink::default();
        let mut tasker = Tasker::new(&sink, 2, 2); // threshold = 4

        for i in 0..3 {
            tasker.apply_node(Node::new(i, 0.0, 0.0)).unwrap();
        }
        assert!(sink.batches.lock().unwrap().is_empty(), "below threshold, no flush yet");

        tasker.apply_node(Node::new(3, 0.0, 0.0)).unwrap();
        assert!(!sink.batches.lock().unwrap().is_empty(), "threshold reached, flush happened");
    }

    #[test]
    fn finish_flushes_partial_caches() {
        let sink = FakeSink::default();
        let mut tasker = Tasker::new(&sink, 1000, 4); // threshold = 4000, never reached

        tasker.apply_node(Node::new(1, 0.0, 0.0)).unwrap();
        tasker.apply_node(Node::new(2, 0.0, 0.0)).unwrap();
        assert!(sink.batches.lock().unwrap().is_empty());

        tasker.finish().unwrap();
        let batches = sink.batches.lock().unwrap();
        let combined: String = batches.concat();
        assert!(combined.contains("INSERT INTO nodes"));
        assert_eq!(combined.matches("INSERT INTO nodes").count(), 2);
    }
}
