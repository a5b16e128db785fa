// src/utils/mapping.rs: Reference indices, mapping and the idle-index eviction schedule
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use fxhash::FxHashMap as HashMap;
use log::{debug, info, warn};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use crate::config::conditions::Strand;
use crate::config::defs::{PipelineError, INDEX_FILENAME, MINIMAP2_TAG};
use crate::utils::command::{check_version, minimap2};
use crate::utils::coverage::CoverageTracker;
use crate::utils::fastx::contig_lengths;
use crate::utils::paf::PafRecord;
use crate::utils::streams::{feed_fasta_to_stdin, read_child_output_to_vec, spawn_piped, ChildStream};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentHit {
    pub contig: String,
    pub ref_start: u64,
    pub ref_end: u64,
    pub strand: Strand,
    pub matched_length: u64,
}

impl AlignmentHit {
    /// Leading edge of the alignment on the reference: start on +, end on -.
    pub fn coordinate(&self) -> u64 {
        match self.strand {
            Strand::Forward => self.ref_start,
            Strand::Reverse => self.ref_end,
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRead {
    pub read_id: String,
    pub hits: Vec<AlignmentHit>,
}


#[derive(Debug, Clone)]
pub struct Query {
    pub read_id: String,
    pub sequence: Vec<u8>,
}


pub trait Aligner: Send + Sync + 'static {
    /// (name, length) of every contig in the index.
    fn contigs(&self) -> &[(String, u64)];

    /// Maps a batch of queries. One MappedRead per query, in query order; unmapped
    /// queries carry no hits.
    fn map(&self, queries: &[Query]) -> impl Future<Output = Result<Vec<MappedRead>, PipelineError>> + Send;
}


pub trait IndexLoader: Send + Sync + 'static {
    type Aligner: Aligner;

    fn load(&self, path: &Path) -> impl Future<Output = Result<Self::Aligner, PipelineError>> + Send;
}


fn tool_error<E: std::fmt::Display>(e: E) -> PipelineError {
    PipelineError::ToolExecution { tool: MINIMAP2_TAG.to_string(), error: e.to_string() }
}


pub struct Minimap2Loader {
    threads: usize,
}

impl Minimap2Loader {
    pub fn new(threads: usize) -> Self {
        Self { threads: threads.max(1) }
    }
}

impl IndexLoader for Minimap2Loader {
    type Aligner = Minimap2Index;

    async fn load(&self, path: &Path) -> Result<Minimap2Index, PipelineError> {
        let name = path.display().to_string();
        let index_error = |error: String| PipelineError::IndexLoad { name: name.clone(), error };

        let version = check_version(MINIMAP2_TAG).await.map_err(|e| index_error(e.to_string()))?;
        debug!("Using minimap2 {}", version);

        let reference = path.to_path_buf();
        let contigs = tokio::task::spawn_blocking(move || contig_lengths(&reference))
            .await
            .map_err(|e| index_error(e.to_string()))?
            .map_err(|e| index_error(e.to_string()))?;
        if contigs.is_empty() {
            return Err(index_error("reference contains no sequences".to_string()));
        }

        let dir = tempfile::tempdir().map_err(|e| index_error(e.to_string()))?;
        let index_path = dir.path().join(INDEX_FILENAME);
        let output = Command::new(MINIMAP2_TAG)
            .args(minimap2::index_args(path, &index_path))
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| index_error(e.to_string()))?;
        if !output.status.success() {
            return Err(index_error(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        info!("Built index for {} with {} contigs", name, contigs.len());
        Ok(Minimap2Index { _dir: dir, index_path, contigs, threads: self.threads })
    }
}


/// A `.mmi` index living in a temporary directory, removed when dropped.
pub struct Minimap2Index {
    _dir: TempDir,
    index_path: PathBuf,
    contigs: Vec<(String, u64)>,
    threads: usize,
}

impl Aligner for Minimap2Index {
    fn contigs(&self) -> &[(String, u64)] {
        &self.contigs
    }

    async fn map(&self, queries: &[Query]) -> Result<Vec<MappedRead>, PipelineError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let mut child =
            spawn_piped(MINIMAP2_TAG, &minimap2::map_args(&self.index_path, self.threads)).map_err(tool_error)?;

        let stdin = child.stdin.take().ok_or_else(|| tool_error("stdin was not piped"))?;
        let records = queries.iter().map(|q| (q.read_id.clone(), q.sequence.clone())).collect();
        let writer = feed_fasta_to_stdin(stdin, records);

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await.map_err(tool_error)?;
        writer.await.map_err(tool_error)?.map_err(tool_error)?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(tool_error(format!("exited with {}", status)));
        }
        collect_hits(queries, &lines)
    }
}


/// Groups PAF lines by query, keeping the order of `queries`. Secondary alignments are
/// dropped so a repeat does not turn a single-contig read into a multi-contig one.
pub fn collect_hits(queries: &[Query], paf_lines: &[String]) -> Result<Vec<MappedRead>, PipelineError> {
    let positions: HashMap<&str, usize> = queries
        .iter()
        .enumerate()
        .map(|(i, q)| (q.read_id.as_str(), i))
        .collect();
    let mut mapped: Vec<MappedRead> = queries
        .iter()
        .map(|q| MappedRead { read_id: q.read_id.clone(), hits: Vec::new() })
        .collect();

    for line in paf_lines.iter().filter(|l| !l.is_empty()) {
        let record = PafRecord::parse_line(line).map_err(tool_error)?;
        if !record.is_primary() {
            debug!("Skipping secondary alignment of {} to {}", record.qname, record.tname);
            continue;
        }
        let Some(&pos) = positions.get(record.qname.as_str()) else {
            warn!("Ignoring alignment for unknown query {}", record.qname);
            continue;
        };
        mapped[pos].hits.push(record.to_hit().map_err(tool_error)?);
    }
    Ok(mapped)
}


pub struct ReferenceIndex<A: Aligner> {
    pub name: String,
    pub aligner: A,
    last_used: Mutex<Instant>,
}

impl<A: Aligner> ReferenceIndex<A> {
    fn new(name: &str, aligner: A) -> Self {
        Self { name: name.to_string(), aligner, last_used: Mutex::new(Instant::now()) }
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}


/// Named reference indices shared across the pipeline.
///
/// Lookups hand out `Arc` clones, so a caller mid-mapping keeps its index alive even if
/// the eviction sweep drops the registry's handle.
pub struct ReferenceRegistry<L: IndexLoader> {
    loader: L,
    coverage: Arc<CoverageTracker>,
    available: RwLock<BTreeSet<String>>,
    indices: RwLock<HashMap<String, Arc<ReferenceIndex<L::Aligner>>>>,
}

impl<L: IndexLoader> ReferenceRegistry<L> {
    pub fn new(loader: L, coverage: Arc<CoverageTracker>) -> Self {
        Self {
            loader,
            coverage,
            available: RwLock::new(BTreeSet::new()),
            indices: RwLock::new(HashMap::default()),
        }
    }

    pub fn coverage(&self) -> &Arc<CoverageTracker> {
        &self.coverage
    }

    /// Builds an index for `path` and registers it under `name`, replacing any previous
    /// index of that name. The index's contigs start being tracked for coverage.
    pub async fn load(&self, name: &str, path: &Path) -> Result<(), PipelineError> {
        let aligner = self.loader.load(path).await?;
        for (contig, length) in aligner.contigs() {
            self.coverage.add_contig(contig, *length);
        }
        let contigs = aligner.contigs().len();

        let index = Arc::new(ReferenceIndex::new(name, aligner));
        let previous = self
            .indices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), index);
        self.available.write().unwrap_or_else(PoisonError::into_inner).insert(name.to_string());

        if previous.is_some() {
            info!("Reloaded reference {} ({} contigs)", name, contigs);
        } else {
            info!("Loaded reference {} ({} contigs)", name, contigs);
        }
        Ok(())
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.available.read().unwrap_or_else(PoisonError::into_inner).contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.available.read().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ReferenceIndex<L::Aligner>>> {
        if !self.is_available(name) {
            return None;
        }
        self.indices.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn touch(&self, name: &str) -> bool {
        match self.get(name) {
            Some(index) => {
                index.touch();
                true
            }
            None => false,
        }
    }

    pub fn contig_lengths(&self, name: &str) -> Option<Vec<(String, u64)>> {
        self.get(name).map(|index| index.aligner.contigs().to_vec())
    }

    /// Maps queries against the named index, then marks it as used.
    pub async fn map(&self, name: &str, queries: &[Query]) -> Result<Vec<MappedRead>, PipelineError> {
        let index = self.get(name).ok_or_else(|| PipelineError::IndexUnavailable(name.to_string()))?;
        let mapped = index.aligner.map(queries).await?;
        index.touch();
        Ok(mapped)
    }

    /// Drops every index unused for at least `interval`.
    ///
    /// # Returns
    /// Names of the evicted indices.
    pub fn evict_stale(&self, interval: Duration) -> Vec<String> {
        self.stale_candidates(interval)
            .into_iter()
            .filter(|name| self.evict_if_stale(name, interval))
            .collect()
    }

    fn stale_candidates(&self, interval: Duration) -> Vec<String> {
        self.indices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, index)| index.idle_for() >= interval)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Evicts `name` if the index registered under it right now is still idle past `interval`.
    /// A touch or reload since the candidates were collected keeps it.
    fn evict_if_stale(&self, name: &str, interval: Duration) -> bool {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        match indices.get(name) {
            Some(index) if index.idle_for() >= interval => {}
            Some(_) => {
                debug!("Reference {} was used since the sweep started, keeping it", name);
                return false;
            }
            None => return false,
        }
        // unpublish before dropping so no new caller picks the handle up
        self.available.write().unwrap_or_else(PoisonError::into_inner).remove(name);
        indices.remove(name);
        info!("Evicted reference {} after {:?} idle", name, interval);
        true
    }
}


pub struct EvictionHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EvictionHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the sweep loop and waits for it to exit. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Eviction task ended abnormally: {}", e);
            }
        }
    }
}


/// Sweeps the registry for stale indices every `interval` until stopped.
pub fn spawn_eviction<L: IndexLoader>(registry: Arc<ReferenceRegistry<L>>, interval: Duration) -> EvictionHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    debug!("Eviction loop stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    registry.evict_stale(interval);
                }
            }
        }
    });
    EvictionHandle { stop: Some(stop_tx), task: Some(task) }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct MockAligner {
        contigs: Vec<(String, u64)>,
    }

    impl Aligner for MockAligner {
        fn contigs(&self) -> &[(String, u64)] {
            &self.contigs
        }

        async fn map(&self, queries: &[Query]) -> Result<Vec<MappedRead>, PipelineError> {
            Ok(queries
                .iter()
                .map(|q| MappedRead {
                    read_id: q.read_id.clone(),
                    hits: if q.sequence.is_empty() {
                        Vec::new()
                    } else {
                        vec![AlignmentHit {
                            contig: "chr1".to_string(),
                            ref_start: 0,
                            ref_end: q.sequence.len() as u64,
                            strand: Strand::Forward,
                            matched_length: q.sequence.len() as u64,
                        }]
                    },
                })
                .collect())
        }
    }

    struct MockLoader {
        fail: bool,
    }

    impl IndexLoader for MockLoader {
        type Aligner = MockAligner;

        async fn load(&self, path: &Path) -> Result<MockAligner, PipelineError> {
            if self.fail {
                return Err(PipelineError::IndexLoad {
                    name: path.display().to_string(),
                    error: "bad reference".to_string(),
                });
            }
            Ok(MockAligner { contigs: vec![("chr1".to_string(), 1000), ("chr2".to_string(), 500)] })
        }
    }

    fn registry(fail: bool) -> ReferenceRegistry<MockLoader> {
        ReferenceRegistry::new(MockLoader { fail }, Arc::new(CoverageTracker::new(1.0)))
    }

    fn query(id: &str, len: usize) -> Query {
        Query { read_id: id.to_string(), sequence: vec![b'A'; len] }
    }

    #[test]
    fn test_coordinate_by_strand() {
        let mut hit = AlignmentHit {
            contig: "chr1".to_string(),
            ref_start: 100,
            ref_end: 400,
            strand: Strand::Forward,
            matched_length: 300,
        };
        assert_eq!(hit.coordinate(), 100);
        hit.strand = Strand::Reverse;
        assert_eq!(hit.coordinate(), 400);
    }

    #[test]
    fn test_collect_hits_keeps_query_order() -> Result<(), PipelineError> {
        let queries = vec![query("a", 10), query("b", 10), query("c", 10)];
        let lines = vec![
            "c\t10\t0\t10\t+\tchr1\t1000\t5\t15\t10\t10\t60".to_string(),
            "a\t10\t0\t10\t-\tchr2\t500\t20\t30\t9\t10\t60".to_string(),
            "zzz\t10\t0\t10\t+\tchr1\t1000\t5\t15\t10\t10\t60".to_string(),
            String::new(),
        ];
        let mapped = collect_hits(&queries, &lines)?;
        let ids: Vec<&str> = mapped.iter().map(|m| m.read_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(mapped[0].hits[0].contig, "chr2");
        assert_eq!(mapped[0].hits[0].coordinate(), 30);
        assert!(mapped[1].hits.is_empty());
        assert_eq!(mapped[2].hits.len(), 1);

        assert!(collect_hits(&queries, &["garbage".to_string()]).is_err());
        Ok(())
    }

    #[test]
    fn test_collect_hits_drops_secondary() -> Result<(), PipelineError> {
        let queries = vec![query("a", 10)];
        let lines = vec![
            "a\t10\t0\t10\t+\tchr1\t1000\t5\t15\t10\t10\t60\ttp:A:P".to_string(),
            "a\t10\t0\t10\t+\tchr2\t500\t40\t50\t10\t10\t0\ttp:A:S".to_string(),
        ];
        let mapped = collect_hits(&queries, &lines)?;
        assert_eq!(mapped[0].hits.len(), 1);
        assert_eq!(mapped[0].hits[0].contig, "chr1");
        Ok(())
    }

    #[tokio::test]
    async fn test_load_registers_contigs() -> Result<(), PipelineError> {
        let registry = registry(false);
        registry.load("ref", Path::new("ref.fa")).await?;

        assert!(registry.is_available("ref"));
        assert_eq!(registry.names(), vec!["ref".to_string()]);
        assert_eq!(registry.coverage().tracked_contigs(), 2);
        assert_eq!(registry.contig_lengths("ref").map(|c| c.len()), Some(2));

        let mapped = registry.map("ref", &[query("r1", 50), query("r2", 0)]).await?;
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].hits[0].matched_length, 50);
        assert!(mapped[1].hits.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_load_failure_and_missing_index() {
        let registry = registry(true);
        assert!(matches!(
            registry.load("ref", Path::new("ref.fa")).await,
            Err(PipelineError::IndexLoad { .. })
        ));
        assert!(!registry.is_available("ref"));
        assert!(matches!(
            registry.map("ref", &[query("r1", 5)]).await,
            Err(PipelineError::IndexUnavailable(_))
        ));
        assert!(!registry.touch("ref"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale_respects_touch() -> Result<(), PipelineError> {
        let registry = registry(false);
        registry.load("old", Path::new("a.fa")).await?;
        registry.load("busy", Path::new("b.fa")).await?;

        tokio::time::advance(Duration::from_secs(50)).await;
        registry.map("busy", &[query("r1", 5)]).await?;
        tokio::time::advance(Duration::from_secs(20)).await;

        let evicted = registry.evict_stale(Duration::from_secs(60));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(!registry.is_available("old"));
        assert!(registry.get("old").is_none());
        assert!(registry.is_available("busy"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_rechecks_after_snapshot() -> Result<(), PipelineError> {
        let registry = registry(false);
        registry.load("touched", Path::new("a.fa")).await?;
        registry.load("reloaded", Path::new("b.fa")).await?;
        registry.load("idle", Path::new("c.fa")).await?;

        let interval = Duration::from_secs(60);
        tokio::time::advance(Duration::from_secs(90)).await;
        let mut candidates = registry.stale_candidates(interval);
        candidates.sort();
        assert_eq!(candidates, vec!["idle", "reloaded", "touched"]);

        // used between the snapshot and the removal
        assert!(registry.touch("touched"));
        registry.load("reloaded", Path::new("b.fa")).await?;

        let evicted: Vec<&String> = candidates.iter().filter(|n| registry.evict_if_stale(n, interval)).collect();
        assert_eq!(evicted, vec!["idle"]);
        assert!(registry.is_available("touched"));
        assert!(registry.is_available("reloaded"));
        assert!(registry.get("reloaded").is_some());
        assert!(!registry.is_available("idle"));

        // already gone
        assert!(!registry.evict_if_stale("idle", interval));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_outlives_eviction() -> Result<(), PipelineError> {
        let registry = registry(false);
        registry.load("ref", Path::new("a.fa")).await?;
        let handle = registry.get("ref").ok_or_else(|| PipelineError::IndexUnavailable("ref".into()))?;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(registry.evict_stale(Duration::from_secs(1)), vec!["ref".to_string()]);

        let mapped = handle.aligner.map(&[query("r1", 7)]).await?;
        assert_eq!(mapped[0].hits.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_schedule_and_stop() -> Result<(), PipelineError> {
        let registry = Arc::new(registry(false));
        registry.load("ref", Path::new("a.fa")).await?;

        let mut eviction = spawn_eviction(registry.clone(), Duration::from_secs(10));
        assert!(eviction.is_running());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!registry.is_available("ref"));

        eviction.stop().await;
        assert!(!eviction.is_running());
        eviction.stop().await;
        Ok(())
    }
}
