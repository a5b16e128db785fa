// src/utils/coverage.rs: Per-contig and per-target coverage accounting
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::config::conditions::{Condition, Strand};
use crate::utils::mapping::AlignmentHit;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoverageEntry {
    pub bases: u64,
    pub length: u64,
}

impl CoverageEntry {
    pub fn depth(&self) -> Option<f64> {
        (self.length > 0).then(|| self.bases as f64 / self.length as f64)
    }
}


/// Coverage collected inside one target interval, keyed by contig and left coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetWindow {
    pub contig: String,
    pub left: u64,
    pub size: u64,
    pub cov: u64,
}

impl TargetWindow {
    pub fn depth(&self) -> f64 {
        self.cov as f64 / self.size.max(1) as f64
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct ContigReport {
    pub name: String,
    pub bases: u64,
    pub coverage: f64,
}


#[derive(Debug, Default)]
struct CoverageState {
    contigs: BTreeMap<String, CoverageEntry>,
    windows: BTreeMap<(String, u64), TargetWindow>,
    satisfied: BTreeSet<(String, u64)>,
    reported_windows: BTreeSet<(String, u64)>,
    reported_contigs: BTreeSet<String>,
}


/// Accumulates mapped bases per contig and per target window.
///
/// All updates go through a single mutex, so a hit is applied atomically and
/// `bases`/`cov` never decrease.
#[derive(Debug)]
pub struct CoverageTracker {
    depth_target: f64,
    state: Mutex<CoverageState>,
}

impl CoverageTracker {
    pub fn new(depth_target: f64) -> Self {
        CoverageTracker {
            depth_target,
            state: Mutex::new(CoverageState::default()),
        }
    }

    pub fn depth_target(&self) -> f64 {
        self.depth_target
    }

    fn state(&self) -> MutexGuard<'_, CoverageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a contig. A contig already tracked keeps its bases.
    pub fn add_contig(&self, name: &str, length: u64) {
        self.state()
            .contigs
            .entry(name.to_string())
            .or_insert(CoverageEntry { bases: 0, length });
    }

    /// Adds a mapping to the contig total and, if a condition is given, to the first of its
    /// target windows containing `coordinate`.
    ///
    /// # Arguments
    ///
    /// * `contig` - Contig the read mapped to.
    /// * `mapped_length` - Matching bases of the alignment.
    /// * `strand` - Strand of the alignment.
    /// * `coordinate` - Reference start on the + strand, reference end on the - strand.
    /// * `condition` - Condition governing the read's channel, if any.
    ///
    /// # Returns
    /// true if the hit landed in a target window.
    pub fn record_hit(
        &self,
        contig: &str,
        mapped_length: u64,
        strand: Strand,
        coordinate: u64,
        condition: Option<&Condition>,
    ) -> bool {
        let mut state = self.state();

        let length = match state.contigs.get_mut(contig) {
            Some(entry) => {
                entry.bases += mapped_length;
                entry.length
            }
            None => {
                warn!("Ignoring hit on untracked contig {}", contig);
                return false;
            }
        };

        let Some(interval) = condition.and_then(|c| c.matching_interval(contig, strand, coordinate)) else {
            return false;
        };

        let key = (contig.to_string(), interval.start);
        let window = state.windows.entry(key.clone()).or_insert_with(|| TargetWindow {
            contig: contig.to_string(),
            left: interval.start,
            size: interval.size(length).max(1),
            cov: 0,
        });
        window.cov += mapped_length;

        if window.depth() >= self.depth_target && state.satisfied.insert(key) {
            debug!("Target {}:{} reached depth {}", contig, interval.start, self.depth_target);
        }
        true
    }

    pub fn record_alignment(&self, hit: &AlignmentHit, condition: Option<&Condition>) -> bool {
        self.record_hit(&hit.contig, hit.matched_length, hit.strand, hit.coordinate(), condition)
    }

    pub fn entry(&self, contig: &str) -> Option<CoverageEntry> {
        self.state().contigs.get(contig).copied()
    }

    pub fn tracked_contigs(&self) -> usize {
        self.state().contigs.len()
    }

    /// Contigs at or above the depth target, with their depth.
    pub fn target_coverage(&self) -> BTreeMap<String, f64> {
        self.state()
            .contigs
            .iter()
            .filter_map(|(name, entry)| entry.depth().map(|d| (name, d)))
            .filter(|(_, depth)| *depth >= self.depth_target)
            .map(|(name, depth)| (name.clone(), depth))
            .collect()
    }

    /// True when every tracked contig is at depth. An empty tracker is trivially complete.
    pub fn check_complete(&self) -> bool {
        self.tracked_contigs() == self.target_coverage().len()
    }

    /// Fraction of tracked contigs at depth; 0 when nothing is tracked.
    pub fn fraction_at_depth(&self) -> f64 {
        match self.tracked_contigs() {
            0 => 0.0,
            n => self.target_coverage().len() as f64 / n as f64,
        }
    }

    /// Left coordinates of satisfied windows, per contig.
    pub fn satisfied_windows(&self) -> BTreeMap<String, BTreeSet<u64>> {
        let mut out: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
        for (contig, left) in &self.state().satisfied {
            out.entry(contig.clone()).or_default().insert(*left);
        }
        out
    }

    /// Satisfied windows not returned by a previous call.
    pub fn take_newly_satisfied(&self) -> BTreeMap<String, Vec<u64>> {
        let mut state = self.state();
        let fresh: Vec<(String, u64)> = state
            .satisfied
            .difference(&state.reported_windows)
            .cloned()
            .collect();

        let mut out: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for key in fresh {
            out.entry(key.0.clone()).or_default().push(key.1);
            state.reported_windows.insert(key);
        }
        out
    }

    /// Contigs at depth not returned by a previous call.
    pub fn take_newly_covered_contigs(&self) -> Vec<String> {
        let covered = self.target_coverage();
        let mut state = self.state();
        covered
            .into_keys()
            .filter(|name| state.reported_contigs.insert(name.clone()))
            .collect()
    }

    pub fn windows(&self) -> Vec<TargetWindow> {
        self.state().windows.values().cloned().collect()
    }

    pub fn report(&self) -> Vec<ContigReport> {
        self.state()
            .contigs
            .iter()
            .filter_map(|(name, entry)| {
                entry.depth().map(|coverage| ContigReport {
                    name: name.clone(),
                    bases: entry.bases,
                    coverage,
                })
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::conditions::parse_targets;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_target_coverage_threshold() {
        let tracker = CoverageTracker::new(0.5);
        tracker.add_contig("a", 1000);
        tracker.add_contig("b", 1000);
        tracker.record_hit("a", 500, Strand::Forward, 0, None);
        tracker.record_hit("b", 499, Strand::Forward, 0, None);

        let covered = tracker.target_coverage();
        assert!(covered.contains_key("a"));
        assert!(!covered.contains_key("b"));
        assert!(!tracker.check_complete());

        tracker.record_hit("b", 1, Strand::Forward, 0, None);
        assert!(tracker.check_complete());
    }

    #[test]
    fn test_empty_tracker_is_complete() {
        let tracker = CoverageTracker::new(30.0);
        assert!(tracker.check_complete());
        assert_eq!(tracker.fraction_at_depth(), 0.0);
    }

    #[test]
    fn test_zero_length_contig_never_covered() {
        let tracker = CoverageTracker::new(1.0);
        tracker.add_contig("empty", 0);
        tracker.record_hit("empty", 100, Strand::Forward, 0, None);
        assert!(tracker.target_coverage().is_empty());
        assert!(!tracker.check_complete());
        assert!(tracker.report().is_empty());
    }

    #[test]
    fn test_unknown_contig_ignored() {
        let tracker = CoverageTracker::new(1.0);
        tracker.add_contig("a", 100);
        assert!(!tracker.record_hit("zzz", 100, Strand::Forward, 0, None));
        assert_eq!(tracker.entry("zzz"), None);
        assert_eq!(tracker.tracked_contigs(), 1);
    }

    #[test]
    fn test_add_contig_keeps_bases() {
        let tracker = CoverageTracker::new(1.0);
        tracker.add_contig("a", 100);
        tracker.record_hit("a", 40, Strand::Forward, 0, None);
        tracker.add_contig("a", 100);
        assert_eq!(tracker.entry("a"), Some(CoverageEntry { bases: 40, length: 100 }));
    }

    #[test]
    fn test_window_reported_once() {
        let condition = Condition::new("0", "c", parse_targets(&["chr1,100,199,+"]).unwrap());
        let tracker = CoverageTracker::new(2.0);
        tracker.add_contig("chr1", 10_000);

        assert!(tracker.record_hit("chr1", 150, Strand::Forward, 150, Some(&condition)));
        assert!(tracker.take_newly_satisfied().is_empty());

        assert!(tracker.record_hit("chr1", 50, Strand::Forward, 100, Some(&condition)));
        let fresh = tracker.take_newly_satisfied();
        assert_eq!(fresh.get("chr1"), Some(&vec![100]));

        assert!(tracker.record_hit("chr1", 500, Strand::Forward, 199, Some(&condition)));
        assert!(tracker.take_newly_satisfied().is_empty());
        assert_eq!(tracker.satisfied_windows()["chr1"], BTreeSet::from([100]));

        // wrong strand and outside the interval both miss
        assert!(!tracker.record_hit("chr1", 10, Strand::Reverse, 150, Some(&condition)));
        assert!(!tracker.record_hit("chr1", 10, Strand::Forward, 200, Some(&condition)));
    }

    #[test]
    fn test_unbounded_window_uses_contig_length() {
        let condition = Condition::new("0", "c", parse_targets(&["chr1"]).unwrap());
        let tracker = CoverageTracker::new(1.0);
        tracker.add_contig("chr1", 1000);
        tracker.record_hit("chr1", 999, Strand::Reverse, 5000, Some(&condition));
        assert!(tracker.satisfied_windows().is_empty());
        tracker.record_hit("chr1", 1, Strand::Forward, 0, Some(&condition));
        assert_eq!(tracker.take_newly_satisfied().get("chr1"), Some(&vec![0]));
        assert_eq!(tracker.windows()[0].size, 1000);
    }

    #[test]
    fn test_newly_covered_contigs() {
        let tracker = CoverageTracker::new(1.0);
        tracker.add_contig("a", 10);
        tracker.record_hit("a", 10, Strand::Forward, 0, None);
        assert_eq!(tracker.take_newly_covered_contigs(), vec!["a".to_string()]);
        tracker.record_hit("a", 10, Strand::Forward, 0, None);
        assert!(tracker.take_newly_covered_contigs().is_empty());
    }

    #[test]
    fn test_concurrent_hits_are_not_lost() {
        let condition = Arc::new(Condition::new("0", "c", parse_targets(&["chr1,0,999,+"]).unwrap()));
        let tracker = Arc::new(CoverageTracker::new(1000.0));
        tracker.add_contig("chr1", 1000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                let condition = Arc::clone(&condition);
                thread::spawn(move || {
                    let mut last = 0;
                    for i in 0..1000 {
                        tracker.record_hit("chr1", 3, Strand::Forward, i % 1000, Some(condition.as_ref()));
                        let bases = tracker.entry("chr1").map(|e| e.bases).unwrap_or(0);
                        assert!(bases >= last);
                        last = bases;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tracker.entry("chr1").unwrap().bases, 8 * 1000 * 3);
        assert_eq!(tracker.windows()[0].cov, 8 * 1000 * 3);
    }
}
