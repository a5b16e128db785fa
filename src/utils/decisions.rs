// src/utils/decisions.rs: Read classification and decision accounting
use std::collections::BTreeSet;

use fxhash::FxHashMap as HashMap;

use crate::config::conditions::{Condition, Decision};
use crate::utils::mapping::AlignmentHit;


/// Classification of a read against a condition's targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadClass {
    SingleOn,
    SingleOff,
    MultiOn,
    MultiOff,
    NoMap,
    NoSeq,
}

impl ReadClass {
    pub const ALL: [ReadClass; 6] = [
        ReadClass::SingleOn,
        ReadClass::SingleOff,
        ReadClass::MultiOn,
        ReadClass::MultiOff,
        ReadClass::NoMap,
        ReadClass::NoSeq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadClass::SingleOn => "single_on",
            ReadClass::SingleOff => "single_off",
            ReadClass::MultiOn => "multi_on",
            ReadClass::MultiOff => "multi_off",
            ReadClass::NoMap => "no_map",
            ReadClass::NoSeq => "no_seq",
        }
    }
}


/// Classifies a read from its basecalled length and alignments.
///
/// # Arguments
///
/// * `condition` - Condition governing the read's channel.
/// * `sequence_len` - Length of the basecalled sequence.
/// * `hits` - Alignments of the read.
///
/// # Returns
/// ReadClass; on-target if any hit's coordinate falls within a target on its strand.
pub fn classify_read(condition: &Condition, sequence_len: usize, hits: &[AlignmentHit]) -> ReadClass {
    if sequence_len == 0 {
        return ReadClass::NoSeq;
    }
    if hits.is_empty() {
        return ReadClass::NoMap;
    }

    let contigs: BTreeSet<&str> = hits.iter().map(|h| h.contig.as_str()).collect();
    let on_target = hits
        .iter()
        .any(|h| condition.matching_interval(&h.contig, h.strand, h.coordinate()).is_some());

    match (contigs.len() == 1, on_target) {
        (true, true) => ReadClass::SingleOn,
        (true, false) => ReadClass::SingleOff,
        (false, true) => ReadClass::MultiOn,
        (false, false) => ReadClass::MultiOff,
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionEvent {
    StopReceiving,
    Proceed,
    Unblock,
    /// Read discarded because it could not be evaluated in time.
    ExceededMaxChunksUnblocked,
}

impl DecisionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DecisionEvent::Proceed)
    }
}

impl From<Decision> for DecisionEvent {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::StopReceiving => DecisionEvent::StopReceiving,
            Decision::Proceed => DecisionEvent::Proceed,
            Decision::Unblock => DecisionEvent::Unblock,
        }
    }
}


/// Counts decision events over a run.
#[derive(Debug, Clone, Default)]
pub struct DecisionTracker {
    events: HashMap<DecisionEvent, u64>,
}

impl DecisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_seen(&mut self, event: DecisionEvent) {
        *self.events.entry(event).or_insert(0) += 1;
    }

    pub fn count(&self, event: DecisionEvent) -> u64 {
        self.events.get(&event).copied().unwrap_or(0)
    }

    /// Reads that reached a final outcome; `Proceed` is not final.
    pub fn total_reads(&self) -> u64 {
        self.events
            .iter()
            .filter(|(event, _)| event.is_terminal())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn unblocks(&self) -> u64 {
        self.count(DecisionEvent::Unblock)
    }

    pub fn stop_receiving(&self) -> u64 {
        self.count(DecisionEvent::StopReceiving)
    }

    /// Percentage of final reads that were unblocked.
    pub fn proportion_rejected(&self) -> Option<f64> {
        self.percent_of_total(self.unblocks())
    }

    /// Percentage of final reads that were sequenced to completion.
    pub fn proportion_accepted(&self) -> Option<f64> {
        self.percent_of_total(self.stop_receiving())
    }

    fn percent_of_total(&self, n: u64) -> Option<f64> {
        match self.total_reads() {
            0 => None,
            total => Some(n as f64 / total as f64 * 100.0),
        }
    }
}
