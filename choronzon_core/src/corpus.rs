use crate::coverage::{BasicBlock, CoverageSet, GlobalCoverage, TerminationReason};
use crate::gene::Chromosome;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Length of an MD5 digest in bytes. Serialized-byte dedup keys.
const MD5_DIGEST_LEN: usize = 16;

/// One admitted chromosome together with everything the engine needs to
/// re-evaluate, checkpoint and evict it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusMember {
    pub chromosome: Chromosome,
    /// The exact bytes fed to the target. Kept so checkpoints and replay
    /// do not depend on re-serialization being stable.
    pub bytes: Vec<u8>,
    /// Coverage credited to this member in the global map. Re-evaluating
    /// the member must not credit these blocks again.
    pub coverage: CoverageSet,
    /// Admission sequence number; doubles as age for eviction tie-breaks.
    pub seq: u64,
}

/// A crash representative: the first chromosome observed faulting at a
/// given basic block. Never evicted. Only the serialized bytes are kept;
/// crash inputs are often malformed beyond what the plug-in can re-parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    pub uid: u64,
    pub bytes: Vec<u8>,
    /// The signal or exception code from the sentinel.
    pub code: u64,
}

/// Why a trial's chromosome entered (or missed) the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Rule 1: fatal termination. Also records a crash representative.
    Crash { site: BasicBlock },
    /// Rule 2: the trial covered at least one block never seen before.
    Novelty,
    /// Rule 3: fitness beat the corpus minimum.
    Fitness,
    Rejected(RejectReason),
}

impl Admission {
    pub fn admitted(self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Rule 4: identical serialized bytes already present.
    Duplicate,
    /// Fitness did not beat the corpus minimum.
    LowFitness,
    /// Timed-out trials may only enter through rules 1 and 2, so slow
    /// inputs are not rewarded for fitness alone.
    TimeoutWithoutNovelty,
}

/// The population: an ordered multiset of chromosomes keyed by fitness
/// descending (ties broken oldest-first), capped at a configured size.
///
/// Invariants the corpus maintains:
/// * no two members share identical serialized bytes;
/// * `len() <= cap` after every admission;
/// * members are admitted post-execution, so the top member has always
///   been executed;
/// * crash representatives live outside the cap and are never evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    members: Vec<CorpusMember>,
    crashes: BTreeMap<BasicBlock, CrashRecord>,
    #[serde(skip)]
    digests: HashSet<[u8; MD5_DIGEST_LEN]>,
    cap: usize,
    next_seq: u64,
}

impl Corpus {
    pub fn new(cap: usize) -> Self {
        Corpus {
            members: Vec::new(),
            crashes: BTreeMap::new(),
            digests: HashSet::new(),
            cap: cap.max(1),
            next_seq: 0,
        }
    }

    /// Reassembles a corpus from checkpointed parts (campaign resume).
    pub fn from_parts(
        cap: usize,
        next_seq: u64,
        members: Vec<CorpusMember>,
        crashes: BTreeMap<BasicBlock, CrashRecord>,
    ) -> Self {
        let mut corpus = Corpus {
            members,
            crashes,
            digests: HashSet::new(),
            cap: cap.max(1),
            next_seq,
        };
        corpus.rebuild_digests();
        corpus.reorder();
        corpus
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Members in corpus order: fitness descending, older first on ties.
    pub fn members(&self) -> &[CorpusMember] {
        &self.members
    }

    pub fn member_by_uid(&self, uid: u64) -> Option<&CorpusMember> {
        self.members.iter().find(|m| m.chromosome.uid == uid)
    }

    /// The top-scoring member.
    pub fn best(&self) -> Option<&CorpusMember> {
        self.members.first()
    }

    pub fn min_fitness(&self) -> f64 {
        self.members
            .last()
            .map(|m| m.chromosome.fitness)
            .unwrap_or(0.0)
    }

    pub fn contains_bytes(&self, bytes: &[u8]) -> bool {
        self.digests.contains(&md5::compute(bytes).0)
    }

    pub fn crashes(&self) -> &BTreeMap<BasicBlock, CrashRecord> {
        &self.crashes
    }

    /// Rebuilds the digest set after deserialization (it is not persisted).
    pub fn rebuild_digests(&mut self) {
        self.digests = self
            .members
            .iter()
            .map(|m| md5::compute(&m.bytes).0)
            .collect();
    }

    /// Evaluates the admission rules for one executed trial, in order, and
    /// updates the corpus and the global coverage map accordingly.
    ///
    /// `already_credited` holds blocks this chromosome was credited for in
    /// an earlier evaluation (empty for a fresh child); they are excluded
    /// from the `G` update so re-evaluation cannot double-count.
    pub fn admit(
        &mut self,
        mut chromosome: Chromosome,
        bytes: Vec<u8>,
        coverage: CoverageSet,
        termination: TerminationReason,
        last_hit: Option<BasicBlock>,
        already_credited: &CoverageSet,
        global: &mut GlobalCoverage,
    ) -> Admission {
        let fitness = global.fitness_of(&coverage);
        let novelty = global.has_novelty(&coverage);
        chromosome.fitness = fitness;
        chromosome.executed = true;

        let verdict = if termination.is_fatal() {
            let code = match termination {
                TerminationReason::FatalSignal(code) => code,
                _ => unreachable!(),
            };
            // The faulting block keys the crash set; a fault before any hit
            // record lands on the zero site.
            let site = last_hit.unwrap_or((0, 0));
            self.crashes.entry(site).or_insert_with(|| CrashRecord {
                uid: chromosome.uid,
                bytes: bytes.clone(),
                code,
            });
            Admission::Crash { site }
        } else if novelty {
            Admission::Novelty
        } else if termination == TerminationReason::Timeout {
            return Admission::Rejected(RejectReason::TimeoutWithoutNovelty);
        } else if self.is_empty() || fitness > self.min_fitness() {
            Admission::Fitness
        } else {
            return Admission::Rejected(RejectReason::LowFitness);
        };

        // Rule 4 vetoes corpus insertion even for crashes; the crash
        // representative above is already recorded either way.
        let digest = md5::compute(&bytes).0;
        if self.digests.contains(&digest) {
            return match verdict {
                Admission::Crash { .. } => verdict,
                _ => Admission::Rejected(RejectReason::Duplicate),
            };
        }

        let fresh: CoverageSet = coverage.difference(already_credited).copied().collect();
        global.credit(fresh.iter());

        self.digests.insert(digest);
        self.members.push(CorpusMember {
            chromosome,
            bytes,
            coverage,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.reorder();
        self.evict_overflow();
        verdict
    }

    fn reorder(&mut self) {
        self.members.sort_by(|a, b| {
            b.chromosome
                .fitness
                .partial_cmp(&a.chromosome.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
    }

    /// Drops lowest-fitness members (oldest first among ties) until the
    /// cap holds again.
    fn evict_overflow(&mut self) {
        while self.members.len() > self.cap {
            let min = self
                .members
                .iter()
                .map(|m| m.chromosome.fitness)
                .fold(f64::INFINITY, f64::min);
            let victim = self
                .members
                .iter()
                .enumerate()
                .filter(|(_, m)| m.chromosome.fitness == min)
                .min_by_key(|(_, m)| m.seq)
                .map(|(i, _)| i)
                .expect("non-empty corpus has a minimum");
            let evicted = self.members.remove(victim);
            self.digests.remove(&md5::compute(&evicted.bytes).0);
            log::debug!(
                "evicted uid {:#018x} (fitness {:.4}, seq {})",
                evicted.chromosome.uid,
                evicted.chromosome.fitness,
                evicted.seq
            );
        }
    }
}
