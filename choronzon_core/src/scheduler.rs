use crate::campaign::{Campaign, CampaignError};
use crate::config::{EngineSettings, WeightSettings};
use crate::corpus::{Admission, Corpus};
use crate::coverage::{CoverageSet, GlobalCoverage, ImageTable, TerminationReason, TrialTrace};
use crate::executor::{ExecError, Executor};
use crate::format::FormatPlugin;
use crate::gene::{Chromosome, GeneTree};
use crate::strategy::{FuzzingStrategy, VariationOp};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Campaign(#[from] CampaignError),

    /// The target could not be spawned; persistent by nature, so fatal.
    #[error("target spawn failed: {0}")]
    Spawn(ExecError),

    /// A single-trial execution error surfaced to the caller (replay).
    #[error("trial execution failed: {0}")]
    Trial(ExecError),

    #[error("tracer failure budget exceeded after {0} consecutive failures")]
    FailureBudgetExceeded(u32),

    #[error("no valid seeds found under {0:?}")]
    NoValidSeeds(PathBuf),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The configured generation cap was reached.
    Completed,
    /// A campaign-level interrupt was raised; state was flushed.
    Interrupted,
}

/// Running totals, logged at every generation boundary.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub trials: u64,
    pub admitted: u64,
    pub crashes: u64,
    pub discarded: u64,
    pub noop_trials: u64,
}

/// The generational loop: select → vary → serialize → spawn → ingest →
/// score → admit, `M` trials per generation, a checkpoint at every
/// generation boundary.
///
/// The engine owns all mutable campaign state (corpus, global coverage,
/// operator weights, PRNG); the executor is the only seam to the outside
/// world, which keeps the whole loop deterministic under a fixed seed and
/// a scripted executor.
pub struct Engine<E: Executor> {
    settings: EngineSettings,
    plugin: Box<dyn FormatPlugin>,
    executor: E,
    campaign: Campaign,
    corpus: Corpus,
    global: GlobalCoverage,
    images: ImageTable,
    strategy: FuzzingStrategy,
    rng: ChaCha8Rng,
    generation: u64,
    consecutive_failures: u32,
    interrupt: Arc<AtomicBool>,
    stats: EngineStats,
    /// Uids in admission order; drives the determinism guarantee tests and
    /// the generation-boundary log line.
    admitted_log: Vec<u64>,
}

impl<E: Executor> Engine<E> {
    pub fn new(
        settings: EngineSettings,
        weights: &WeightSettings,
        plugin: Box<dyn FormatPlugin>,
        executor: E,
        campaign: Campaign,
    ) -> Self {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&settings.seed.to_le_bytes());
        let strategy = FuzzingStrategy::new(settings.p_recomb, settings.alpha, settings.min_weight)
            .with_initial_weights(&weights.mutators, &weights.recombinators);
        Engine {
            corpus: Corpus::new(settings.population_cap),
            global: GlobalCoverage::new(),
            images: ImageTable::new(),
            strategy,
            rng: ChaCha8Rng::from_seed(seed),
            generation: 0,
            consecutive_failures: 0,
            interrupt: Arc::new(AtomicBool::new(false)),
            stats: EngineStats::default(),
            admitted_log: Vec::new(),
            settings,
            plugin,
            executor,
            campaign,
        }
    }

    /// Flag a campaign-level interrupt handler can set; the engine finishes
    /// the current trial, flushes a checkpoint and returns.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn admitted_uids(&self) -> &[u64] {
        &self.admitted_log
    }

    /// Parses and executes every seed under `path` (a file or a flat
    /// directory). Seeds that fail to parse are logged and skipped; a
    /// campaign with zero valid seeds cannot start.
    pub fn load_seeds(&mut self, path: &Path) -> Result<usize, EngineError> {
        let mut files = Vec::new();
        if path.is_file() {
            files.push(path.to_path_buf());
        } else if path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let p = entry?.path();
                if p.is_file() {
                    files.push(p);
                }
            }
            files.sort();
        }

        let mut loaded = 0;
        for file in files {
            let bytes = std::fs::read(&file)?;
            let tree = match self.plugin.deserialize(&bytes) {
                Ok(tree) => tree,
                Err(e) => {
                    log::warn!("skipping seed {file:?}: {e}");
                    continue;
                }
            };
            let uid = self.rng.next_u64();
            let chromosome = Chromosome::from_seed(tree, uid);
            log::info!("seed {file:?} parsed as uid {uid:#018x}");
            self.evaluate(chromosome, bytes)?;
            loaded += 1;
        }
        if loaded == 0 {
            return Err(EngineError::NoValidSeeds(path.to_path_buf()));
        }
        Ok(loaded)
    }

    /// Restores the latest checkpoint. Returns false when none exists.
    pub fn resume(&mut self) -> Result<bool, EngineError> {
        match self.campaign.load_checkpoint(self.plugin.as_ref())? {
            Some(checkpoint) => {
                self.corpus = checkpoint.corpus;
                self.global = checkpoint.global;
                self.rng = checkpoint.rng;
                self.generation = checkpoint.generation;
                log::info!(
                    "resumed at generation {} with {} members, {} crash sites",
                    self.generation,
                    self.corpus.len(),
                    self.corpus.crashes().len()
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs generations until the cap is reached or an interrupt arrives.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        loop {
            if self
                .settings
                .generation_cap
                .is_some_and(|cap| self.generation >= cap)
            {
                return Ok(RunOutcome::Completed);
            }

            for _ in 0..self.settings.trials_per_generation {
                if self.interrupt.load(Ordering::SeqCst) {
                    break;
                }
                self.run_trial()?;
            }

            self.generation += 1;
            self.checkpoint()?;
            log::info!(
                "generation {} done: {} trials, {} admitted, {} crashes, corpus {}",
                self.generation,
                self.stats.trials,
                self.stats.admitted,
                self.stats.crashes,
                self.corpus.len()
            );

            if self.interrupt.load(Ordering::SeqCst) {
                return Ok(RunOutcome::Interrupted);
            }
        }
    }

    /// Re-executes a checkpointed corpus member and reports its trace. The
    /// corpus and coverage map are left untouched.
    pub fn replay(&mut self, uid: u64) -> Result<TrialTrace, EngineError> {
        let bytes = self.campaign.member_bytes(uid)?;
        self.executor
            .execute(&bytes, &mut self.images)
            .map_err(EngineError::Trial)
    }

    fn checkpoint(&self) -> Result<(), CampaignError> {
        self.campaign
            .write_checkpoint(&self.corpus, &self.global, &self.rng, self.generation)
    }

    /// One full trial. Non-fatal failures (no admissible variation, broken
    /// serialization, a tracer hiccup within budget) discard the trial and
    /// return `Ok`.
    fn run_trial(&mut self) -> Result<(), EngineError> {
        self.stats.trials += 1;

        let Some((tree, op, parents, noops)) = self.vary() else {
            self.stats.noop_trials += 1;
            log::info!("trial discarded: no admissible variation found");
            return Ok(());
        };

        let uid = self.rng.next_u64();
        let mut chromosome = Chromosome::offspring(tree, uid, parents, self.generation);
        chromosome.lineage = noops;
        chromosome.lineage.push(op.name().to_string());

        let bytes = match self.plugin.serialize(&chromosome.tree) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.strategy.penalize(op);
                self.stats.discarded += 1;
                log::info!("trial {uid:#018x} discarded: serialization failed: {e}");
                return Ok(());
            }
        };

        if self.corpus.contains_bytes(&bytes) {
            self.stats.discarded += 1;
            log::info!("trial {uid:#018x} discarded: duplicate of a corpus member");
            return Ok(());
        }

        match self.evaluate(chromosome, bytes)? {
            Some(Admission::Rejected(reason)) => {
                self.stats.discarded += 1;
                log::info!("trial {uid:#018x} discarded: {reason:?}");
            }
            Some(_) => self.strategy.reward(op),
            None => {} // tracer failure, already logged
        }
        Ok(())
    }

    /// Executes `bytes` and runs the admission rules. `Ok(None)` means the
    /// tracer failed and the trial taught us nothing.
    fn evaluate(
        &mut self,
        chromosome: Chromosome,
        bytes: Vec<u8>,
    ) -> Result<Option<Admission>, EngineError> {
        let uid = chromosome.uid;
        let trace = match self.executor.execute(&bytes, &mut self.images) {
            Ok(trace) => trace,
            Err(e @ ExecError::Spawn { .. }) => return Err(EngineError::Spawn(e)),
            Err(e) => {
                self.tracer_failure(format!("trial {uid:#018x}: {e}"))?;
                return Ok(None);
            }
        };

        if trace.termination == TerminationReason::TracerError {
            self.tracer_failure(format!(
                "trial {uid:#018x}: stream ended without a sentinel"
            ))?;
            return Ok(None);
        }
        self.consecutive_failures = 0;

        if trace.termination.is_fatal() {
            log::warn!("trial {uid:#018x} crashed: {}", trace.termination);
        }

        let verdict = self.corpus.admit(
            chromosome,
            bytes,
            trace.coverage,
            trace.termination,
            trace.last_hit,
            &CoverageSet::new(),
            &mut self.global,
        );
        if verdict.admitted() {
            self.stats.admitted += 1;
            self.admitted_log.push(uid);
            if let Admission::Crash { site } = verdict {
                self.stats.crashes += 1;
                log::warn!("crash site ({}, {:#x}) recorded for {uid:#018x}", site.0, site.1);
            }
        }
        Ok(Some(verdict))
    }

    fn tracer_failure(&mut self, what: String) -> Result<(), EngineError> {
        self.consecutive_failures += 1;
        self.stats.discarded += 1;
        log::warn!(
            "{what} ({} consecutive tracer failures)",
            self.consecutive_failures
        );
        if self.consecutive_failures > self.settings.failure_budget {
            return Err(EngineError::FailureBudgetExceeded(
                self.consecutive_failures,
            ));
        }
        Ok(())
    }

    /// Picks operators until one produces an actual edit, recording no-op
    /// applications for the child's provenance. Gives up after the
    /// configured retry budget.
    fn vary(&mut self) -> Option<(GeneTree, VariationOp, Vec<u64>, Vec<String>)> {
        let mut noops = Vec::new();
        let mut tried: Vec<&'static str> = Vec::new();

        for _ in 0..=self.settings.noop_retries {
            let op = self.strategy.pick(&mut self.rng);
            if tried.contains(&op.name()) {
                continue;
            }
            tried.push(op.name());

            let (uid_a, tree_a) = self.tournament_select()?;
            let mut parents = vec![uid_a];

            let produced = match op {
                VariationOp::Mutate(m) => {
                    m.apply(&mut self.rng, &tree_a, self.settings.mutation_budget)
                }
                VariationOp::Recombine(r) => {
                    let second = if r.is_binary() {
                        let (uid_b, tree_b) = self.tournament_select()?;
                        parents.push(uid_b);
                        Some(tree_b)
                    } else {
                        None
                    };
                    r.apply(&mut self.rng, &tree_a, second.as_ref(), self.plugin.as_ref())
                }
            };

            match produced {
                Some(tree) => return Some((tree, op, parents, noops)),
                None => noops.push(format!("noop:{}", op.name())),
            }
        }
        None
    }

    /// Tournament-of-k parent selection: k uniform picks, keep the fittest.
    fn tournament_select(&mut self) -> Option<(u64, GeneTree)> {
        if self.corpus.is_empty() {
            return None;
        }
        let len = self.corpus.len();
        let mut best: Option<usize> = None;
        for _ in 0..self.settings.k_tournament {
            let candidate = self.rng.random_range(0..len);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let members = self.corpus.members();
                    if members[candidate].chromosome.fitness > members[current].chromosome.fitness {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        let member = &self.corpus.members()[best?];
        Some((member.chromosome.uid, member.chromosome.tree.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::coverage::TracerError;
    use crate::format::{ParseError, SerializeError};
    use crate::gene::{Gene, GeneFlags, GeneKind};
    use tempfile::tempdir;

    const ROOT: GeneKind = GeneKind::from_tag(*b"ROOT");
    const DATA: GeneKind = GeneKind::from_tag(*b"DATA");

    /// Byte stream = sequence of length-prefixed structural leaves. Simple
    /// enough to survive arbitrary structural edits.
    struct ChunkPlugin;

    impl FormatPlugin for ChunkPlugin {
        fn name(&self) -> &'static str {
            "chunk"
        }
        fn deserialize(&self, bytes: &[u8]) -> Result<GeneTree, ParseError> {
            let mut tree =
                GeneTree::new(Gene::internal(ROOT, Vec::new(), GeneFlags::default()));
            let mut offset = 0;
            while offset < bytes.len() {
                let len = bytes[offset] as usize;
                let start = offset + 1;
                let end = start + len;
                if end > bytes.len() {
                    return Err(ParseError::Truncated {
                        offset,
                        needed: end - bytes.len(),
                    });
                }
                tree.push_child(
                    tree.root_id(),
                    Gene::leaf(
                        DATA,
                        bytes[start..end].to_vec(),
                        GeneFlags {
                            structural: true,
                            ..Default::default()
                        },
                    ),
                )
                .expect("root accepts children");
                offset = end;
            }
            if tree.root().child_count() == 0 {
                return Err(ParseError::Malformed("empty input".into()));
            }
            Ok(tree)
        }
        fn serialize(&self, tree: &GeneTree) -> Result<Vec<u8>, SerializeError> {
            let mut out = Vec::new();
            for &id in tree.root().child_ids() {
                let payload = &tree.gene(id).payload;
                if payload.len() > 255 {
                    return Err(SerializeError::Invalid("chunk too long".into()));
                }
                out.push(payload.len() as u8);
                out.extend_from_slice(payload);
            }
            Ok(out)
        }
        fn admissible(&self, parent: GeneKind, child: GeneKind, _position: usize) -> bool {
            parent == ROOT && child == DATA
        }
    }

    /// Deterministic fake tracer: coverage is derived from the input's md5,
    /// so equal inputs produce equal traces and runs are reproducible.
    struct HashingExecutor {
        termination: TerminationReason,
    }

    impl HashingExecutor {
        fn normal() -> Self {
            HashingExecutor {
                termination: TerminationReason::Normal,
            }
        }
    }

    impl Executor for HashingExecutor {
        fn execute(
            &mut self,
            input: &[u8],
            _images: &mut ImageTable,
        ) -> Result<TrialTrace, ExecError> {
            let digest = md5::compute(input).0;
            let coverage: CoverageSet = digest
                .chunks(4)
                .map(|c| (0u16, u64::from(c[0]) | (u64::from(c[1]) << 8)))
                .collect();
            let last_hit = coverage.iter().next_back().copied();
            Ok(TrialTrace {
                coverage,
                termination: self.termination,
                last_hit,
            })
        }
    }

    struct FailingExecutor;

    impl Executor for FailingExecutor {
        fn execute(
            &mut self,
            _input: &[u8],
            _images: &mut ImageTable,
        ) -> Result<TrialTrace, ExecError> {
            Err(ExecError::Tracer(TracerError::BadHeader(
                "scripted failure".into(),
            )))
        }
    }

    fn settings(seed: u64) -> EngineSettings {
        EngineSettings {
            population_cap: 16,
            trials_per_generation: 25,
            generation_cap: Some(2),
            seed,
            failure_budget: 3,
            ..Default::default()
        }
    }

    fn engine_with<EX: Executor>(
        dir: &Path,
        executor: EX,
        settings: EngineSettings,
    ) -> Engine<EX> {
        let campaign = Campaign::init(&dir.join("run")).unwrap();
        Engine::new(
            settings,
            &WeightSettings::default(),
            Box::new(ChunkPlugin),
            executor,
            campaign,
        )
    }

    fn write_seeds(dir: &Path) -> PathBuf {
        let seeds = dir.join("seeds");
        std::fs::create_dir_all(&seeds).unwrap();
        std::fs::write(seeds.join("a.bin"), [3, 1, 2, 3, 2, 9, 9]).unwrap();
        std::fs::write(seeds.join("b.bin"), [4, 7, 7, 7, 7]).unwrap();
        std::fs::write(seeds.join("broken.bin"), [250, 0]).unwrap(); // truncated
        seeds
    }

    #[test]
    fn seeds_are_parsed_executed_and_admitted() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), HashingExecutor::normal(), settings(1));
        let seeds = write_seeds(dir.path());
        let loaded = engine.load_seeds(&seeds).unwrap();
        assert_eq!(loaded, 2, "the truncated seed is skipped");
        assert_eq!(engine.corpus().len(), 2);
        assert!(engine.corpus().best().unwrap().chromosome.executed);
    }

    #[test]
    fn an_all_invalid_seed_directory_is_fatal() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), HashingExecutor::normal(), settings(1));
        let seeds = dir.path().join("seeds");
        std::fs::create_dir_all(&seeds).unwrap();
        std::fs::write(seeds.join("broken.bin"), [99, 0]).unwrap();
        assert!(matches!(
            engine.load_seeds(&seeds),
            Err(EngineError::NoValidSeeds(_))
        ));
    }

    #[test]
    fn fixed_seed_runs_admit_identical_uid_sequences() {
        let run = |seed: u64| {
            let dir = tempdir().unwrap();
            let mut engine = engine_with(dir.path(), HashingExecutor::normal(), settings(seed));
            let seeds = write_seeds(dir.path());
            engine.load_seeds(&seeds).unwrap();
            engine.run().unwrap();
            engine.admitted_uids().to_vec()
        };
        let first = run(7);
        let second = run(7);
        assert_eq!(first, second, "same seed must reproduce the same run");
        assert!(
            first.len() >= 2,
            "seed admissions must appear in the log ({first:?})"
        );

        let other = run(8);
        assert_ne!(first, other, "different seeds should diverge");
    }

    #[test]
    fn run_honors_the_generation_cap_and_checkpoints() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), HashingExecutor::normal(), settings(3));
        let seeds = write_seeds(dir.path());
        engine.load_seeds(&seeds).unwrap();
        let outcome = engine.run().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(engine.stats().trials, 50, "2 generations x 25 trials");
        assert!(dir.path().join("run/corpus/index.json").is_file());
        assert!(dir.path().join("run/coverage.map").is_file());
        assert!(dir.path().join("run/prng.state").is_file());
    }

    #[test]
    fn resume_restores_the_checkpointed_state() {
        let dir = tempdir().unwrap();
        let seeds = write_seeds(dir.path());
        let (members, generation) = {
            let mut engine = engine_with(dir.path(), HashingExecutor::normal(), settings(5));
            engine.load_seeds(&seeds).unwrap();
            engine.run().unwrap();
            (
                engine.corpus().len(),
                2u64, // generation cap from settings()
            )
        };

        let campaign = Campaign::open(&dir.path().join("run")).unwrap();
        let mut engine = Engine::new(
            settings(5),
            &WeightSettings::default(),
            Box::new(ChunkPlugin),
            HashingExecutor::normal(),
            campaign,
        );
        assert!(engine.resume().unwrap());
        assert_eq!(engine.corpus().len(), members);
        assert_eq!(engine.generation, generation);
    }

    #[test]
    fn interrupt_flushes_and_reports_interrupted() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            HashingExecutor::normal(),
            EngineSettings {
                generation_cap: None,
                ..settings(11)
            },
        );
        let seeds = write_seeds(dir.path());
        engine.load_seeds(&seeds).unwrap();
        engine.interrupt_flag().store(true, Ordering::SeqCst);
        let outcome = engine.run().unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(dir.path().join("run/corpus/index.json").is_file());
    }

    #[test]
    fn tracer_failures_past_the_budget_abort_the_run() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), FailingExecutor, settings(13));
        // Seed the corpus directly; the failing executor cannot.
        let tree = ChunkPlugin.deserialize(&[1, 5]).unwrap();
        engine.corpus.admit(
            Chromosome::from_seed(tree, 1),
            vec![1, 5],
            [(0u16, 1u64)].into_iter().collect(),
            TerminationReason::Normal,
            Some((0, 1)),
            &CoverageSet::new(),
            &mut engine.global,
        );
        match engine.run() {
            Err(EngineError::FailureBudgetExceeded(n)) => assert_eq!(n, 4),
            other => panic!("expected FailureBudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn timeouts_are_admitted_only_with_novel_coverage() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            HashingExecutor {
                termination: TerminationReason::Timeout,
            },
            settings(17),
        );
        let seeds = write_seeds(dir.path());
        // Seeds time out but carry novel blocks, so they are admitted.
        engine.load_seeds(&seeds).unwrap();
        let after_seeds = engine.stats().admitted;
        assert_eq!(after_seeds, 2);

        engine.run().unwrap();
        // The fitness-only admission path is closed to timeouts, so every
        // run-time admission must carry at least one previously unseen
        // block in its credited coverage.
        for member in engine.corpus().members() {
            assert!(member.chromosome.executed);
            assert!(!member.coverage.is_empty());
        }
        assert_eq!(engine.stats().trials, 50);
    }

    #[test]
    fn crashing_trials_are_recorded_and_counted() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            HashingExecutor {
                termination: TerminationReason::FatalSignal(11),
            },
            EngineSettings {
                generation_cap: Some(1),
                trials_per_generation: 5,
                ..settings(19)
            },
        );
        let seeds = write_seeds(dir.path());
        engine.load_seeds(&seeds).unwrap();
        engine.run().unwrap();
        assert!(engine.stats().crashes > 0);
        assert!(!engine.corpus().crashes().is_empty());
        // Crash files land in the run directory at the checkpoint.
        let crash_dir = dir.path().join("run/crashes");
        assert!(std::fs::read_dir(crash_dir).unwrap().next().is_some());
    }
}
