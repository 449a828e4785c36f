use crate::corpus::{Corpus, CorpusMember, CrashRecord};
use crate::coverage::{BasicBlock, CoverageSet, GlobalCoverage};
use crate::format::FormatPlugin;
use crate::gene::Chromosome;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("campaign I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("run directory {0:?} holds no campaign (run `init` first)")]
    NotInitialized(PathBuf),

    #[error("run directory {0:?} already holds a campaign")]
    AlreadyInitialized(PathBuf),

    #[error("corpus index is corrupt: {0}")]
    Index(#[from] serde_json::Error),

    #[error("prng state blob is corrupt: {0}")]
    PrngState(String),

    #[error("checkpointed member {uid:#018x} no longer parses: {reason}")]
    MemberReparse { uid: u64, reason: String },

    #[error("no corpus member with uid {0:#018x}")]
    UnknownMember(u64),
}

/// Owns the run directory and everything persisted into it:
///
/// ```text
/// <dir>/corpus/<uid>.bin   serialized chromosome bytes
/// <dir>/corpus/index.json  per-member metadata + crash index
/// <dir>/coverage.map       (image u64, bbl u64, count u64) LE records
/// <dir>/prng.state         opaque PRNG state blob
/// <dir>/crashes/<image>_<bbl>.bin
/// <dir>/input.bin          stable per-trial input path
/// <dir>/trace.pipe         per-trial FIFO
/// ```
pub struct Campaign {
    dir: PathBuf,
}

/// Everything a checkpoint restores.
pub struct Checkpoint {
    pub corpus: Corpus,
    pub global: GlobalCoverage,
    pub rng: ChaCha8Rng,
    pub generation: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexDoc {
    cap: usize,
    next_seq: u64,
    generation: u64,
    members: Vec<IndexEntry>,
    crashes: Vec<CrashEntry>,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    uid: u64,
    parents: Vec<u64>,
    generation: u64,
    lineage: Vec<String>,
    fitness: f64,
    executed: bool,
    seq: u64,
    coverage: Vec<BasicBlock>,
}

#[derive(Serialize, Deserialize)]
struct CrashEntry {
    image: u16,
    bbl: u64,
    code: u64,
    uid: u64,
}

fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl Campaign {
    const INDEX: &'static str = "index.json";
    const COVERAGE_MAP: &'static str = "coverage.map";
    const PRNG_STATE: &'static str = "prng.state";

    /// Prepares a fresh run directory. Fails if one is already there.
    pub fn init(dir: &Path) -> Result<Self, CampaignError> {
        let corpus_dir = dir.join("corpus");
        if corpus_dir.exists() {
            return Err(CampaignError::AlreadyInitialized(dir.to_path_buf()));
        }
        fs::create_dir_all(&corpus_dir)?;
        fs::create_dir_all(dir.join("crashes"))?;
        Ok(Campaign {
            dir: dir.to_path_buf(),
        })
    }

    /// Opens an existing run directory.
    pub fn open(dir: &Path) -> Result<Self, CampaignError> {
        if !dir.join("corpus").is_dir() {
            return Err(CampaignError::NotInitialized(dir.to_path_buf()));
        }
        Ok(Campaign {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The stable path trial inputs are written to.
    pub fn input_path(&self) -> PathBuf {
        self.dir.join("input.bin")
    }

    /// The per-trial coverage FIFO.
    pub fn fifo_path(&self) -> PathBuf {
        self.dir.join("trace.pipe")
    }

    fn corpus_dir(&self) -> PathBuf {
        self.dir.join("corpus")
    }

    fn crashes_dir(&self) -> PathBuf {
        self.dir.join("crashes")
    }

    fn member_path(&self, uid: u64) -> PathBuf {
        self.corpus_dir().join(format!("{uid:016x}.bin"))
    }

    fn crash_path(&self, site: BasicBlock) -> PathBuf {
        self.crashes_dir().join(format!("{}_{}.bin", site.0, site.1))
    }

    /// Serialized bytes of a checkpointed corpus member, for `replay`.
    pub fn member_bytes(&self, uid: u64) -> Result<Vec<u8>, CampaignError> {
        let path = self.member_path(uid);
        if !path.is_file() {
            return Err(CampaignError::UnknownMember(uid));
        }
        Ok(fs::read(path)?)
    }

    /// Writes the generation-boundary checkpoint: every member's bytes, the
    /// JSON index, the coverage map, the PRNG state and crash files.
    pub fn write_checkpoint(
        &self,
        corpus: &Corpus,
        global: &GlobalCoverage,
        rng: &ChaCha8Rng,
        generation: u64,
    ) -> Result<(), CampaignError> {
        let mut live = Vec::new();
        for member in corpus.members() {
            let path = self.member_path(member.chromosome.uid);
            fs::write(&path, &member.bytes)?;
            live.push(path);
        }

        // Drop .bin files of evicted members so the directory mirrors the
        // live corpus.
        for entry in fs::read_dir(self.corpus_dir())? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "bin") && !live.contains(&path) {
                fs::remove_file(&path)?;
            }
        }

        for (site, crash) in corpus.crashes() {
            let path = self.crash_path(*site);
            if !path.exists() {
                fs::write(&path, &crash.bytes)?;
            }
        }

        let doc = IndexDoc {
            cap: corpus.cap(),
            next_seq: corpus.next_seq(),
            generation,
            members: corpus
                .members()
                .iter()
                .map(|m| IndexEntry {
                    uid: m.chromosome.uid,
                    parents: m.chromosome.parents.clone(),
                    generation: m.chromosome.generation,
                    lineage: m.chromosome.lineage.clone(),
                    fitness: m.chromosome.fitness,
                    executed: m.chromosome.executed,
                    seq: m.seq,
                    coverage: m.coverage.iter().copied().collect(),
                })
                .collect(),
            crashes: corpus
                .crashes()
                .iter()
                .map(|(site, crash)| CrashEntry {
                    image: site.0,
                    bbl: site.1,
                    code: crash.code,
                    uid: crash.uid,
                })
                .collect(),
        };
        let index = File::create(self.corpus_dir().join(Self::INDEX))?;
        serde_json::to_writer_pretty(BufWriter::new(index), &doc)?;

        let mut map = BufWriter::new(File::create(self.dir.join(Self::COVERAGE_MAP))?);
        global.write_to(&mut map)?;
        map.flush()?;

        let blob = bincode::serde::encode_to_vec(rng, bincode_config())
            .map_err(|e| CampaignError::PrngState(e.to_string()))?;
        fs::write(self.dir.join(Self::PRNG_STATE), blob)?;
        Ok(())
    }

    /// Restores the latest checkpoint, re-parsing each member's bytes with
    /// the format plug-in to rebuild its gene tree. Returns `None` when no
    /// checkpoint has been written yet.
    pub fn load_checkpoint(
        &self,
        plugin: &dyn FormatPlugin,
    ) -> Result<Option<Checkpoint>, CampaignError> {
        let index_path = self.corpus_dir().join(Self::INDEX);
        if !index_path.is_file() {
            return Ok(None);
        }
        let doc: IndexDoc = serde_json::from_reader(BufReader::new(File::open(index_path)?))?;

        let mut members = Vec::with_capacity(doc.members.len());
        for entry in doc.members {
            let bytes = self.member_bytes(entry.uid)?;
            let tree = plugin
                .deserialize(&bytes)
                .map_err(|e| CampaignError::MemberReparse {
                    uid: entry.uid,
                    reason: e.to_string(),
                })?;
            members.push(CorpusMember {
                chromosome: Chromosome {
                    tree,
                    uid: entry.uid,
                    parents: entry.parents,
                    generation: entry.generation,
                    lineage: entry.lineage,
                    fitness: entry.fitness,
                    executed: entry.executed,
                },
                bytes,
                coverage: entry.coverage.into_iter().collect::<CoverageSet>(),
                seq: entry.seq,
            });
        }

        let mut crashes = BTreeMap::new();
        for entry in doc.crashes {
            let site = (entry.image, entry.bbl);
            let bytes = fs::read(self.crash_path(site))?;
            crashes.insert(
                site,
                CrashRecord {
                    uid: entry.uid,
                    bytes,
                    code: entry.code,
                },
            );
        }

        let corpus = Corpus::from_parts(doc.cap, doc.next_seq, members, crashes);

        let map_path = self.dir.join(Self::COVERAGE_MAP);
        let global = if map_path.is_file() {
            GlobalCoverage::read_from(&mut BufReader::new(File::open(map_path)?))?
        } else {
            GlobalCoverage::new()
        };

        let blob = fs::read(self.dir.join(Self::PRNG_STATE))?;
        let (rng, _): (ChaCha8Rng, usize) =
            bincode::serde::decode_from_slice(&blob, bincode_config())
                .map_err(|e| CampaignError::PrngState(e.to_string()))?;

        Ok(Some(Checkpoint {
            corpus,
            global,
            rng,
            generation: doc.generation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::TerminationReason;
    use crate::format::{ParseError, SerializeError};
    use crate::gene::{Gene, GeneFlags, GeneKind, GeneTree};
    use rand_core::{RngCore, SeedableRng};
    use tempfile::tempdir;

    /// Whole file = one structural leaf under a root; serialize is the
    /// identity on the payload. Enough to exercise checkpoint re-parsing.
    struct RawPlugin;

    impl FormatPlugin for RawPlugin {
        fn name(&self) -> &'static str {
            "raw"
        }
        fn deserialize(&self, bytes: &[u8]) -> Result<GeneTree, ParseError> {
            let mut tree = GeneTree::new(Gene::internal(
                GeneKind::from_tag(*b"ROOT"),
                Vec::new(),
                GeneFlags::default(),
            ));
            tree.push_child(
                tree.root_id(),
                Gene::leaf(
                    GeneKind::from_tag(*b"DATA"),
                    bytes.to_vec(),
                    GeneFlags {
                        structural: true,
                        ..Default::default()
                    },
                ),
            )
            .expect("root is not a leaf");
            Ok(tree)
        }
        fn serialize(&self, tree: &GeneTree) -> Result<Vec<u8>, SerializeError> {
            Ok(tree
                .walk()
                .map(|(_, g)| g.payload.clone())
                .collect::<Vec<_>>()
                .concat())
        }
        fn admissible(&self, parent: GeneKind, _child: GeneKind, _position: usize) -> bool {
            parent == GeneKind::from_tag(*b"ROOT")
        }
    }

    fn seeded_corpus(global: &mut GlobalCoverage) -> Corpus {
        let plugin = RawPlugin;
        let mut corpus = Corpus::new(8);
        for (uid, bytes) in [(1u64, b"first".to_vec()), (2, b"second".to_vec())] {
            let tree = plugin.deserialize(&bytes).unwrap();
            let coverage: CoverageSet = [(0u16, uid * 16)].into_iter().collect();
            corpus.admit(
                Chromosome::from_seed(tree, uid),
                bytes,
                coverage,
                TerminationReason::Normal,
                Some((0, uid * 16)),
                &CoverageSet::new(),
                global,
            );
        }
        corpus
    }

    #[test]
    fn init_open_and_double_init() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("run");
        assert!(matches!(
            Campaign::open(&run),
            Err(CampaignError::NotInitialized(_))
        ));
        Campaign::init(&run).unwrap();
        assert!(run.join("corpus").is_dir());
        assert!(run.join("crashes").is_dir());
        assert!(matches!(
            Campaign::init(&run),
            Err(CampaignError::AlreadyInitialized(_))
        ));
        Campaign::open(&run).unwrap();
    }

    #[test]
    fn checkpoint_round_trips_corpus_coverage_and_prng() {
        let dir = tempdir().unwrap();
        let campaign = Campaign::init(dir.path().join("run").as_path()).unwrap();

        let mut global = GlobalCoverage::new();
        let corpus = seeded_corpus(&mut global);
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        rng.next_u64(); // advance so the state is not trivially the seed

        campaign
            .write_checkpoint(&corpus, &global, &rng, 3)
            .unwrap();

        let checkpoint = campaign
            .load_checkpoint(&RawPlugin)
            .unwrap()
            .expect("a checkpoint was written");

        assert_eq!(checkpoint.generation, 3);
        assert_eq!(checkpoint.corpus.len(), 2);
        assert_eq!(checkpoint.global.count((0, 16)), 1);
        assert_eq!(checkpoint.global.count((0, 32)), 1);
        // Dedup must be live again after reload.
        assert!(checkpoint.corpus.contains_bytes(b"first"));

        // The restored PRNG continues exactly where the checkpoint left it.
        let mut restored = checkpoint.rng;
        let mut original = rng;
        for _ in 0..8 {
            assert_eq!(restored.next_u64(), original.next_u64());
        }

        // Member trees were rebuilt through the plug-in.
        let member = checkpoint.corpus.member_by_uid(1).unwrap();
        assert_eq!(
            RawPlugin.serialize(&member.chromosome.tree).unwrap(),
            b"first"
        );
        assert_eq!(member.coverage.len(), 1);
    }

    #[test]
    fn checkpoint_prunes_evicted_member_files() {
        let dir = tempdir().unwrap();
        let campaign = Campaign::init(dir.path().join("run").as_path()).unwrap();
        let mut global = GlobalCoverage::new();
        let corpus = seeded_corpus(&mut global);
        let rng = ChaCha8Rng::from_seed([0; 32]);

        campaign.write_checkpoint(&corpus, &global, &rng, 0).unwrap();
        // A stale file from a member that no longer exists.
        fs::write(campaign.member_path(0xdead), b"stale").unwrap();
        campaign.write_checkpoint(&corpus, &global, &rng, 1).unwrap();
        assert!(!campaign.member_path(0xdead).exists());
        assert!(campaign.member_path(1).exists());
    }

    #[test]
    fn crash_files_are_written_once_and_kept() {
        let dir = tempdir().unwrap();
        let campaign = Campaign::init(dir.path().join("run").as_path()).unwrap();
        let mut global = GlobalCoverage::new();
        let mut corpus = Corpus::new(4);
        let plugin = RawPlugin;
        let bytes = b"crashing".to_vec();
        let tree = plugin.deserialize(&bytes).unwrap();
        corpus.admit(
            Chromosome::from_seed(tree, 7),
            bytes,
            [(0u16, 99u64)].into_iter().collect(),
            TerminationReason::FatalSignal(11),
            Some((0, 99)),
            &CoverageSet::new(),
            &mut global,
        );
        let rng = ChaCha8Rng::from_seed([0; 32]);
        campaign.write_checkpoint(&corpus, &global, &rng, 0).unwrap();

        let crash_file = campaign.crash_path((0, 99));
        assert!(crash_file.exists());
        assert_eq!(fs::read(&crash_file).unwrap(), b"crashing");

        let checkpoint = campaign.load_checkpoint(&plugin).unwrap().unwrap();
        assert_eq!(checkpoint.corpus.crashes().len(), 1);
        assert_eq!(checkpoint.corpus.crashes()[&(0, 99)].code, 11);
    }

    #[test]
    fn replay_bytes_come_from_the_member_file() {
        let dir = tempdir().unwrap();
        let campaign = Campaign::init(dir.path().join("run").as_path()).unwrap();
        let mut global = GlobalCoverage::new();
        let corpus = seeded_corpus(&mut global);
        let rng = ChaCha8Rng::from_seed([0; 32]);
        campaign.write_checkpoint(&corpus, &global, &rng, 0).unwrap();

        assert_eq!(campaign.member_bytes(2).unwrap(), b"second");
        assert!(matches!(
            campaign.member_bytes(0xbeef),
            Err(CampaignError::UnknownMember(_))
        ));
    }
}
