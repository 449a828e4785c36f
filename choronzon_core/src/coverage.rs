use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Sentinel image index marking a termination record.
pub const SENTINEL_IMAGE: u64 = u64::MAX;

/// Sentinel code the tracer sends after a commanded timeout flush.
pub const TIMEOUT_CODE: u64 = 0xC;

/// Exception codes with the top two bits set are fatal on the non-POSIX
/// platform; plain values are POSIX signal numbers. Both are fatal.
pub const FATAL_EXCEPTION_MASK: u64 = 0xC000_0000;

/// One basic block: the image's stable index and the block's offset from
/// the image's load base. Offsets are reloc-independent.
pub type BasicBlock = (u16, u64);

/// The distinct basic blocks observed during one trial.
pub type CoverageSet = BTreeSet<BasicBlock>;

/// Why a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The target exited and the tracer sent no fault sentinel.
    Normal,
    /// The tracer reported a fatal signal or exception code.
    FatalSignal(u64),
    /// The trial hit its wall-clock budget.
    Timeout,
    /// The coverage stream ended without a sentinel and no timeout was
    /// raised. The trial's data is untrustworthy.
    TracerError,
}

impl TerminationReason {
    pub fn is_fatal(self) -> bool {
        matches!(self, TerminationReason::FatalSignal(_))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Normal => write!(f, "normal"),
            TerminationReason::Timeout => write!(f, "timeout"),
            TerminationReason::TracerError => write!(f, "tracer-error"),
            TerminationReason::FatalSignal(code) => {
                if code & FATAL_EXCEPTION_MASK == FATAL_EXCEPTION_MASK {
                    write!(f, "fatal exception {code:#010x}")
                } else {
                    write!(f, "fatal signal {code}")
                }
            }
        }
    }
}

/// Hard failures while consuming the coverage stream. Distinct from the
/// `TracerError` termination reason: these mean the stream was unusable
/// from the start (bad header, unknown image), not merely cut short.
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("malformed coverage stream header: {0}")]
    BadHeader(String),

    #[error("hit record references unknown image index {0}")]
    UnknownImage(u64),

    #[error("coverage stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// The campaign-wide table of instrumented images.
///
/// The tracer names its images in a startup header each trial; the engine
/// assigns each distinct name a stable 16-bit index the first time it
/// appears and keeps that index for the rest of the campaign, so coverage
/// keys stay comparable across trials.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ImageTable {
    names: Vec<String>,
}

impl ImageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: u16) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    /// Folds one trial's header names into the table, returning the
    /// stream-index → stable-index mapping for that trial.
    fn merge(&mut self, stream_names: Vec<String>) -> Vec<u16> {
        stream_names
            .into_iter()
            .map(|name| {
                if let Some(idx) = self.names.iter().position(|n| *n == name) {
                    idx as u16
                } else {
                    self.names.push(name);
                    (self.names.len() - 1) as u16
                }
            })
            .collect()
    }
}

/// The outcome of draining one trial's coverage stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialTrace {
    pub coverage: CoverageSet,
    pub termination: TerminationReason,
    /// The hit that arrived last, i.e. the faulting block when the stream
    /// ended in a fault sentinel. Crash sites are keyed by it.
    pub last_hit: Option<BasicBlock>,
}

/// Reads one trial's stream: the image header followed by 16-byte hit
/// records until a sentinel or end-of-stream.
///
/// `timed_out` reports whether the engine raised the out-of-band timeout
/// for this trial; it decides how a sentinel-less end-of-stream is
/// classified: timeout if raised, tracer error otherwise.
pub fn ingest<R: Read>(
    reader: &mut R,
    images: &mut ImageTable,
    timed_out: impl Fn() -> bool,
) -> Result<TrialTrace, TracerError> {
    let mapping = read_header(reader, images)?;
    let mut coverage = CoverageSet::new();
    let mut last_hit = None;

    let mut record = [0u8; 16];
    loop {
        match read_full(reader, &mut record)? {
            ReadOutcome::Eof | ReadOutcome::Short => {
                // Producer died (or was killed) before flushing a sentinel.
                let termination = if timed_out() {
                    TerminationReason::Timeout
                } else {
                    TerminationReason::TracerError
                };
                return Ok(TrialTrace {
                    coverage,
                    termination,
                    last_hit,
                });
            }
            ReadOutcome::Full => {}
        }

        let image_index = u64::from_le_bytes(record[..8].try_into().unwrap());
        let bbl = u64::from_le_bytes(record[8..].try_into().unwrap());

        if image_index == SENTINEL_IMAGE {
            let termination = if bbl == TIMEOUT_CODE {
                TerminationReason::Timeout
            } else {
                TerminationReason::FatalSignal(bbl)
            };
            return Ok(TrialTrace {
                coverage,
                termination,
                last_hit,
            });
        }

        let stable = *mapping
            .get(image_index as usize)
            .ok_or(TracerError::UnknownImage(image_index))?;
        coverage.insert((stable, bbl));
        last_hit = Some((stable, bbl));
    }
}

/// Parses the startup header: image count, then length-prefixed names.
fn read_header<R: Read>(reader: &mut R, images: &mut ImageTable) -> Result<Vec<u16>, TracerError> {
    let mut count = [0u8; 1];
    reader
        .read_exact(&mut count)
        .map_err(|e| TracerError::BadHeader(format!("missing image count: {e}")))?;

    let mut names = Vec::with_capacity(count[0] as usize);
    for i in 0..count[0] {
        let mut len = [0u8; 2];
        reader
            .read_exact(&mut len)
            .map_err(|e| TracerError::BadHeader(format!("missing name length for image {i}: {e}")))?;
        let mut name = vec![0u8; u16::from_le_bytes(len) as usize];
        reader
            .read_exact(&mut name)
            .map_err(|e| TracerError::BadHeader(format!("truncated name for image {i}: {e}")))?;
        names.push(String::from_utf8_lossy(&name).into_owned());
    }
    Ok(images.merge(names))
}

enum ReadOutcome {
    Full,
    Short,
    Eof,
}

/// `read_exact` that distinguishes a clean EOF from a torn trailing record.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, TracerError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Short
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ReadOutcome::Full)
}

/// Campaign-wide counts of how many admitted corpus members have hit each
/// basic block. Rare blocks weigh more in the fitness signal.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GlobalCoverage {
    counts: BTreeMap<BasicBlock, u64>,
}

impl GlobalCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, block: BasicBlock) -> u64 {
        self.counts.get(&block).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// `fitness(C) = Σ_{e ∈ C} 1 / (1 + G[e])`. New blocks contribute 1.0
    /// each; very common blocks contribute little.
    pub fn fitness_of(&self, coverage: &CoverageSet) -> f64 {
        coverage
            .iter()
            .map(|&block| 1.0 / (1.0 + self.count(block) as f64))
            .sum()
    }

    /// Whether `coverage` contains a block never seen campaign-wide.
    pub fn has_novelty(&self, coverage: &CoverageSet) -> bool {
        coverage.iter().any(|block| self.count(*block) == 0)
    }

    /// Bumps the counter for every block in `blocks`. Counters only ever
    /// grow; callers are responsible for not crediting the same corpus
    /// member twice (the scheduler credits blocks outside the admitted
    /// chromosome's recorded lineage coverage only).
    pub fn credit<'a>(&mut self, blocks: impl IntoIterator<Item = &'a BasicBlock>) {
        for &block in blocks {
            *self.counts.entry(block).or_insert(0) += 1;
        }
    }

    /// Writes the map as the persisted `(image u64, bbl u64, count u64)`
    /// little-endian record sequence.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for (&(image, bbl), &count) in &self.counts {
            writer.write_all(&(image as u64).to_le_bytes())?;
            writer.write_all(&bbl.to_le_bytes())?;
            writer.write_all(&count.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads the record sequence written by [`GlobalCoverage::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut counts = BTreeMap::new();
        let mut record = [0u8; 24];
        loop {
            match read_full(reader, &mut record) {
                Ok(ReadOutcome::Full) => {
                    let image = u64::from_le_bytes(record[..8].try_into().unwrap());
                    let bbl = u64::from_le_bytes(record[8..16].try_into().unwrap());
                    let count = u64::from_le_bytes(record[16..].try_into().unwrap());
                    counts.insert((image as u16, bbl), count);
                }
                Ok(ReadOutcome::Eof) => break,
                Ok(ReadOutcome::Short) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "torn coverage.map record",
                    ));
                }
                Err(TracerError::Io(e)) => return Err(e),
                Err(other) => return Err(io::Error::other(other.to_string())),
            }
        }
        Ok(GlobalCoverage { counts })
    }
}
