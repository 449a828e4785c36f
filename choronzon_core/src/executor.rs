use crate::coverage::{self, ImageTable, TracerError, TrialTrace};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Placeholder in the target command line replaced by the input path.
pub const INPUT_PLACEHOLDER: &str = "@@";

/// How often the stream reader polls a quiet pipe.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Error, Debug)]
pub enum ExecError {
    /// The target process could not be started at all. Persistent spawn
    /// failures are fatal to the campaign.
    #[error("failed to spawn target `{command}`: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },

    #[error("coverage stream error: {0}")]
    Tracer(#[from] TracerError),

    #[error("trial I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Runs one serialized input and reports the coverage it produced.
///
/// The trait is the seam between the generation scheduler and the outside
/// world; tests drive the scheduler with a scripted implementation instead
/// of a real target.
pub trait Executor {
    fn execute(&mut self, input: &[u8], images: &mut ImageTable) -> Result<TrialTrace, ExecError>;
}

/// Spawns the instrumented target per trial and drains the tracer's FIFO.
///
/// Per-trial sequence: write the input to its stable path, recreate the
/// FIFO, open the read end (non-blocking, before the target may run), spawn
/// the target, drain the stream while the target executes, then reap the
/// child and remove the FIFO. On a wall-clock timeout the tracer is sent
/// SIGUSR2 so it can flush its bucket and emit the timeout sentinel; after
/// a grace period the child is killed outright.
pub struct TargetExecutor {
    command: Vec<String>,
    input_path: PathBuf,
    fifo_path: PathBuf,
    timeout: Duration,
    grace: Duration,
}

impl TargetExecutor {
    pub fn new(
        command: Vec<String>,
        input_path: PathBuf,
        fifo_path: PathBuf,
        timeout: Duration,
        grace: Duration,
    ) -> Self {
        TargetExecutor {
            command,
            input_path,
            fifo_path,
            timeout,
            grace,
        }
    }

    /// The argv with `@@` placeholders substituted by the input path.
    fn argv(&self) -> Vec<String> {
        let input = self.input_path.to_string_lossy();
        self.command
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input))
            .collect()
    }

    fn spawn_target(&self, argv: &[String]) -> Result<Child, ExecError> {
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: argv.join(" "),
                source,
            })
    }

    fn recreate_fifo(&self) -> Result<(), ExecError> {
        match fs::remove_file(&self.fifo_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        mkfifo(&self.fifo_path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| ExecError::Io(io::Error::other(format!("mkfifo failed: {e}"))))?;
        Ok(())
    }

    fn reap(child: &mut Child) {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Executor for TargetExecutor {
    fn execute(&mut self, input: &[u8], images: &mut ImageTable) -> Result<TrialTrace, ExecError> {
        let argv = self.argv();
        fs::write(&self.input_path, input)?;
        self.recreate_fifo()?;

        // The read end must exist before the target runs; O_NONBLOCK makes
        // the open succeed without a connected writer.
        let pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc_o_nonblock())
            .open(&self.fifo_path)?;

        let mut child = self.spawn_target(&argv)?;
        let timed_out = Rc::new(Cell::new(false));

        let result = {
            let mut reader = StreamReader {
                pipe,
                child: &mut child,
                deadline: Instant::now() + self.timeout,
                grace: self.grace,
                timed_out: Rc::clone(&timed_out),
            };
            let flag = Rc::clone(&timed_out);
            coverage::ingest(&mut reader, images, move || flag.get())
        };

        Self::reap(&mut child);
        let _ = fs::remove_file(&self.fifo_path);

        match result {
            Ok(trace) => Ok(trace),
            // A target that hung before tracer startup produces no header
            // at all; when we raised the timeout ourselves that is a
            // timeout, not a broken tracer.
            Err(TracerError::BadHeader(_)) if timed_out.get() => Ok(TrialTrace {
                coverage: Default::default(),
                termination: coverage::TerminationReason::Timeout,
                last_hit: None,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn libc_o_nonblock() -> i32 {
    nix::fcntl::OFlag::O_NONBLOCK.bits()
}

/// Blocking-`Read` adapter over the non-blocking FIFO.
///
/// Polls the pipe while the child runs; enforces the trial deadline by
/// first signalling SIGUSR2 (tracer flushes and sends the sentinel) and,
/// when the grace period also lapses, reporting end-of-stream so ingest
/// can classify the trial. `Ok(0)` from a FIFO with no connected writer is
/// retried until the child exits, since the tracer may not have opened its
/// end yet.
struct StreamReader<'a> {
    pipe: File,
    child: &'a mut Child,
    deadline: Instant,
    grace: Duration,
    timed_out: Rc<Cell<bool>>,
}

impl StreamReader<'_> {
    /// Returns true when the stream should be treated as ended.
    fn on_quiet_pipe(&mut self) -> io::Result<bool> {
        if Instant::now() >= self.deadline {
            if self.timed_out.get() {
                // Grace period exhausted as well; stop waiting.
                let _ = self.child.kill();
                return Ok(true);
            }
            self.timed_out.set(true);
            self.deadline = Instant::now() + self.grace;
            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGUSR2).is_err() {
                // Child already gone; nothing will flush.
                return Ok(true);
            }
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
        Ok(false)
    }
}

impl Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.pipe.read(buf) {
                Ok(0) => {
                    // No writer on the FIFO: either the tracer has not
                    // connected yet, or it is done. The child's exit status
                    // disambiguates.
                    if self.child.try_wait()?.is_some() {
                        return Ok(0);
                    }
                    if self.on_quiet_pipe()? {
                        return Ok(0);
                    }
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.on_quiet_pipe()? {
                        return Ok(0);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
