//! Launching and controlling simulator subprocesses.
//!
//! Simulators that shell out to an external application receive a
//! [`Launcher`] handle through their calculation context; there is no
//! process-global launcher slot. The shipped launcher wraps the
//! application in an MPI-style runner command line and spawns it locally.

pub mod mpi;

use crate::registry::WorkerId;
use mpi::MpiRunner;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lifecycle of one launched job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Unknown,
    Created,
    Waiting,
    Running,
    Finished,
    UserKilled,
    Failed,
}

#[derive(Debug)]
pub enum LaunchError {
    /// The resource request is inconsistent or empty.
    BadResources(String),
    Io(io::Error),
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadResources(msg) => write!(f, "bad resource request: {}", msg),
            Self::Io(err) => write!(f, "launch failed: {}", err),
        }
    }
}

impl std::error::Error for LaunchError {}

impl From<io::Error> for LaunchError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A request to run one application.
#[derive(Clone, Debug, Default)]
pub struct JobSpec {
    pub app: PathBuf,
    pub app_args: Vec<String>,
    pub num_procs: Option<usize>,
    pub num_nodes: Option<usize>,
    pub ranks_per_node: Option<usize>,
    pub machinefile: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    /// Stdout file name; defaults to `<job name>.out` in the workdir.
    pub stdout: Option<String>,
}

impl JobSpec {
    pub fn new(app: impl Into<PathBuf>) -> Self {
        Self {
            app: app.into(),
            ..Self::default()
        }
    }
}

/// One launched job: state, exit code, and the owned child process.
///
/// Dropping a job that is still running kills and reaps it, so a worker
/// never leaves a subprocess behind when its callback returns.
#[derive(Debug)]
pub struct Job {
    pub id: usize,
    pub name: String,
    pub state: JobState,
    pub errcode: Option<i32>,
    /// The job has run, successfully or not.
    pub finished: bool,
    pub success: bool,
    pub stdout: PathBuf,
    pub workdir: Option<PathBuf>,
    child: Option<Child>,
}

impl Job {
    /// Refresh `state` from the child without blocking.
    pub fn poll(&mut self) -> JobState {
        if self.finished {
            return self.state;
        }
        let status = match &mut self.child {
            Some(child) => child.try_wait(),
            None => return self.state,
        };
        match status {
            Ok(Some(exit)) => {
                self.finished = true;
                self.errcode = exit.code();
                self.success = exit.success();
                self.state = if exit.success() {
                    JobState::Finished
                } else {
                    JobState::Failed
                };
            }
            Ok(None) => self.state = JobState::Running,
            Err(_) => self.state = JobState::Unknown,
        }
        self.state
    }

    /// Block until the job exits; returns its exit code when there is one.
    pub fn wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(child) = &mut self.child {
            let exit = child.wait()?;
            self.finished = true;
            self.errcode = exit.code();
            self.success = exit.success();
            self.state = if exit.success() {
                JobState::Finished
            } else {
                JobState::Failed
            };
        }
        Ok(self.errcode)
    }

    /// Terminate the job and reap it.
    pub fn kill(&mut self) -> io::Result<()> {
        if let Some(child) = &mut self.child {
            if !self.finished {
                child.kill()?;
                let _ = child.wait();
                self.finished = true;
                self.success = false;
                self.state = JobState::UserKilled;
            }
        }
        Ok(())
    }

    pub fn workdir_exists(&self) -> bool {
        self.workdir.as_deref().map(Path::exists).unwrap_or(false)
    }

    pub fn file_exists_in_workdir(&self, filename: &str) -> bool {
        self.workdir
            .as_deref()
            .map(|d| d.join(filename).exists())
            .unwrap_or(false)
    }

    pub fn read_file_in_workdir(&self, filename: &str) -> io::Result<String> {
        let dir = self.workdir.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "job has no working directory")
        })?;
        std::fs::read_to_string(dir.join(filename))
    }

    pub fn stdout_exists(&self) -> bool {
        self.stdout.exists()
    }

    pub fn read_stdout(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.stdout)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

/// Launches jobs on behalf of simulator callbacks.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: JobSpec, worker_id: WorkerId) -> Result<Job, LaunchError>;
}

/// Resolve a partial `num_procs`/`num_nodes`/`ranks_per_node` request into
/// a full, consistent one.
pub fn job_partition(
    num_procs: Option<usize>,
    num_nodes: Option<usize>,
    ranks_per_node: Option<usize>,
) -> Result<(usize, usize, usize), LaunchError> {
    match (num_procs, num_nodes, ranks_per_node) {
        (None, None, None) => Err(LaunchError::BadResources(
            "need num_procs, num_nodes, or ranks_per_node".into(),
        )),
        (Some(p), None, None) => Ok((p, 1, p)),
        (None, Some(n), Some(r)) => Ok((n * r, n, r)),
        (Some(p), Some(n), None) => {
            if p % n != 0 {
                return Err(LaunchError::BadResources(format!(
                    "{} procs do not divide over {} nodes",
                    p, n
                )));
            }
            Ok((p, n, p / n))
        }
        (Some(p), None, Some(r)) => {
            if p % r != 0 {
                return Err(LaunchError::BadResources(format!(
                    "{} procs do not divide into ranks of {}",
                    p, r
                )));
            }
            Ok((p, p / r, r))
        }
        (None, Some(n), None) => Ok((n, n, 1)),
        (None, None, Some(r)) => Ok((r, 1, r)),
        (Some(p), Some(n), Some(r)) => {
            if p != n * r {
                return Err(LaunchError::BadResources(format!(
                    "num_procs {} != num_nodes {} * ranks_per_node {}",
                    p, n, r
                )));
            }
            Ok((p, n, r))
        }
    }
}

/// Spawns MPI-runner-wrapped applications as local subprocesses.
pub struct LocalLauncher {
    runner: MpiRunner,
    next_id: AtomicUsize,
}

impl LocalLauncher {
    pub fn new(runner: MpiRunner) -> Self {
        Self {
            runner,
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self::new(MpiRunner::Mpich)
    }
}

impl Launcher for LocalLauncher {
    fn launch(&self, spec: JobSpec, worker_id: WorkerId) -> Result<Job, LaunchError> {
        let (procs, nodes, ppn) = job_partition(
            spec.num_procs,
            spec.num_nodes,
            spec.ranks_per_node,
        )?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let app_stem = spec
            .app
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        let name = format!("job_{}_worker{}_{}", app_stem, worker_id, id);

        let stdout_name = spec.stdout.clone().unwrap_or_else(|| format!("{}.out", name));
        let stdout_path = match &spec.workdir {
            Some(dir) => dir.join(&stdout_name),
            None => PathBuf::from(&stdout_name),
        };
        let stdout_file = File::create(&stdout_path)?;

        let mut command = Command::new(self.runner.run_command());
        command.args(self.runner.args(procs, nodes, ppn, spec.machinefile.as_deref()));
        command.arg(&spec.app);
        command.args(&spec.app_args);
        command.stdout(Stdio::from(stdout_file));
        if let Some(dir) = &spec.workdir {
            command.current_dir(dir);
        }
        let child = command.spawn()?;

        Ok(Job {
            id,
            name,
            state: JobState::Running,
            errcode: None,
            finished: false,
            success: false,
            stdout: stdout_path,
            workdir: spec.workdir,
            child: Some(child),
        })
    }
}
