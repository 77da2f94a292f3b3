//! MPI-style runner command lines.
//!
//! Each variant expresses the same resource request in its runner's
//! argument dialect.

use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpiRunner {
    Mpich,
    OpenMpi,
    Aprun,
    Srun,
    Jsrun,
    Msmpi,
}

impl MpiRunner {
    pub fn run_command(&self) -> &'static str {
        match self {
            Self::Mpich | Self::OpenMpi => "mpirun",
            Self::Aprun => "aprun",
            Self::Srun => "srun",
            Self::Jsrun => "jsrun",
            Self::Msmpi => "mpiexec",
        }
    }

    /// Runner arguments for `procs` total ranks over `nodes` nodes at
    /// `ppn` ranks per node. A machinefile, where supported, replaces the
    /// node count.
    pub fn args(
        &self,
        procs: usize,
        nodes: usize,
        ppn: usize,
        machinefile: Option<&Path>,
    ) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Self::Mpich => {
                args.push("-np".into());
                args.push(procs.to_string());
                match machinefile {
                    Some(file) => {
                        args.push("-machinefile".into());
                        args.push(file.display().to_string());
                    }
                    None => {
                        args.push("--ppn".into());
                        args.push(ppn.to_string());
                    }
                }
            }
            Self::OpenMpi => {
                args.push("-np".into());
                args.push(procs.to_string());
                match machinefile {
                    Some(file) => {
                        args.push("-machinefile".into());
                        args.push(file.display().to_string());
                    }
                    None => {
                        args.push("-npernode".into());
                        args.push(ppn.to_string());
                    }
                }
            }
            Self::Aprun => {
                args.push("-n".into());
                args.push(procs.to_string());
                args.push("-N".into());
                args.push(ppn.to_string());
            }
            Self::Srun => {
                args.push("--ntasks".into());
                args.push(procs.to_string());
                args.push("--nodes".into());
                args.push(nodes.to_string());
                args.push("--ntasks-per-node".into());
                args.push(ppn.to_string());
            }
            Self::Jsrun => {
                args.push("-n".into());
                args.push(procs.to_string());
            }
            Self::Msmpi => {
                args.push("-np".into());
                args.push(procs.to_string());
                args.push("-cores".into());
                args.push(ppn.to_string());
            }
        }
        args
    }
}
