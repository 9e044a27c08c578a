use std::io::Error as IoError;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How an error is handled by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Discovery or governor switch failed; the loop never starts.
    FatalStartup,
    /// No usable load reading this tick.
    RecoverableSensor,
    /// A sysfs speed write failed; rolled back and retried next tick.
    RecoverableActuation,
    /// Invalid options; reported with the help text.
    Config,
    /// Missing root or a failed uid/gid switch.
    Privilege,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{path}: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("{path}: unexpected content {content:?}")]
    Parse { path: PathBuf, content: String },
    #[error("no cpufreq capable CPUs found under {0}")]
    NoCpus(PathBuf),
    #[error("cpu{cpu}: empty frequency table")]
    EmptyTable { cpu: usize },
    #[error("cpu{cpu}: cannot switch to the userspace governor (still {current:?})")]
    Governor { cpu: usize, current: String },
    #[error("{0}")]
    Config(String),
    #[error("cannot read configuration file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("invalid configuration file {path}: {source}")]
    ConfigSyntax {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot install the signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("jackfreqd requires root permissions")]
    NotRoot,
    #[error("cannot {action}: {source}")]
    Privilege {
        action: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("cannot connect to the audio server: {0}")]
    Connect(String),
    #[error("cannot read {path}: {source}")]
    CpuStat {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("cpu{cpu}: cannot write scaling_setspeed: {source}")]
    Write {
        cpu: usize,
        #[source]
        source: IoError,
    },
    #[error("cpu{cpu}: short write to scaling_setspeed ({written} of {expected} bytes)")]
    ShortWrite {
        cpu: usize,
        written: usize,
        expected: usize,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Sysfs { .. }
            | Error::Parse { .. }
            | Error::NoCpus(_)
            | Error::EmptyTable { .. }
            | Error::Governor { .. }
            | Error::Signal(_) => ErrorKind::FatalStartup,
            Error::Config(_) | Error::ConfigFile { .. } | Error::ConfigSyntax { .. } => {
                ErrorKind::Config
            }
            Error::NotRoot | Error::Privilege { .. } => ErrorKind::Privilege,
            Error::Connect(_) | Error::CpuStat { .. } => ErrorKind::RecoverableSensor,
            Error::Write { .. } | Error::ShortWrite { .. } => ErrorKind::RecoverableActuation,
        }
    }

    /// Process exit status used when this error aborts the daemon.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Config => 2,
            ErrorKind::Privilege if matches!(self, Error::NotRoot) => libc::EPERM,
            _ => 1,
        }
    }

    pub(crate) fn sysfs(path: impl Into<PathBuf>, source: IoError) -> Self {
        Error::Sysfs {
            path: path.into(),
            source,
        }
    }
}
