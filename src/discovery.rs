use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::constants::{AUDIO_SERVER_NAMES, PROC_ROOT};

/// A running audio server process and its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub uid: Uid,
    pub gid: Gid,
}

/// Reads `argv[0]` from a NUL-separated `cmdline`.
fn argv0(cmdline: &[u8]) -> Option<String> {
    let first = cmdline.split(|&b| b == 0).next()?;
    (!first.is_empty()).then(|| String::from_utf8_lossy(first).into_owned())
}

/// Checks whether an `argv[0]` names one of the audio servers.
pub fn is_audio_server(argv0: &str) -> bool {
    let basename = Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(argv0);
    AUDIO_SERVER_NAMES.iter().any(|&name| basename == name)
}

/// Walks a procfs tree looking for a JACK or PipeWire server.
pub struct ProcessDiscovery {
    root: PathBuf,
}

impl ProcessDiscovery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// First audio server found, lowest pid first.
    pub fn find_audio_server_owner(&self) -> Option<ProcessInfo> {
        let entries = std::fs::read_dir(&self.root).ok()?;
        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();

        pids.into_iter().find_map(|pid| {
            let dir = self.root.join(pid.to_string());
            let cmdline = std::fs::read(dir.join("cmdline")).ok()?;
            let name = argv0(&cmdline)?;
            if !is_audio_server(&name) {
                return None;
            }
            let meta = std::fs::metadata(&dir).ok()?;
            let info = ProcessInfo {
                pid,
                uid: Uid::from_raw(meta.uid()),
                gid: Gid::from_raw(meta.gid()),
            };
            log::info!(
                "Found {name} running; pid:{pid} u:{} g:{}",
                info.uid,
                info.gid
            );
            Some(info)
        })
    }

    /// `XDG_RUNTIME_DIR` from the environment of `pid`.
    pub fn xdg_runtime_dir(&self, pid: u32) -> Option<String> {
        let environ = std::fs::read(self.root.join(format!("{pid}/environ"))).ok()?;
        environ
            .split(|&b| b == 0)
            .find_map(|var| var.strip_prefix(b"XDG_RUNTIME_DIR="))
            .filter(|dir| !dir.is_empty())
            .map(|dir| String::from_utf8_lossy(dir).into_owned())
    }
}

impl Default for ProcessDiscovery {
    fn default() -> Self {
        Self::new(PROC_ROOT)
    }
}
