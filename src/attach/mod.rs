// src/attach/mod.rs

//! Attach protocol.
//!
//! Each `fanout run` serves its sessions on a Unix socket
//! `<socket_dir>/fanout.<pid>.sock`. Front-ends (tmux panes, terminal windows
//! or an operator typing `fanout attach`) connect to it to view and drive a
//! session.

pub mod client;
pub mod protocol;
pub mod server;
pub mod tty;

use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::fs::FileSystem;

pub use client::{
    AttachOutcome, attach_in_process, attach_local, attach_terminal, list_sessions, send_signal,
};
pub use protocol::{ClientMessage, DETACH_KEY, Frame, ServerMessage};
pub use server::{AttachServer, handle_connection};
pub use tty::TtyInput;

const SOCKET_PREFIX: &str = "fanout.";
const SOCKET_SUFFIX: &str = ".sock";

/// Per-user directory holding attach sockets.
pub fn default_socket_dir() -> PathBuf {
    let uid = nix::unistd::getuid();
    std::env::temp_dir().join(format!("fanout-{uid}"))
}

pub fn socket_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{SOCKET_PREFIX}{pid}{SOCKET_SUFFIX}"))
}

/// Attach sockets found in `dir`, sorted. A missing directory yields none.
pub fn discover_sockets(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<PathBuf>> {
    if !fs.exists(dir) {
        return Ok(Vec::new());
    }
    let found = fs
        .read_dir(dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(SOCKET_PREFIX))
                .and_then(|n| n.strip_suffix(SOCKET_SUFFIX))
                .is_some_and(|pid| !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()))
        })
        .collect();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn discovers_only_fanout_sockets() {
        let fs = MockFileSystem::new();
        let dir = Path::new("/run/fanout-1000");
        fs.write(&socket_path(dir, 42), b"").unwrap();
        fs.write(&dir.join("fanout.x.sock"), b"").unwrap();
        fs.write(&dir.join("notes.txt"), b"").unwrap();
        fs.write(&socket_path(dir, 7), b"").unwrap();

        let found = discover_sockets(&fs, dir).unwrap();
        assert_eq!(found, vec![socket_path(dir, 42), socket_path(dir, 7)]);
    }

    #[test]
    fn missing_dir_is_empty() {
        let fs = MockFileSystem::new();
        assert!(discover_sockets(&fs, Path::new("/nope")).unwrap().is_empty());
    }
}
