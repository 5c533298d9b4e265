// src/target/ssh.rs

//! Remote targets reached through the system `ssh` client.
//!
//! `connect` starts an OpenSSH control master for the target, so every later
//! command (piped or pty) reuses one authenticated connection. Password and
//! host-key prompts therefore happen once, at connect time.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use futures::future::BoxFuture;
use portable_pty::CommandBuilder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{FanoutError, Result};
use crate::target::command::quote;
use crate::target::pty::spawn_native;
use crate::target::{PtyProcess, RemoteCommand, RunOutput, Target};
use crate::types::TermSize;

/// ssh exits with 255 when the connection itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tty {
    None,
    Forced,
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    slug: String,
    address: String,
    user: Option<String>,
    port: Option<u16>,
    identity_file: Option<PathBuf>,
    options: Vec<String>,
    control_dir: PathBuf,
    connect_timeout_secs: u64,
}

impl SshTarget {
    pub fn new(slug: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            address: address.into(),
            user: None,
            port: None,
            identity_file: None,
            options: Vec::new(),
            control_dir: default_control_dir(),
            connect_timeout_secs: 10,
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: Option<PathBuf>) -> Self {
        self.identity_file = path;
        self
    }

    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_control_dir(mut self, dir: PathBuf) -> Self {
        self.control_dir = dir;
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs.max(1);
        self
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.address),
            None => self.address.clone(),
        }
    }

    /// Arguments up to and including the destination.
    fn ssh_args(&self, tty: Tty) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}/%C", self.control_dir.display()),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for opt in &self.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args.push(match tty {
            Tty::None => "-T".to_string(),
            Tty::Forced => "-tt".to_string(),
        });
        args.push(self.destination());
        args
    }

    fn command(&self, tty: Tty, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(tty)).arg(remote).kill_on_drop(true);
        cmd
    }

    fn ensure_control_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.control_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.control_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    fn check_transport(&self, line: &str, out: &std::process::Output) -> Result<()> {
        if out.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            return Err(FanoutError::transport(
                &self.slug,
                line,
                String::from_utf8_lossy(&out.stderr).trim(),
            ));
        }
        Ok(())
    }
}

fn default_control_dir() -> PathBuf {
    std::env::temp_dir().join(format!("fanout-ssh-{}", nix::unistd::getuid()))
}

impl Target for SshTarget {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn describe(&self) -> String {
        match self.port {
            Some(port) => format!("{} ({}:{port})", self.slug, self.destination()),
            None => format!("{} ({})", self.slug, self.destination()),
        }
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_control_dir()?;
            info!(target = %self.slug, dest = %self.destination(), "connecting");
            let out = self
                .command(Tty::None, "true")
                .stdin(Stdio::inherit())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| FanoutError::transport(&self.slug, "ssh", e))?;
            if !out.status.success() {
                return Err(FanoutError::transport(
                    &self.slug,
                    "ssh",
                    String::from_utf8_lossy(&out.stderr).trim(),
                ));
            }
            Ok(())
        })
    }

    fn run<'a>(
        &'a self,
        command: &'a RemoteCommand,
        pty: bool,
    ) -> BoxFuture<'a, Result<RunOutput>> {
        Box::pin(async move {
            let line = command.render();
            debug!(target = %self.slug, cmd = %line, pty, "running remote command");

            if pty {
                let process = self.open_pty(command, TermSize::current().unwrap_or_default())?;
                let out = tokio::task::spawn_blocking(move || process.collect())
                    .await
                    .context("pty collector task panicked")??;
                if out.exit_code == SSH_TRANSPORT_FAILURE {
                    return Err(FanoutError::transport(&self.slug, &line, out.output.trim()));
                }
                return Ok(out);
            }

            let out = self
                .command(Tty::None, &line)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| FanoutError::transport(&self.slug, &line, e))?;
            self.check_transport(&line, &out)?;

            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            Ok(RunOutput::new(out.status.code().unwrap_or(-1), text))
        })
    }

    fn open_pty(&self, command: &RemoteCommand, size: TermSize) -> Result<PtyProcess> {
        let mut builder = CommandBuilder::new("ssh");
        for arg in self.ssh_args(Tty::Forced) {
            builder.arg(arg);
        }
        builder.arg(command.render());
        spawn_native(builder, size)
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let line = format!("cat -- {}", quote(path));
            let out = self
                .command(Tty::None, &line)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| FanoutError::transport(&self.slug, &line, e))?;
            self.check_transport(&line, &out)?;
            if !out.status.success() {
                return Err(FanoutError::RemoteExecution {
                    target: self.slug.clone(),
                    command: line,
                    failure: crate::errors::RemoteFailure::ExitStatus {
                        code: out.status.code().unwrap_or(-1),
                        output: String::from_utf8_lossy(&out.stderr).into_owned(),
                    },
                });
            }
            Ok(out.stdout)
        })
    }

    fn write_file<'a>(&'a self, path: &'a str, contents: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let line = format!("cat > {}", quote(path));
            let mut child = self
                .command(Tty::None, &line)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| FanoutError::transport(&self.slug, &line, e))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(contents)
                    .await
                    .map_err(|e| FanoutError::transport(&self.slug, &line, e))?;
                // Dropping stdin closes it; the remote `cat` then exits.
            }

            let out = child
                .wait_with_output()
                .await
                .map_err(|e| FanoutError::transport(&self.slug, &line, e))?;
            self.check_transport(&line, &out)?;
            if !out.status.success() {
                return Err(FanoutError::RemoteExecution {
                    target: self.slug.clone(),
                    command: line,
                    failure: crate::errors::RemoteFailure::ExitStatus {
                        code: out.status.code().unwrap_or(-1),
                        output: String::from_utf8_lossy(&out.stderr).into_owned(),
                    },
                });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_args_carry_connection_parameters() {
        let target = SshTarget::new("web1", "10.0.0.11")
            .with_user(Some("deploy".into()))
            .with_port(Some(2222))
            .with_identity_file(Some(PathBuf::from("/keys/id")))
            .with_options(vec!["StrictHostKeyChecking=accept-new".into()])
            .with_control_dir(PathBuf::from("/tmp/ctl"));

        let args = target.ssh_args(Tty::Forced);
        assert_eq!(args.last().map(String::as_str), Some("deploy@10.0.0.11"));
        assert!(args.contains(&"ControlPath=/tmp/ctl/%C".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id"]));
        assert!(args.contains(&"-tt".to_string()));
        assert!(!args.contains(&"-T".to_string()));
        assert_eq!(target.describe(), "web1 (deploy@10.0.0.11:2222)");
    }
}
