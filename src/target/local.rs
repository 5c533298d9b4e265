// src/target/local.rs

//! The machine `fanout` itself runs on.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use futures::future::BoxFuture;
use portable_pty::CommandBuilder;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{FanoutError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::target::pty::spawn_native;
use crate::target::{PtyProcess, RemoteCommand, RunOutput, Target};
use crate::types::TermSize;

#[derive(Debug, Clone)]
pub struct LocalTarget {
    slug: String,
    shell: String,
    fs: Arc<dyn FileSystem>,
}

impl LocalTarget {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            shell: "sh".to_string(),
            fs: Arc::new(RealFileSystem),
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn run_piped(&self, line: &str) -> Result<RunOutput> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| FanoutError::transport(&self.slug, line, e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(RunOutput::new(output.status.code().unwrap_or(-1), text))
    }
}

impl Target for LocalTarget {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn describe(&self) -> String {
        format!("{} (local)", self.slug)
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn run<'a>(
        &'a self,
        command: &'a RemoteCommand,
        pty: bool,
    ) -> BoxFuture<'a, Result<RunOutput>> {
        Box::pin(async move {
            let line = command.render();
            debug!(target = %self.slug, cmd = %line, pty, "running local command");
            if !pty {
                return self.run_piped(&line).await;
            }
            let process = self.open_pty(command, TermSize::current().unwrap_or_default())?;
            tokio::task::spawn_blocking(move || process.collect())
                .await
                .context("pty collector task panicked")?
        })
    }

    fn open_pty(&self, command: &RemoteCommand, size: TermSize) -> Result<PtyProcess> {
        let mut builder = CommandBuilder::new(&self.shell);
        builder.arg("-c");
        builder.arg(command.render());
        if let Ok(cwd) = std::env::current_dir() {
            builder.cwd(cwd);
        }
        spawn_native(builder, size)
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { Ok(self.fs.read(Path::new(path))?) })
    }

    fn write_file<'a>(&'a self, path: &'a str, contents: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Ok(self.fs.write(Path::new(path), contents)?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::target::CommandContext;

    #[tokio::test]
    async fn run_reports_exit_code_and_output() {
        let target = LocalTarget::new("local");
        let out = target
            .run(&RemoteCommand::new("echo hello; exit 3"), false)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.output, "hello\n");
    }

    #[tokio::test]
    async fn run_honours_context_env() {
        let target = LocalTarget::new("local");
        let ctx = CommandContext::new().with_env("GREETING", "hi");
        let out = target
            .run(&RemoteCommand::new("echo $GREETING").with_context(ctx), false)
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "hi");
    }

    #[tokio::test]
    async fn env_values_reach_the_shell_verbatim() {
        let target = LocalTarget::new("local");
        let ctx = CommandContext::new()
            .with_env("MODE", "production mode")
            .with_env("TRAP", "x; echo injected $(id -u)");
        let out = target
            .run(
                &RemoteCommand::new(r#"echo "[$MODE]" "[$TRAP]""#).with_context(ctx),
                false,
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output, "[production mode] [x; echo injected $(id -u)]\n");
    }

    #[tokio::test]
    async fn working_directory_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("release 2");
        std::fs::create_dir(&nested).unwrap();

        let target = LocalTarget::new("local");
        let ctx = CommandContext::new().with_cwd(nested.to_string_lossy());
        let out = target
            .run(&RemoteCommand::new("pwd").with_context(ctx), false)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.output.trim_end().ends_with("release 2"));
    }

    #[tokio::test]
    async fn files_go_through_the_filesystem_abstraction() {
        let fs = MockFileSystem::new();
        let target = LocalTarget::new("local").with_fs(Arc::new(fs.clone()));

        target.write_file("/etc/app.conf", b"x=1").await.unwrap();
        assert_eq!(target.read_file("/etc/app.conf").await.unwrap(), b"x=1");
        assert!(target.read_file("/missing").await.is_err());
    }
}
