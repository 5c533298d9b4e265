// src/target/sandbox.rs

use futures::future::BoxFuture;
use tracing::info;

use crate::errors::Result;
use crate::target::{PtyProcess, RemoteCommand, RunOutput, Target, TargetHandle};
use crate::types::TermSize;

/// Dry-run decorator: commands are only syntax-checked with `bash -n` and
/// echoed, file writes are skipped. Reads and connects go through.
#[derive(Debug, Clone)]
pub struct SandboxTarget {
    inner: TargetHandle,
}

impl SandboxTarget {
    pub fn new(inner: TargetHandle) -> Self {
        Self { inner }
    }
}

impl Target for SandboxTarget {
    fn slug(&self) -> &str {
        self.inner.slug()
    }

    fn describe(&self) -> String {
        format!("{} [sandbox]", self.inner.describe())
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.connect()
    }

    fn run<'a>(
        &'a self,
        command: &'a RemoteCommand,
        pty: bool,
    ) -> BoxFuture<'a, Result<RunOutput>> {
        Box::pin(async move { self.inner.run(&command.sandboxed(), pty).await })
    }

    fn open_pty(&self, command: &RemoteCommand, size: TermSize) -> Result<PtyProcess> {
        self.inner.open_pty(&command.sandboxed(), size)
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        self.inner.read_file(path)
    }

    fn write_file<'a>(&'a self, path: &'a str, contents: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(
                target = %self.inner.slug(),
                path,
                bytes = contents.len(),
                "sandbox: skipping file write"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::target::LocalTarget;

    #[tokio::test]
    async fn commands_are_not_executed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let target = SandboxTarget::new(Arc::new(LocalTarget::new("local")));

        let cmd = RemoteCommand::new(format!("touch {}", marker.display()));
        let out = target.run(&cmd, false).await.unwrap();

        assert!(out.success());
        assert!(!marker.exists());
        assert!(out.output.contains("touch"));
    }

    #[tokio::test]
    async fn syntax_errors_are_reported() {
        let target = SandboxTarget::new(Arc::new(LocalTarget::new("local")));
        let out = target
            .run(&RemoteCommand::new("if then fi"), false)
            .await
            .unwrap();
        assert!(out.output.contains("syntax error"));
    }
}
