//! Subprocess pack runner
//!
//! Drives a `git` binary for both phases of the smart HTTP exchange.
//! Spawning and streaming are separate steps: [`PackProcess::spawn_advertisement`]
//! and [`PackProcess::spawn_negotiation`] report launch failures (missing or
//! broken executable) before any response bytes exist, so callers can still
//! answer with a proper error status. Everything after that is streamed:
//! negotiation input is piped into the subprocess as it arrives and pack
//! output is piped out as it is produced, so a multi-gigabyte clone never
//! materializes in memory.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::protocol::{service_announcement, Service};
use crate::{Error, Result};

/// Stderr lines git emits routinely on large diffs. Not a sign of trouble.
const BENIGN_STDERR: &[&str] = &[
    "inexact rename detection was skipped",
    "you may want to set your diff.renameLimit variable",
];

fn git_command(
    program: &str,
    git_dir: &Path,
    service: Service,
    protocol: Option<&str>,
    advertise: bool,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg(service.subcommand());
    cmd.arg("--stateless-rpc");
    if advertise {
        cmd.arg("--advertise-refs");
    }
    cmd.arg(git_dir);
    if let Some(protocol) = protocol {
        cmd.env("GIT_PROTOCOL", protocol);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // A dropped handler (client disconnect) must not leave the
        // subprocess running.
        .kill_on_drop(true);
    cmd
}

/// Drain subprocess stderr, forwarding lines to the server log and keeping
/// them for the error report on non-zero exit.
async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut collected = String::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if BENIGN_STDERR.iter().any(|b| line.contains(b)) {
            tracing::debug!(target: "git", "{line}");
        } else {
            tracing::warn!(target: "git", "{line}");
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

async fn check_exit(mut child: Child, stderr: String) -> Result<()> {
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(Error::GitExit {
                status: code,
                stderr: stderr.trim_end().to_string(),
            }),
            None => Err(Error::GitKilled),
        }
    }
}

/// A spawned pack subprocess, ready to stream.
pub struct PackProcess {
    child: Child,
    service: Service,
}

impl PackProcess {
    /// Spawn the first-phase (ref advertisement) subprocess for `git_dir`.
    pub fn spawn_advertisement(
        program: &str,
        git_dir: &Path,
        service: Service,
        protocol: Option<&str>,
    ) -> Result<Self> {
        let child = git_command(program, git_dir, service, protocol, true).spawn()?;
        Ok(Self { child, service })
    }

    /// Spawn the second-phase (pack negotiation) subprocess for `git_dir`.
    /// `envs` is hook-related environment, passed through unchanged.
    pub fn spawn_negotiation(
        program: &str,
        git_dir: &Path,
        service: Service,
        protocol: Option<&str>,
        envs: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = git_command(program, git_dir, service, protocol, false);
        cmd.envs(envs);
        let child = cmd.spawn()?;
        Ok(Self { child, service })
    }

    /// Write the smart HTTP ref advertisement to `out`: the pkt-line
    /// service announcement followed by the tool's native advertisement
    /// output.
    pub async fn stream_advertisement(mut self, out: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        out.write_all(&service_announcement(self.service)).await?;

        drop(self.child.stdin.take());
        let mut stdout = self.child.stdout.take().expect("stdout piped");
        let stderr = self.child.stderr.take().expect("stderr piped");

        let (copied, stderr_text) =
            tokio::join!(tokio::io::copy(&mut stdout, out), drain_stderr(stderr));
        copied?;
        out.flush().await?;

        check_exit(self.child, stderr_text).await
    }

    /// Run the negotiation, reading input from `input` and streaming the
    /// result to `out`.
    pub async fn stream(
        mut self,
        input: &mut (impl AsyncRead + Unpin),
        out: &mut (impl AsyncWrite + Unpin),
    ) -> Result<()> {
        let mut stdin = self.child.stdin.take().expect("stdin piped");
        let mut stdout = self.child.stdout.take().expect("stdout piped");
        let stderr = self.child.stderr.take().expect("stderr piped");

        let feed = async {
            tokio::io::copy(input, &mut stdin).await?;
            stdin.shutdown().await?;
            drop(stdin);
            Ok::<_, std::io::Error>(())
        };
        let drain = async {
            tokio::io::copy(&mut stdout, out).await?;
            out.flush().await
        };

        let (fed, drained, stderr_text) = tokio::join!(feed, drain, drain_stderr(stderr));
        // Receive-pack stops reading once the pack is consumed; a broken
        // pipe on our feed side is expected then, as long as git itself
        // exited cleanly.
        let feed_err = fed.err().filter(|e| e.kind() != std::io::ErrorKind::BrokenPipe);
        drained?;

        check_exit(self.child, stderr_text).await?;
        match feed_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Stream the content of a blob at `rev:path` to `out`.
pub async fn cat_file_blob(
    program: &str,
    git_dir: &Path,
    rev: &str,
    path: &str,
    out: &mut (impl AsyncWrite + Unpin),
) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.arg("-C")
        .arg(git_dir)
        .arg("cat-file")
        .arg("blob")
        .arg(format!("{rev}:{path}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (copied, stderr_text) =
        tokio::join!(tokio::io::copy(&mut stdout, out), drain_stderr(stderr));
    copied?;
    out.flush().await?;

    check_exit(child, stderr_text).await
}
