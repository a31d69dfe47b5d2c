//! Built-in job handlers and the default registration set.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;

use crate::db::Db;
use crate::layers;
use crate::registry::{Env, HandlerRegistry, JobHandler};
use crate::streams::Streams;

/// Names every engine pre-registers. `exec`, `mount`, and `unmount` get
/// real handlers; the rest are bound to [`NotImplemented`] so they fail
/// descriptively instead of with "unknown job".
pub const DEFAULT_JOBS: &[&str] = &[
    "exec", "mount", "unmount", "clone", "ls", "ps", "name", "import", "start", "info", "serve",
    "echo", "build", "expose", "connect", "prompt",
];

/// Register the default job set into `registry`.
pub fn register_defaults(registry: &mut HandlerRegistry) {
    for name in DEFAULT_JOBS {
        registry.register(*name, Arc::new(NotImplemented));
    }
    registry.register("exec", Arc::new(Exec));
    registry.register("mount", Arc::new(Mount));
    registry.register("unmount", Arc::new(Unmount));
}

/// Stub bound to every job name that has no real implementation yet.
pub struct NotImplemented;

#[async_trait]
impl JobHandler for NotImplemented {
    async fn run(
        &self,
        name: &str,
        _args: &[String],
        _env: &Env,
        _streams: Streams,
        _db: Arc<dyn Db>,
    ) -> anyhow::Result<()> {
        bail!("not yet implemented: {name}")
    }
}

/// Run an external command with its standard streams wired to the job's
/// "stdin"/"stdout"/"stderr" streams. `args[0]` is the command, the rest
/// are its arguments; a non-zero exit is reported as the job's error.
pub struct Exec;

#[async_trait]
impl JobHandler for Exec {
    async fn run(
        &self,
        _name: &str,
        args: &[String],
        env: &Env,
        streams: Streams,
        _db: Arc<dyn Db>,
    ) -> anyhow::Result<()> {
        let Some((cmd_name, cmd_args)) = args.split_first() else {
            bail!("not enough arguments");
        };

        let mut stdin_stream = streams.open_read("stdin")?;
        let mut stdout_stream = streams.open_write("stdout")?;
        let mut stderr_stream = streams.open_write("stderr")?;

        let mut cmd = Command::new(cmd_name);
        cmd.args(cmd_args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {cmd_name}"))?;

        let Some(mut child_stdin) = child.stdin.take() else {
            bail!("child stdin unavailable");
        };
        let Some(mut child_stdout) = child.stdout.take() else {
            bail!("child stdout unavailable");
        };
        let Some(mut child_stderr) = child.stderr.take() else {
            bail!("child stderr unavailable");
        };

        let stdin_task = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdin_stream, &mut child_stdin).await;
            // Dropping child_stdin signals EOF to the child.
        });
        let stdout_task = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_stdout, &mut stdout_stream).await;
        });
        let stderr_task = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_stderr, &mut stderr_stream).await;
        });

        let status = child.wait().await.context("waiting for child")?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        // The stdin copier may still be blocked on a stream nobody closes.
        stdin_task.abort();

        if !status.success() {
            bail!("{cmd_name} exited with {status}");
        }
        Ok(())
    }
}

/// Mount a stack of read-only layers plus one read-write layer onto a
/// target directory using a union-filesystem driver.
///
/// Args: `target rw ro...` (at least one read-only layer); the driver is
/// chosen by the job env key "driver" and defaults to overlayfs.
pub struct Mount;

#[async_trait]
impl JobHandler for Mount {
    async fn run(
        &self,
        _name: &str,
        args: &[String],
        env: &Env,
        _streams: Streams,
        _db: Arc<dyn Db>,
    ) -> anyhow::Result<()> {
        if args.len() < 3 {
            bail!("not enough arguments");
        }
        let target = std::path::PathBuf::from(&args[0]);
        let rw = std::path::PathBuf::from(&args[1]);
        let ro: Vec<std::path::PathBuf> = args[2..].iter().map(Into::into).collect();
        let driver = driver_from_env(env)?;
        driver.mount(&ro, &rw, &target).await
    }
}

/// Unmount a union-filesystem target. Args: `target [layers...]` — the
/// extra layer paths are unmounted too where the driver needs it.
pub struct Unmount;

#[async_trait]
impl JobHandler for Unmount {
    async fn run(
        &self,
        _name: &str,
        args: &[String],
        env: &Env,
        _streams: Streams,
        _db: Arc<dyn Db>,
    ) -> anyhow::Result<()> {
        let Some((target, layer_args)) = args.split_first() else {
            bail!("not enough arguments");
        };
        let target = std::path::PathBuf::from(target);
        let layer_paths: Vec<std::path::PathBuf> = layer_args.iter().map(Into::into).collect();
        let driver = driver_from_env(env)?;
        driver.unmount(&target, &layer_paths).await
    }
}

fn driver_from_env(env: &Env) -> anyhow::Result<Arc<dyn layers::UnionDriver>> {
    let name = env.get("driver").map(String::as_str).unwrap_or("overlay");
    layers::driver(name).with_context(|| format!("unknown union driver: {name}"))
}
