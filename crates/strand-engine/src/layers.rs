//! Union-filesystem drivers for layered job filesystems.
//!
//! A layer stack is a list of read-only directories topped by one
//! read-write directory, presented as a single tree at a target path.
//! The drivers shell out to `mount(8)`/`umount(8)` and friends as opaque
//! external collaborators; a failed mount is retried once after loading
//! the kernel module with `modprobe`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// One way of assembling a layer stack.
#[async_trait]
pub trait UnionDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Mount the read-only layers `ro` (greater index is lower on the
    /// stack) plus the read-write layer `rw` onto `target`.
    async fn mount(&self, ro: &[PathBuf], rw: &Path, target: &Path) -> Result<()>;

    /// Unmount `target`; drivers that stack intermediate mounts also
    /// unmount `layers`.
    async fn unmount(&self, target: &Path, layers: &[PathBuf]) -> Result<()>;
}

/// Look up a driver by name.
pub fn driver(name: &str) -> Option<Arc<dyn UnionDriver>> {
    match name {
        "overlay" | "overlayfs" => Some(Arc::new(OverlayFs)),
        "aufs" => Some(Arc::new(Aufs)),
        "unionfs-fuse" => Some(Arc::new(UnionFsFuse)),
        _ => None,
    }
}

/// Options string for one overlay step.
pub fn overlay_options(lower: &Path, upper: &Path) -> String {
    format!("lowerdir={},upperdir={}", lower.display(), upper.display())
}

/// aufs branch list: the read-write branch first, then each read-only
/// layer with whiteout support.
pub fn aufs_branches(ro: &[PathBuf], rw: &Path) -> String {
    let ro_branches: String = ro
        .iter()
        .map(|layer| format!("{}=ro+wh:", layer.display()))
        .collect();
    format!("br:{}=rw:{}", rw.display(), ro_branches)
}

/// unionfs-fuse branch list: copy-on-write branch first, read-only after.
pub fn unionfs_branches(ro: &[PathBuf], rw: &Path) -> String {
    let ro_branches: String = ro
        .iter()
        .map(|layer| format!("{}=RO:", layer.display()))
        .collect();
    format!("{}=RW:{}", rw.display(), ro_branches)
}

async fn run(mut cmd: Command, what: &str) -> Result<()> {
    let status = cmd
        .status()
        .await
        .with_context(|| format!("running {what}"))?;
    if !status.success() {
        bail!("{what} failed with {status}");
    }
    Ok(())
}

async fn mount_fs(fstype: &str, source: &str, target: &Path, options: &str) -> Result<()> {
    let mut cmd = Command::new("mount");
    cmd.arg("-t")
        .arg(fstype)
        .arg("-o")
        .arg(options)
        .arg(source)
        .arg(target);
    run(cmd, "mount").await
}

async fn modprobe(module: &str) -> Result<()> {
    let mut cmd = Command::new("modprobe");
    cmd.arg(module);
    run(cmd, "modprobe").await
}

async fn umount(target: &Path) -> Result<()> {
    let mut cmd = Command::new("umount");
    cmd.arg(target);
    run(cmd, "umount").await
}

/// overlayfs can only combine two directories per mount, so the read-only
/// layers are assembled with recursive mounts before the final mount of
/// the read-write layer onto the target.
pub struct OverlayFs;

impl OverlayFs {
    async fn mount_stack(&self, ro: &[PathBuf], rw: &Path, target: &Path) -> Result<()> {
        let Some(mut prev) = ro.last().map(PathBuf::as_path) else {
            bail!("overlay mount needs at least one read-only layer");
        };
        for layer in ro[..ro.len() - 1].iter().rev() {
            let options = format!("ro,{}", overlay_options(prev, layer));
            mount_fs("overlay", "overlay", layer, &options)
                .await
                .with_context(|| {
                    format!("mounting {} on {} with overlay", prev.display(), layer.display())
                })?;
            tracing::debug!(lower = %prev.display(), upper = %layer.display(), "overlay layer mounted");
            prev = layer.as_path();
        }
        let options = overlay_options(prev, rw);
        mount_fs("overlay", "overlay", target, &options)
            .await
            .with_context(|| {
                format!("mounting {} on {} with overlay", prev.display(), target.display())
            })?;
        tracing::debug!(lower = %prev.display(), upper = %rw.display(), target = %target.display(), "overlay target mounted");
        Ok(())
    }
}

#[async_trait]
impl UnionDriver for OverlayFs {
    fn name(&self) -> &str {
        "overlay"
    }

    async fn mount(&self, ro: &[PathBuf], rw: &Path, target: &Path) -> Result<()> {
        if self.mount_stack(ro, rw, target).await.is_err() {
            tracing::info!("kernel rejected overlay mount, loading module with modprobe");
            modprobe("overlay")
                .await
                .context("loading the overlay module")?;
            self.mount_stack(ro, rw, target)
                .await
                .context("mounting with overlay")?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path, layers: &[PathBuf]) -> Result<()> {
        umount(target).await?;
        for layer in layers {
            umount(layer).await?;
        }
        Ok(())
    }
}

/// aufs mounts the whole branch stack in one go.
pub struct Aufs;

#[async_trait]
impl UnionDriver for Aufs {
    fn name(&self) -> &str {
        "aufs"
    }

    async fn mount(&self, ro: &[PathBuf], rw: &Path, target: &Path) -> Result<()> {
        let branches = aufs_branches(ro, rw);
        if mount_fs("aufs", "none", target, &branches).await.is_err() {
            tracing::info!("kernel rejected aufs mount, loading module with modprobe");
            modprobe("aufs").await.context("loading the aufs module")?;
            mount_fs("aufs", "none", target, &branches)
                .await
                .context("mounting with aufs")?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path, _layers: &[PathBuf]) -> Result<()> {
        umount(target).await
    }
}

/// FUSE-based fallback needing no kernel module.
pub struct UnionFsFuse;

#[async_trait]
impl UnionDriver for UnionFsFuse {
    fn name(&self) -> &str {
        "unionfs-fuse"
    }

    async fn mount(&self, ro: &[PathBuf], rw: &Path, target: &Path) -> Result<()> {
        let branches = unionfs_branches(ro, rw);
        let mut cmd = Command::new("unionfs-fuse");
        cmd.arg("-o")
            .arg("cow")
            .arg("-o")
            .arg("dev")
            .arg(&branches)
            .arg(target);
        run(cmd, "unionfs-fuse").await.context("mounting with unionfs-fuse")
    }

    async fn unmount(&self, target: &Path, _layers: &[PathBuf]) -> Result<()> {
        umount(target).await
    }
}
