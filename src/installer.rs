//! Installer: acquires, verifies and unpacks a server distribution.
//!
//! One installation per server id at a time, tracked in an active set; any
//! number of servers may install concurrently. The durable `install_state`
//! flips to `installing` before any work starts, so a crash mid-install is
//! visible on the next startup and turned into `failed` there.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, InstallSource};
use crate::error::{Error, Result};
use crate::events::{EventHub, NotificationLevel};
use crate::models::{now_ms, InstallPaths, InstallProgress, InstallStage, InstallState, Server};
use crate::server_config::ServerConfigStore;
use crate::state::ServerLocks;
use crate::store::Store;

const STAGING_DIR: &str = ".install-staging";
const DOWNLOAD_DIR: &str = ".install-download";
const BACKUP_DIR: &str = ".install-backup";
const SERVER_DIR: &str = "server";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveInstallation {
    pub server_id: String,
    pub started_at: i64,
    pub stage: InstallStage,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

/// Removes the server from the active set when the installation ends,
/// however it ends.
struct ActiveGuard {
    active: Arc<DashMap<String, ActiveInstallation>>,
    server_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.server_id);
    }
}

pub struct Installer {
    config: Arc<AgentConfig>,
    store: Arc<Store>,
    configs: ServerConfigStore,
    events: EventHub,
    locks: ServerLocks,
    active: Arc<DashMap<String, ActiveInstallation>>,
}

impl Installer {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<Store>,
        events: EventHub,
        locks: ServerLocks,
    ) -> Self {
        let configs = ServerConfigStore::new(config.servers_root.clone());
        Self {
            config,
            store,
            configs,
            events,
            locks,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn is_installing(&self, server_id: &str) -> bool {
        self.active.contains_key(server_id)
    }

    pub fn active_installations(&self) -> Vec<ActiveInstallation> {
        let mut active: Vec<ActiveInstallation> =
            self.active.iter().map(|e| e.value().clone()).collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Accept an installation and run it on its own task.
    ///
    /// Rejections (unknown server, server running, installation already
    /// active, no install source) happen before any state changes. Acceptance
    /// holds the server's operation lock, so it never overlaps a start.
    pub async fn install_server(self: &Arc<Self>, server_id: &str) -> Result<JoinHandle<()>> {
        let lock = self.locks.get(server_id);
        let _op = lock.lock().await;
        let server = self.store.require_server(server_id)?;
        if server.status.implies_process() {
            return Err(Error::Conflict(format!(
                "Server '{}' must be offline to install (status: {})",
                server_id,
                server.status.as_str()
            )));
        }

        let guard = match self.active.entry(server_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::Conflict(format!(
                    "An installation is already in progress for server '{}'",
                    server_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveInstallation {
                    server_id: server_id.to_string(),
                    started_at: now_ms(),
                    stage: InstallStage::Queued,
                    progress: 0,
                });
                ActiveGuard {
                    active: self.active.clone(),
                    server_id: server_id.to_string(),
                }
            }
        };

        let source = self.resolve_source(server_id).await?;
        self.store
            .update_install_state(server_id, InstallState::Installing, None)?;
        self.report(
            server_id,
            InstallProgress::new(InstallStage::Queued, 0, "Installation queued"),
        );
        tracing::info!("Queued installation for server '{}'", server_id);

        let installer = self.clone();
        Ok(tokio::spawn(async move {
            installer.run(guard, server, source).await;
        }))
    }

    async fn resolve_source(&self, server_id: &str) -> Result<InstallSource> {
        let own = self
            .configs
            .load(server_id)
            .await?
            .and_then(|cfg| cfg.install);
        own.or_else(|| self.config.installer.default_source.clone())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "No install source configured for server '{}'",
                    server_id
                ))
            })
    }

    async fn run(self: Arc<Self>, guard: ActiveGuard, server: Server, source: InstallSource) {
        let id = server.id.as_str();
        let server_dir = self.config.server_dir(id);
        let staging = server_dir.join(STAGING_DIR);
        let download_dir = server_dir.join(DOWNLOAD_DIR);
        let backup = server_dir.join(BACKUP_DIR);
        let root = server_dir.join(SERVER_DIR);

        let result = self
            .execute(id, &source, &download_dir, &staging, &backup, &root)
            .await;
        cleanup(&[&staging, &download_dir, &backup]).await;

        match result {
            Ok(paths) => {
                if let Err(e) = self.store.mark_installed(id, &paths) {
                    self.fail(id, &format!("Failed to persist install result: {}", e));
                } else {
                    tracing::info!("Installed server '{}' at {}", id, paths.server_root);
                    self.report(
                        id,
                        InstallProgress::new(InstallStage::Ready, 100, "Installation complete")
                            .with_details(serde_json::json!({
                                "jarPath": paths.jar_path,
                                "assetsPath": paths.assets_path,
                                "serverRoot": paths.server_root,
                            })),
                    );
                    self.events.notify(
                        NotificationLevel::Success,
                        "Installation complete",
                        format!("Server '{}' is installed", server.name),
                        Some(id),
                    );
                }
            }
            Err(e) => self.fail(id, &e.to_string()),
        }
        drop(guard);
    }

    fn fail(&self, server_id: &str, reason: &str) {
        tracing::error!("Installation of '{}' failed: {}", server_id, reason);
        if let Err(e) = self
            .store
            .update_install_state(server_id, InstallState::Failed, Some(reason))
        {
            tracing::error!("Failed to persist install failure for '{}': {}", server_id, e);
        }
        let progress = self
            .active
            .get(server_id)
            .map(|a| a.progress)
            .unwrap_or(0);
        self.report(
            server_id,
            InstallProgress::new(InstallStage::Failed, progress, reason.to_string()),
        );
        self.events.notify(
            NotificationLevel::Error,
            "Installation failed",
            reason.to_string(),
            Some(server_id),
        );
    }

    fn report(&self, server_id: &str, progress: InstallProgress) {
        if let Some(mut active) = self.active.get_mut(server_id) {
            active.stage = progress.stage;
            active.progress = progress.progress;
        }
        self.events.install_progress(server_id, progress);
    }

    async fn execute(
        &self,
        id: &str,
        source: &InstallSource,
        download_dir: &Path,
        staging: &Path,
        backup: &Path,
        root: &Path,
    ) -> Result<InstallPaths> {
        self.report(
            id,
            InstallProgress::new(InstallStage::Downloading, 10, "Acquiring server distribution"),
        );
        let archive = acquire(source, download_dir).await?;

        self.report(
            id,
            InstallProgress::new(InstallStage::Downloading, 35, "Verifying archive integrity"),
        );
        let format = verify_archive(&archive, source.sha256()).await?;

        self.report(
            id,
            InstallProgress::new(InstallStage::Extracting, 45, "Extracting archive"),
        );
        cleanup(&[staging]).await;
        tokio::fs::create_dir_all(staging).await?;
        extract_archive(&archive, format, staging).await?;

        self.report(
            id,
            InstallProgress::new(InstallStage::Extracting, 65, "Normalizing file permissions"),
        );
        let tree = staging.to_path_buf();
        blocking(move || normalize_permissions(&tree)).await?;

        self.report(
            id,
            InstallProgress::new(InstallStage::Verifying, 80, "Locating server artifacts"),
        );
        let settings = self.config.installer.clone();
        let tree = staging.to_path_buf();
        let (jar_rel, assets_rel) = blocking(move || {
            find_artifacts(
                &tree,
                &settings.jar_name,
                &settings.assets_name,
                settings.max_search_depth,
                settings.max_search_entries,
            )
        })
        .await?;

        self.report(
            id,
            InstallProgress::new(InstallStage::Verifying, 90, "Installing files into server root")
                .with_details(serde_json::json!({ "artifact": jar_rel.display().to_string() })),
        );
        let (from, to, bak) = (staging.to_path_buf(), root.to_path_buf(), backup.to_path_buf());
        blocking(move || merge_tree(&from, &to, &bak)).await?;

        let jar_path = root.join(&jar_rel);
        let server_root = jar_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        Ok(InstallPaths {
            jar_path: jar_path.display().to_string(),
            assets_path: assets_rel.map(|rel| root.join(rel).display().to_string()),
            server_root: server_root.display().to_string(),
            version: source.version().map(str::to_string),
        })
    }

    /// Fail every persisted `installing` row that has no active installation.
    /// Run once at startup; interrupted installs are never resumed.
    pub fn recover_interrupted_installations(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for summary in self.store.list_servers()? {
            let server = summary.server;
            if server.install_state != InstallState::Installing || self.is_installing(&server.id)
            {
                continue;
            }
            let reason = "Installation was interrupted by an agent restart; reinstall required";
            self.store
                .update_install_state(&server.id, InstallState::Failed, Some(reason))?;
            let dir = self.config.server_dir(&server.id);
            for leftover in [
                dir.join(STAGING_DIR),
                dir.join(DOWNLOAD_DIR),
                dir.join(BACKUP_DIR),
            ] {
                if let Err(e) = std::fs::remove_dir_all(&leftover) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {}: {}", leftover.display(), e);
                    }
                }
            }
            tracing::warn!("Marked interrupted installation of '{}' as failed", server.id);
            recovered.push(server.id);
        }
        Ok(recovered)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Install(format!("worker task failed: {}", e)))?
}

async fn cleanup(dirs: &[&Path]) {
    for dir in dirs {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to clean up {}: {}", dir.display(), e),
        }
    }
}

async fn acquire(source: &InstallSource, download_dir: &Path) -> Result<PathBuf> {
    match source {
        InstallSource::Archive { path, .. } => {
            let path = PathBuf::from(path);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(path),
                Ok(_) => Err(Error::Install(format!("{} is not a file", path.display()))),
                Err(e) => Err(Error::Install(format!(
                    "archive {} is not readable: {}",
                    path.display(),
                    e
                ))),
            }
        }
        InstallSource::Downloader {
            command,
            args,
            archive_name,
            ..
        } => {
            if archive_name.contains('/') || archive_name.contains("..") {
                return Err(Error::Validation(
                    "archive_name must be a plain file name".to_string(),
                ));
            }
            tokio::fs::create_dir_all(download_dir).await?;
            let output = download_dir.join(archive_name);
            let output_str = output.display().to_string();
            let dir_str = download_dir.display().to_string();
            let args: Vec<String> = args
                .iter()
                .map(|a| a.replace("{output}", &output_str).replace("{download_dir}", &dir_str))
                .collect();

            let result = tokio::process::Command::new(command)
                .args(&args)
                .current_dir(download_dir)
                .stdin(std::process::Stdio::null())
                .output()
                .await
                .map_err(|e| Error::Install(format!("failed to run downloader '{}': {}", command, e)))?;
            if !result.status.success() {
                let stderr = String::from_utf8_lossy(&result.stderr);
                return Err(Error::Install(format!(
                    "downloader exited with {}: {}",
                    result.status,
                    stderr.trim()
                )));
            }
            if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
                return Err(Error::Install(format!(
                    "downloader did not produce {}",
                    output.display()
                )));
            }
            Ok(output)
        }
    }
}

async fn verify_archive(path: &Path, expected_sha256: Option<&str>) -> Result<ArchiveFormat> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = vec![0u8; 512];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    header.truncate(filled);
    let format = detect_format(&header)
        .ok_or_else(|| Error::Install(format!("{} is not a zip or tar archive", path.display())))?;

    if let Some(expected) = expected_sha256 {
        let path = path.to_path_buf();
        let actual = blocking(move || sha256_file(&path)).await?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(Error::Install(format!(
                "checksum mismatch: expected {}, got {}",
                expected.trim(),
                actual
            )));
        }
    }
    Ok(format)
}

fn detect_format(header: &[u8]) -> Option<ArchiveFormat> {
    if header.starts_with(b"PK\x03\x04") {
        Some(ArchiveFormat::Zip)
    } else if header.starts_with(&[0x1f, 0x8b]) {
        Some(ArchiveFormat::TarGz)
    } else if header.len() >= 262 && &header[257..262] == b"ustar" {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn extract_archive(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    let mut cmd = match format {
        ArchiveFormat::Zip => {
            let mut cmd = tokio::process::Command::new("unzip");
            cmd.arg("-o").arg("-q").arg(archive).arg("-d").arg(dest);
            cmd
        }
        ArchiveFormat::TarGz | ArchiveFormat::Tar => {
            let mut cmd = tokio::process::Command::new("tar");
            let flags = if format == ArchiveFormat::TarGz { "-xzf" } else { "-xf" };
            cmd.arg("--no-same-owner")
                .arg(flags)
                .arg(archive)
                .arg("-C")
                .arg(dest);
            cmd
        }
    };
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Install(format!("failed to run extractor: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Install(format!("extraction failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Directories 0755, executables 0755, other files 0644. Symlinks pointing
/// outside the tree and anything still world-writable afterwards are
/// rejected.
fn normalize_permissions(root: &Path) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&path)?;
                if target.is_absolute()
                    || target
                        .components()
                        .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(Error::Install(format!(
                        "archive contains a symlink escaping the install root: {}",
                        path.display()
                    )));
                }
                continue;
            }
            set_mode(&path, &meta)?;
            if meta.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, meta: &std::fs::Metadata) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.permissions().mode();
    let wanted = if meta.is_dir() || mode & 0o111 != 0 {
        0o755
    } else {
        0o644
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(wanted))?;
    let after = std::fs::metadata(path)?.permissions().mode();
    if after & 0o002 != 0 {
        return Err(Error::Install(format!(
            "{} is world-writable after normalization",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _meta: &std::fs::Metadata) -> Result<()> {
    Ok(())
}

/// Breadth-first search for the runnable artifact (shallowest match wins)
/// and the asset bundle, bounded in depth and visited entries. Returned
/// paths are relative to `root`.
fn find_artifacts(
    root: &Path,
    jar_name: &str,
    assets_name: &str,
    max_depth: usize,
    max_entries: usize,
) -> Result<(PathBuf, Option<PathBuf>)> {
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    let mut visited = 0usize;
    let mut jar: Option<PathBuf> = None;
    let mut assets: Vec<PathBuf> = Vec::new();

    while let Some((dir, depth)) = queue.pop_front() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            visited += 1;
            if visited > max_entries {
                return Err(Error::Install(format!(
                    "extracted tree exceeds {} entries",
                    max_entries
                )));
            }
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                if depth < max_depth {
                    queue.push_back((path, depth + 1));
                }
            } else if file_type.is_file() {
                let name = entry.file_name();
                if jar.is_none() && name == jar_name {
                    jar = Some(path);
                } else if name == assets_name {
                    assets.push(path);
                }
            }
        }
    }

    let jar = jar.ok_or_else(|| {
        Error::Install(format!("{} not found in the extracted archive", jar_name))
    })?;
    let jar_dir = jar.parent().map(Path::to_path_buf).unwrap_or_default();
    // Prefer the bundle next to the artifact, then one level up.
    let assets = assets
        .iter()
        .find(|p| p.parent() == Some(jar_dir.as_path()))
        .or_else(|| assets.iter().find(|p| jar_dir.parent() == p.parent()))
        .or_else(|| assets.first())
        .cloned();

    let relative = |p: &Path| p.strip_prefix(root).map(Path::to_path_buf).ok();
    let jar_rel = relative(&jar)
        .ok_or_else(|| Error::Install("artifact outside the extraction root".to_string()))?;
    Ok((jar_rel, assets.as_deref().and_then(relative)))
}

/// Changes made by one merge, undone in reverse if the merge fails.
#[derive(Default)]
struct MergeJournal {
    placed: Vec<PathBuf>,
    created: Vec<PathBuf>,
    /// (backup, original) pairs for entries the merge replaced.
    replaced: Vec<(PathBuf, PathBuf)>,
}

impl MergeJournal {
    fn rollback(self) {
        for path in self.placed.iter().rev() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Rollback could not remove {}: {}", path.display(), e);
            }
        }
        for dir in self.created.iter().rev() {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Rollback could not remove {}: {}", dir.display(), e);
                }
            }
        }
        for (backup, original) in self.replaced.iter().rev() {
            if let Err(e) = std::fs::rename(backup, original) {
                tracing::warn!("Rollback could not restore {}: {}", original.display(), e);
            }
        }
    }
}

/// Move every entry of `from` into `to`, replacing existing entries, then
/// remove `from`. Replaced entries are parked under `backup`; on failure the
/// merge is undone and `to` is left as it was.
fn merge_tree(from: &Path, to: &Path, backup: &Path) -> Result<()> {
    let mut journal = MergeJournal::default();
    match merge_entries(from, to, backup, &mut journal) {
        Ok(()) => {
            std::fs::remove_dir_all(from)?;
            if backup.exists() {
                std::fs::remove_dir_all(backup)?;
            }
            Ok(())
        }
        Err(e) => {
            journal.rollback();
            Err(e)
        }
    }
}

fn merge_entries(from: &Path, to: &Path, backup: &Path, journal: &mut MergeJournal) -> Result<()> {
    if !to.is_dir() {
        std::fs::create_dir(to)?;
        journal.created.push(to.to_path_buf());
    }
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let parked = backup.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if dst.symlink_metadata().is_ok() && (!dst.is_dir() || dst.is_symlink()) {
                park(&dst, &parked, journal)?;
            }
            merge_entries(&src, &dst, &parked, journal)?;
        } else if file_type.is_file() || file_type.is_symlink() {
            if dst.symlink_metadata().is_ok() {
                park(&dst, &parked, journal)?;
            }
            std::fs::rename(&src, &dst)?;
            journal.placed.push(dst);
        } else {
            return Err(Error::Install(format!(
                "unsupported file type in archive: {}",
                src.display()
            )));
        }
    }
    Ok(())
}

fn park(original: &Path, backup: &Path, journal: &mut MergeJournal) -> Result<()> {
    if let Some(parent) = backup.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(original, backup)?;
    journal
        .replaced
        .push((backup.to_path_buf(), original.to_path_buf()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_archive_formats_by_magic() {
        assert_eq!(detect_format(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(detect_format(&[0x1f, 0x8b, 8, 0]), Some(ArchiveFormat::TarGz));
        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(detect_format(&tar), Some(ArchiveFormat::Tar));
        assert_eq!(detect_format(b"<html>"), None);
    }

    #[test]
    fn artifact_search_prefers_shallow_match_and_sibling_assets() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("dist/Server")).unwrap();
        std::fs::create_dir_all(root.join("dist/Server/old")).unwrap();
        std::fs::write(root.join("dist/Server/HytaleServer.jar"), b"jar").unwrap();
        std::fs::write(root.join("dist/Server/old/HytaleServer.jar"), b"old").unwrap();
        std::fs::write(root.join("dist/Assets.zip"), b"assets").unwrap();

        let (jar, assets) =
            find_artifacts(root, "HytaleServer.jar", "Assets.zip", 8, 1000).unwrap();
        assert_eq!(jar, PathBuf::from("dist/Server/HytaleServer.jar"));
        assert_eq!(assets, Some(PathBuf::from("dist/Assets.zip")));
    }

    #[test]
    fn artifact_search_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("HytaleServer.jar"), b"jar").unwrap();

        assert!(find_artifacts(dir.path(), "HytaleServer.jar", "Assets.zip", 2, 1000).is_err());
        assert!(find_artifacts(dir.path(), "HytaleServer.jar", "Assets.zip", 8, 2).is_err());
        assert!(find_artifacts(dir.path(), "HytaleServer.jar", "Assets.zip", 8, 1000).is_ok());
    }

    #[test]
    fn merge_overwrites_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("staging");
        let to = dir.path().join("server");
        std::fs::create_dir_all(from.join("mods")).unwrap();
        std::fs::create_dir_all(&to).unwrap();
        std::fs::write(from.join("mods/a.txt"), b"new").unwrap();
        std::fs::write(to.join("keep.txt"), b"world").unwrap();
        std::fs::create_dir_all(to.join("mods")).unwrap();
        std::fs::write(to.join("mods/a.txt"), b"old").unwrap();

        let backup = dir.path().join("backup");
        merge_tree(&from, &to, &backup).unwrap();
        assert_eq!(std::fs::read(to.join("mods/a.txt")).unwrap(), b"new");
        assert_eq!(std::fs::read(to.join("keep.txt")).unwrap(), b"world");
        assert!(!from.exists());
        assert!(!backup.exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_merge_restores_previous_tree() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("staging");
        let to = dir.path().join("server");
        let backup = dir.path().join("backup");
        std::fs::create_dir_all(from.join("mods/nested")).unwrap();
        std::fs::create_dir_all(to.join("mods")).unwrap();
        std::fs::write(from.join("HytaleServer.jar"), b"new jar").unwrap();
        std::fs::write(from.join("mods/a.txt"), b"new").unwrap();
        std::fs::write(from.join("mods/b.txt"), b"added").unwrap();
        std::fs::write(to.join("HytaleServer.jar"), b"old jar").unwrap();
        std::fs::write(to.join("mods/a.txt"), b"old").unwrap();
        std::fs::write(to.join("world.dat"), b"world").unwrap();
        let fifo = std::process::Command::new("mkfifo")
            .arg(from.join("mods/nested/pipe"))
            .status()
            .unwrap();
        assert!(fifo.success());

        let err = merge_tree(&from, &to, &backup).unwrap_err();
        assert!(err.to_string().contains("unsupported file type"));

        assert_eq!(std::fs::read(to.join("HytaleServer.jar")).unwrap(), b"old jar");
        assert_eq!(std::fs::read(to.join("mods/a.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(to.join("world.dat")).unwrap(), b"world");
        assert!(!to.join("mods/b.txt").exists());
        assert!(!to.join("mods/nested").exists());
    }

    #[cfg(unix)]
    #[test]
    fn permissions_are_normalized_and_escaping_links_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("run.sh");
        std::fs::write(&file, b"#!/bin/sh").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o777)).unwrap();
        normalize_permissions(dir.path()).unwrap();
        assert_eq!(
            std::fs::metadata(&file).unwrap().permissions().mode() & 0o777,
            0o755
        );

        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("escape")).unwrap();
        assert!(normalize_permissions(dir.path()).is_err());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
