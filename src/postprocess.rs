//! Post-processing: archive extraction and completion handling
//!
//! Receives a job after the engine marks it `processing`, extracts any
//! archives from the incomplete directory into `<complete>/<job-name>/`
//! using external tools (`unrar`, `7z`, `unzip`), relocates loose files,
//! and owns the job's final `completed`/`failed` transition. Extraction
//! progress is published to the queue store's in-memory map for the
//! control plane.

use crate::config::PostProcessConfig;
use crate::error::{Error, Result};
use crate::nzb::Nzb;
use crate::queue::{Download, QueueStore};
use crate::types::Status;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

/// Extracts finished downloads into the completion directory
#[derive(Clone)]
pub struct PostProcessor {
    store: Arc<QueueStore>,
    complete_dir: PathBuf,
    config: PostProcessConfig,
}

/// Archive kinds handled by the extractor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    Rar,
    Zip,
    SevenZip,
}

impl PostProcessor {
    /// Create a post-processor writing into `complete_dir`
    pub fn new(store: Arc<QueueStore>, complete_dir: PathBuf, config: PostProcessConfig) -> Self {
        Self {
            store,
            complete_dir,
            config,
        }
    }

    /// Process a job on a background task
    pub fn spawn(&self, download: Download) {
        let processor = self.clone();
        tokio::spawn(async move { processor.process(download).await });
    }

    /// Extract and relocate one finished job, then record the terminal
    /// status. The archive password, if any, comes from the job's NZB
    /// metadata.
    pub async fn process(&self, download: Download) {
        let id = download.download_id();
        let password = Nzb::parse(&download.raw_nzb)
            .ok()
            .and_then(|plan| plan.password());

        match self.run(&download, password.as_deref()).await {
            Ok(()) => {
                info!(download_id = %id, "post-processing complete");
                if let Err(e) = self.store.update_status(&id, Status::Completed).await {
                    error!(download_id = %id, error = %e, "failed to mark completed");
                }
            }
            Err(e) => {
                warn!(download_id = %id, error = %e, "post-processing failed");
                let _ = self.store.set_error(&id, &e.to_string()).await;
            }
        }
        self.store.clear_extract_progress(&id);
    }

    async fn run(&self, download: &Download, password: Option<&str>) -> Result<()> {
        let source = PathBuf::from(&download.path);
        if download.path.is_empty() || !source.is_dir() {
            return Err(Error::PostProcess(format!(
                "download directory missing: {}",
                download.path
            )));
        }

        let destination = self.complete_dir.join(&download.name);
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| Error::PostProcess(format!("creating completion directory: {e}")))?;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&source)
            .await
            .map_err(|e| Error::PostProcess(format!("reading {}: {e}", source.display())))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::PostProcess(format!("reading {}: {e}", source.display())))?
        {
            if entry.path().is_file() {
                entries.push(entry.path());
            }
        }

        let archives: Vec<(PathBuf, ArchiveKind)> = entries
            .iter()
            .filter_map(|path| first_volume_kind(path).map(|kind| (path.clone(), kind)))
            .collect();

        for (archive, kind) in &archives {
            self.extract(&download.download_id(), archive, *kind, &destination, password)
                .await?;
        }

        // Loose files (and everything when there are no archives) move over
        for path in &entries {
            if is_archive_volume(path) {
                continue;
            }
            move_file(path, &destination).await?;
        }

        if self.config.delete_archives && !archives.is_empty() {
            for path in &entries {
                if is_archive_volume(path) {
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        warn!(path = %path.display(), error = %e, "failed to delete archive");
                    }
                }
            }
        }

        Ok(())
    }

    async fn extract(
        &self,
        id: &crate::types::DownloadId,
        archive: &Path,
        kind: ArchiveKind,
        destination: &Path,
        password: Option<&str>,
    ) -> Result<()> {
        let basename = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(archive = %basename, "extracting");
        self.store.set_extract_progress(id, 0.0, &basename);

        let mut command = match kind {
            ArchiveKind::Rar => {
                let mut cmd = Command::new(&self.config.unrar);
                cmd.arg("x").arg("-y").arg("-o+");
                match password {
                    Some(pw) => cmd.arg(format!("-p{pw}")),
                    None => cmd.arg("-p-"),
                };
                cmd.arg(archive).arg(destination);
                cmd
            }
            ArchiveKind::SevenZip => {
                let mut cmd = Command::new(&self.config.sevenzip);
                cmd.arg("x").arg("-y");
                cmd.arg(format!("-o{}", destination.display()));
                if let Some(pw) = password {
                    cmd.arg(format!("-p{pw}"));
                }
                cmd.arg(archive);
                cmd
            }
            ArchiveKind::Zip => {
                let mut cmd = Command::new(&self.config.unzip);
                cmd.arg("-o");
                if let Some(pw) = password {
                    cmd.arg("-P").arg(pw);
                }
                cmd.arg(archive).arg("-d").arg(destination);
                cmd
            }
        };

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::PostProcess(format!("launching extractor for {basename}: {e}"))
            })?;

        // unrar prints running percentages; surface them while it works
        if let Some(stdout) = child.stdout.take() {
            let store = self.store.clone();
            let id = id.clone();
            let file = basename.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(percent) = parse_percent(&line) {
                        store.set_extract_progress(&id, percent, &file);
                    }
                }
            });
        }

        let mut stderr_text = String::new();
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_text.len() < 512 {
                    stderr_text.push_str(line.trim());
                    stderr_text.push(' ');
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::PostProcess(format!("waiting for extractor: {e}")))?;
        if !status.success() {
            return Err(Error::PostProcess(format!(
                "extraction of {basename} failed ({}): {}",
                status,
                stderr_text.trim()
            )));
        }

        self.store.set_extract_progress(id, 100.0, &basename);
        Ok(())
    }
}

/// The archive kind if `path` is the first volume of an archive set.
/// Later RAR volumes (`.part02.rar`, `.r00`) extract implicitly with the
/// first and are skipped here.
fn first_volume_kind(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    if let Some(stem) = name.strip_suffix(".rar") {
        if let Some(idx) = stem.rfind(".part") {
            let digits = &stem[idx + 5..];
            if digits.chars().all(|c| c.is_ascii_digit()) && !digits.is_empty() {
                return digits.parse::<u32>().ok().filter(|&n| n == 1).map(|_| ArchiveKind::Rar);
            }
        }
        return Some(ArchiveKind::Rar);
    }
    if name.ends_with(".zip") {
        return Some(ArchiveKind::Zip);
    }
    if name.ends_with(".7z") {
        return Some(ArchiveKind::SevenZip);
    }
    None
}

/// Whether `path` belongs to any archive set (for relocation/deletion)
fn is_archive_volume(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().to_lowercase(),
        None => return false,
    };
    if name.ends_with(".rar") || name.ends_with(".zip") || name.ends_with(".7z") {
        return true;
    }
    // .r00 .r01 ... split volumes
    if let Some(idx) = name.rfind(".r") {
        let digits = &name[idx + 2..];
        return !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
    }
    false
}

/// Pull a trailing "NN%" progress figure out of an extractor output line
fn parse_percent(line: &str) -> Option<f64> {
    let idx = line.rfind('%')?;
    let head = &line[..idx];
    let start = head
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let digits = &head[start..];
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok().filter(|p| (0.0..=100.0).contains(p))
}

/// Move a file into `destination`, falling back to copy+remove across
/// filesystems
async fn move_file(source: &Path, destination: &Path) -> Result<()> {
    let Some(name) = source.file_name() else {
        return Ok(());
    };
    let target = destination.join(name);
    match tokio::fs::rename(source, &target).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(source, &target)
                .await
                .map_err(|e| Error::PostProcess(format!("moving {}: {e}", source.display())))?;
            tokio::fs::remove_file(source).await.ok();
            Ok(())
        }
    }
}
