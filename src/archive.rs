//! Archive splicing
//!
//! An archive found during the walk is treated as a transparent container:
//! its contents are extracted next to it, walked at the same depth and with
//! the same context as the archive itself, and removed again afterwards.
//!
//! ## Sequence
//!
//! 1. If a sibling directory with the archive's base name exists, the
//!    archive is skipped (its contents are already laid out by hand),
//!    unless that directory carries the [`SPLICE_MARKER`] of an earlier
//!    splice that never finished. Such a leftover is discarded and the
//!    archive is spliced again
//! 2. The marker is written and the codec validates and extracts into the
//!    sibling directory
//! 3. The walker recurses into the sibling directory
//! 4. The extracted directory is deleted from the source tree
//! 5. With recompression on, the mirrored output directory is packed into
//!    `output/<rel>/<name>.zip` and deleted
//!
//! A failure in steps 2, 4 or 5 is recorded as an error entry with action
//! `unzip` and the parent walk continues. Failures of the durable log
//! raised while recursing propagate.
//!
//! ## Codec
//!
//! [`ArchiveCodec`] is the seam for the container format. [`ZipCodec`]
//! checks the size and the `PK\x03\x04` / `PK\x05\x06` signature before
//! decoding and refuses members whose names would escape the destination.

use crate::error::{ArchiveError, ArchiveErrorKind, Result, WalkError};
use crate::progress::ProgressStore;
use crate::types::{ErrorContext, TraversalContext, WalkSummary};
use crate::utils::{is_contained, make_relative, mirror_path, remove_dir_if_exists};
use async_trait::async_trait;
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Local file header signature
const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
/// End of central directory signature (archive with no members)
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// File left in an extraction directory until its splice has finished
///
/// It holds the archive's file name. The walker does not descend into a
/// directory carrying it while that archive sits next to it.
pub const SPLICE_MARKER: &str = ".assetwalk-splice";

/// Result type of codec operations
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Container format primitives
#[async_trait]
pub trait ArchiveCodec: Send + Sync {
    /// Check that `archive` looks decodable without decoding it
    async fn validate(&self, archive: &Path) -> ArchiveResult<()>;

    /// Validate `archive` and extract it into `dest`
    async fn extract(&self, archive: &Path, dest: &Path) -> ArchiveResult<()>;

    /// Pack the contents of `source_dir` into `archive`
    async fn create(&self, source_dir: &Path, archive: &Path) -> ArchiveResult<()>;
}

/// ZIP codec backed by the `zip` crate
///
/// Decoding and encoding run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipCodec;

#[async_trait]
impl ArchiveCodec for ZipCodec {
    async fn validate(&self, archive: &Path) -> ArchiveResult<()> {
        let archive = archive.to_path_buf();
        run_blocking(&archive.clone(), ArchiveErrorKind::DecodeFailure, move || {
            validate_zip(&archive)
        })
        .await
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> ArchiveResult<()> {
        let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
        run_blocking(&archive.clone(), ArchiveErrorKind::DecodeFailure, move || {
            validate_zip(&archive)?;
            extract_zip(&archive, &dest)
        })
        .await
    }

    async fn create(&self, source_dir: &Path, archive: &Path) -> ArchiveResult<()> {
        let (source_dir, archive) = (source_dir.to_path_buf(), archive.to_path_buf());
        run_blocking(&archive.clone(), ArchiveErrorKind::EncodeFailure, move || {
            create_zip(&source_dir, &archive)
        })
        .await
    }
}

async fn run_blocking<F>(archive: &Path, kind: ArchiveErrorKind, f: F) -> ArchiveResult<()>
where
    F: FnOnce() -> ArchiveResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArchiveError::new(kind, archive, e.to_string()))?
}

fn validate_zip(archive: &Path) -> ArchiveResult<()> {
    let decode = |e: io::Error| ArchiveError::new(ArchiveErrorKind::DecodeFailure, archive, e.to_string());

    let len = fs::metadata(archive).map_err(decode)?.len();
    if len == 0 {
        return Err(ArchiveError::new(ArchiveErrorKind::Empty, archive, "zero bytes"));
    }

    let mut magic = [0u8; 4];
    let mut file = File::open(archive).map_err(decode)?;
    let read = file.read(&mut magic).map_err(decode)?;
    if read < magic.len() || (magic != ZIP_MAGIC && magic != ZIP_EMPTY_MAGIC) {
        return Err(ArchiveError::new(
            ArchiveErrorKind::BadSignature,
            archive,
            format!("unexpected header {:02x?}", &magic[..read]),
        ));
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path) -> ArchiveResult<()> {
    let decode = |detail: String| ArchiveError::new(ArchiveErrorKind::DecodeFailure, archive_path, detail);

    let file = File::open(archive_path).map_err(|e| decode(e.to_string()))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| decode(e.to_string()))?;
    fs::create_dir_all(dest).map_err(|e| decode(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| decode(e.to_string()))?;
        let relative = match entry.enclosed_name() {
            Some(p) if is_contained(&p) => p,
            _ => {
                return Err(decode(format!(
                    "member {:?} escapes the destination",
                    entry.name()
                )))
            }
        };

        let out_path = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| decode(e.to_string()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| decode(e.to_string()))?;
        }
        let mut out = File::create(&out_path).map_err(|e| decode(e.to_string()))?;
        io::copy(&mut entry, &mut out).map_err(|e| decode(format!("{:?}: {}", relative, e)))?;
    }

    debug!("Extracted {} members of {:?} into {:?}", archive.len(), archive_path, dest);
    Ok(())
}

fn create_zip(source_dir: &Path, archive_path: &Path) -> ArchiveResult<()> {
    let encode = |detail: String| ArchiveError::new(ArchiveErrorKind::EncodeFailure, archive_path, detail);

    let parent = archive_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| encode(e.to_string()))?;

    let temp = NamedTempFile::new_in(parent).map_err(|e| encode(e.to_string()))?;
    let mut writer = ZipWriter::new(BufWriter::new(temp));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut members = 0;
    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| encode(e.to_string()))?;
        let relative = make_relative(entry.path(), source_dir).map_err(|e| encode(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|e| encode(e.to_string()))?;
        } else {
            writer
                .start_file(name, options)
                .map_err(|e| encode(e.to_string()))?;
            let mut input = File::open(entry.path()).map_err(|e| encode(e.to_string()))?;
            io::copy(&mut input, &mut writer).map_err(|e| encode(e.to_string()))?;
            members += 1;
        }
    }

    let buffered = writer.finish().map_err(|e| encode(e.to_string()))?;
    let temp = buffered
        .into_inner()
        .map_err(|e| encode(e.error().to_string()))?;
    temp.as_file().sync_all().map_err(|e| encode(e.to_string()))?;
    temp.persist(archive_path).map_err(|e| encode(e.error.to_string()))?;

    debug!("Packed {} files from {:?} into {:?}", members, source_dir, archive_path);
    Ok(())
}

/// Splices archives into the walk
pub struct ArchiveStage {
    codec: Arc<dyn ArchiveCodec>,
    store: Arc<ProgressStore>,
    source_root: PathBuf,
    output_root: PathBuf,
    recompress: bool,
}

impl ArchiveStage {
    /// Create a stage mapping `source_root` onto `output_root`
    pub fn new(
        codec: Arc<dyn ArchiveCodec>,
        store: Arc<ProgressStore>,
        source_root: PathBuf,
        output_root: PathBuf,
        recompress: bool,
    ) -> Self {
        Self {
            codec,
            store,
            source_root,
            output_root,
            recompress,
        }
    }

    /// Directory an archive extracts into
    pub fn sibling_dir(archive: &Path) -> PathBuf {
        archive.with_extension("")
    }

    /// Whether `dir` is the extraction of an archive next to it whose
    /// splice was interrupted
    pub async fn is_unfinished_splice(dir: &Path) -> bool {
        let Ok(marker) = tokio::fs::read_to_string(dir.join(SPLICE_MARKER)).await else {
            return false;
        };
        let (name, Some(parent)) = (marker.trim(), dir.parent()) else {
            return false;
        };
        let archive = parent.join(name);
        !name.is_empty()
            && Self::sibling_dir(&archive) == dir
            && tokio::fs::metadata(&archive)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
    }

    /// Extract, walk and clean up one archive
    ///
    /// `walk` is called with the extraction directory and must walk it at
    /// the archive's own depth and context. Archive failures are recorded
    /// and reflected in the returned summary; only errors from `walk` and
    /// from the durable log are returned.
    pub async fn splice<F, Fut>(&self, archive: &Path, ctx: &TraversalContext, walk: F) -> Result<WalkSummary>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<WalkSummary>>,
    {
        let mut summary = WalkSummary::default();
        let extracted = Self::sibling_dir(archive);

        if tokio::fs::try_exists(&extracted).await.unwrap_or(false) {
            if !Self::is_unfinished_splice(&extracted).await {
                debug!("Skipping {:?}: {:?} already exists", archive, extracted);
                summary.archives_skipped += 1;
                return Ok(summary);
            }
            info!("Resuming interrupted splice of {:?}", archive);
            if let Err(e) = remove_dir_if_exists(&extracted) {
                self.record_failure(archive, ctx, &e)?;
                summary.archives_failed += 1;
                return Ok(summary);
            }
        }

        info!("Extracting {:?}", archive);
        if let Err(e) = self.extract(archive, &extracted).await {
            if let Err(cleanup) = remove_dir_if_exists(&extracted) {
                warn!("Could not remove partial extraction {:?}: {}", extracted, cleanup);
            }
            self.record_failure(archive, ctx, &e)?;
            summary.archives_failed += 1;
            return Ok(summary);
        }

        let inner = walk(extracted.clone()).await?;
        summary.merge(&inner);

        // Cleanup and recompression failures stay local to this archive
        match self.finish(archive, &extracted).await {
            Ok(()) => summary.archives_spliced += 1,
            Err(e) => {
                self.record_failure(archive, ctx, &e)?;
                summary.archives_failed += 1;
            }
        }
        Ok(summary)
    }

    async fn extract(&self, archive: &Path, extracted: &Path) -> Result<()> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::fs::create_dir_all(extracted).await?;
        tokio::fs::write(extracted.join(SPLICE_MARKER), name).await?;
        self.codec.extract(archive, extracted).await?;
        Ok(())
    }

    async fn finish(&self, archive: &Path, extracted: &Path) -> Result<()> {
        remove_dir_if_exists(extracted)?;
        debug!("Removed extracted source {:?}", extracted);

        if !self.recompress {
            return Ok(());
        }

        let output_dir = mirror_path(extracted, &self.source_root, &self.output_root)?;
        if !tokio::fs::try_exists(&output_dir).await.unwrap_or(false) {
            debug!("Nothing to recompress for {:?}", archive);
            return Ok(());
        }

        let output_archive = mirror_path(archive, &self.source_root, &self.output_root)?;
        self.codec.create(&output_dir, &output_archive).await?;
        remove_dir_if_exists(&output_dir)?;
        info!("Recompressed output into {:?}", output_archive);
        Ok(())
    }

    fn record_failure(&self, archive: &Path, ctx: &TraversalContext, error: &WalkError) -> Result<()> {
        warn!("Archive {:?} failed: {}", archive, error);
        self.store.log_error(
            error.to_string(),
            Some(format!("{:?}", error)),
            ErrorContext::new("unzip", Some(archive)).within(ctx),
        )
    }
}
