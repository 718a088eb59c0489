use crate::config::Overrides;
use crate::error::{PipelineError, StoreError};
use crate::pipeline::{ExtractRequest, FileSource, IngestOutcome, Pipeline};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Content type for the file extensions the extractors understand.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let content_type = match extension.as_str() {
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(content_type)
}

/// Every file under `folder` with a known content type, sorted.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| content_type_for(entry.path()).is_some())
        .map(|entry| entry.path().to_path_buf())
        .collect();

    files.sort_unstable();
    files
}

#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct FolderReport {
    pub ingested: Vec<(PathBuf, IngestOutcome)>,
    pub skipped: Vec<SkippedFile>,
}

/// Runs the full pipeline over a folder, best effort: a file that fails is
/// recorded and the rest continue. Cancellation stops the walk.
pub async fn ingest_folder(
    pipeline: &Pipeline,
    folder: &Path,
    overrides: &Overrides,
    cancel: &CancellationToken,
) -> Result<FolderReport, PipelineError> {
    let files = discover_files(folder);
    if files.is_empty() {
        return Err(PipelineError::InvalidRequest(format!(
            "no supported files found in {}",
            folder.display()
        )));
    }

    let mut report = FolderReport::default();
    for path in files {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let content_type = content_type_for(&path).unwrap_or("application/octet-stream");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                report.skipped.push(SkippedFile {
                    reason: StoreError::Io(error).to_string(),
                    path,
                });
                continue;
            }
        };

        let request = ExtractRequest {
            source: FileSource::Inline(bytes),
            content_type: content_type.to_string(),
            source_ref: Some(path.to_string_lossy().to_string()),
            overrides: overrides.clone(),
        };
        match pipeline.ingest(request, cancel).await {
            Ok(outcome) => report.ingested.push((path, outcome)),
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping file");
                report.skipped.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        folder = %folder.display(),
        ingested = report.ingested.len(),
        skipped = report.skipped.len(),
        "folder ingestion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::registry::ProviderRegistry;
    use crate::stores::MemoryChunkStore;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn pipeline() -> Pipeline {
        let config = PipelineConfig::default();
        let registry = ProviderRegistry::local(&config);
        Pipeline::new(config, registry, Arc::new(MemoryChunkStore::new()))
    }

    #[test]
    fn discovery_is_recursive_and_ignores_unknown_types() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        fs::write(nested.join("b.PDF"), b"%PDF-1.4\n%fake")?;
        fs::write(nested.join("c.bin"), b"\x00\x01")?;

        let files = discover_files(dir.path());
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for(Path::new("scan.JPG")), Some("image/jpeg"));
        assert_eq!(content_type_for(Path::new("notes.md")), Some("text/markdown"));
        assert_eq!(content_type_for(Path::new("archive.zip")), None);
        assert_eq!(content_type_for(Path::new("README")), None);
    }

    #[tokio::test]
    async fn empty_folder_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = ingest_folder(&pipeline(), dir.path(), &Overrides::default(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::InvalidRequest(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_pdf_is_skipped_and_text_is_indexed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        fs::write(dir.path().join("notes.txt"), b"The compressor runs at 3000 rpm.")?;

        let report = ingest_folder(&pipeline(), dir.path(), &Overrides::default(), &CancellationToken::new()).await?;

        assert_eq!(report.ingested.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            report.skipped[0].path.file_name().and_then(|name| name.to_str()),
            Some("broken.pdf")
        );
        let (_, outcome) = &report.ingested[0];
        assert_eq!(outcome.index.as_ref().map(|index| index.chunks_embedded), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_walk_stops() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ingest_folder(&pipeline(), dir.path(), &Overrides::default(), &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        Ok(())
    }
}
