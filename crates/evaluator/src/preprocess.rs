//! Folder preprocessing: scan a folder tree, validate each file, create the
//! document inventory, and encode valid documents into the work store.

use anyhow::Context;
use models::{FolderStatus, Validity};
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Fallback allow-list used when the document_types catalog table is empty
/// or unreachable at startup.
const DEFAULT_EXTENSIONS: &[&str] = &[
    ".pdf", ".txt", ".docx", ".doc", ".xlsx", ".xls", ".pptx", ".ppt", ".rtf", ".odt", ".ods",
    ".odp", ".csv", ".tsv", ".json", ".xml", ".html", ".htm", ".md",
];

/// In-memory cache of the valid-extension set, refreshed explicitly.
pub struct DocumentTypeCache(RwLock<HashSet<String>>);

impl DocumentTypeCache {
    pub fn new() -> Self {
        Self(RwLock::new(
            DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        ))
    }

    /// Reload the set from the document_types table. On error the previous
    /// set stays in effect.
    pub async fn refresh(&self, catalog: &sqlx::PgPool) -> anyhow::Result<usize> {
        let extensions = eval_sql::document_types::valid_extensions(catalog)
            .await
            .context("loading valid extensions from document_types")?;
        if extensions.is_empty() {
            tracing::warn!("document_types table is empty, keeping current extension set");
            return Ok(self.0.read().unwrap().len());
        }
        let set: HashSet<String> = extensions
            .into_iter()
            .map(|e| e.to_ascii_lowercase())
            .collect();
        let len = set.len();
        *self.0.write().unwrap() = set;
        Ok(len)
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.0.read().unwrap().contains(extension)
    }
}

impl Default for DocumentTypeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a scanned file was rejected. The text forms are persisted into the
/// document's metadata for later inspection.
#[derive(Debug, PartialEq, Eq)]
pub enum InvalidReason {
    Empty,
    TooLarge,
    UnsupportedType(String),
    Unreadable(String),
}

impl InvalidReason {
    pub fn as_text(&self) -> String {
        match self {
            InvalidReason::Empty => "file is empty".to_string(),
            InvalidReason::TooLarge => format!("file exceeds {} bytes", MAX_FILE_SIZE),
            InvalidReason::UnsupportedType(ext) => format!("unsupported file type: {ext}"),
            InvalidReason::Unreadable(err) => format!("file not readable: {err}"),
        }
    }
}

/// Apply the validation rules in their documented order: non-empty, size
/// bound, extension allow-list, readability. The first failure wins.
pub fn validate_file(
    path: &Path,
    size: u64,
    types: &DocumentTypeCache,
) -> Result<(), InvalidReason> {
    if size == 0 {
        return Err(InvalidReason::Empty);
    }
    if size > MAX_FILE_SIZE {
        return Err(InvalidReason::TooLarge);
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    if !types.contains(&extension) {
        return Err(InvalidReason::UnsupportedType(extension));
    }
    // Probe readability with a one-byte read; permissions and dangling
    // symlinks both surface here rather than at encode time.
    use std::io::Read;
    match std::fs::File::open(path) {
        Ok(mut file) => {
            let mut probe = [0u8; 1];
            if let Err(err) = file.read(&mut probe) {
                return Err(InvalidReason::Unreadable(err.to_string()));
            }
        }
        Err(err) => return Err(InvalidReason::Unreadable(err.to_string())),
    }
    Ok(())
}

#[derive(Debug, Default, serde::Serialize)]
pub struct PreprocessOutcome {
    pub folder_id: i32,
    pub total_files: usize,
    pub valid_files: usize,
    pub invalid_files: usize,
    pub errors: Vec<String>,
}

/// Run the preprocessing pipeline for one folder.
///
/// Each file is its own unit of work: a failure to persist or encode one
/// file is recorded and the walk continues. The folder commits its
/// PREPROCESSING transition up front so concurrent observers see it, and
/// lands on READY or ERROR at the end.
#[tracing::instrument(skip(app, types), err)]
pub async fn preprocess_folder(
    app: &crate::App,
    types: &DocumentTypeCache,
    folder_id: i32,
) -> anyhow::Result<PreprocessOutcome> {
    let folder = eval_sql::folders::fetch(folder_id, &app.catalog)
        .await?
        .with_context(|| format!("folder {folder_id} not found"))?;

    let root = std::path::PathBuf::from(&folder.folder_path);
    if !root.is_dir() {
        eval_sql::folders::set_status(folder_id, FolderStatus::Error, &app.catalog).await?;
        anyhow::bail!("folder path is not a directory: {}", folder.folder_path);
    }

    // Commit PREPROCESSING immediately; a re-preprocess of a READY or ERROR
    // folder is forced rather than transitioned.
    if !eval_sql::folders::transition(
        folder_id,
        FolderStatus::NotProcessed,
        FolderStatus::Preprocessing,
        &app.catalog,
    )
    .await?
    {
        eval_sql::folders::set_status(folder_id, FolderStatus::Preprocessing, &app.catalog).await?;
    }

    let result = walk_and_ingest(app, types, folder_id, &root).await;

    match &result {
        Ok(outcome) => {
            eval_sql::folders::transition(
                folder_id,
                FolderStatus::Preprocessing,
                FolderStatus::Ready,
                &app.catalog,
            )
            .await?;
            tracing::info!(
                folder_id,
                valid = outcome.valid_files,
                invalid = outcome.invalid_files,
                "folder preprocessing completed"
            );
        }
        Err(err) => {
            tracing::error!(folder_id, ?err, "folder preprocessing failed");
            eval_sql::folders::set_status(folder_id, FolderStatus::Error, &app.catalog).await?;
        }
    }
    result
}

async fn walk_and_ingest(
    app: &crate::App,
    types: &DocumentTypeCache,
    folder_id: i32,
    root: &Path,
) -> anyhow::Result<PreprocessOutcome> {
    // The walk itself is blocking filesystem work.
    let root_owned = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || scan_files(&root_owned))
        .await
        .context("folder scan task panicked")?;

    let mut outcome = PreprocessOutcome {
        folder_id,
        total_files: files.len(),
        ..Default::default()
    };

    for (path, size) in files {
        let filepath = path.to_string_lossy().to_string();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filepath.clone());

        let verdict = validate_file(&path, size, types);
        let (valid, reason) = match &verdict {
            Ok(()) => (Validity::Valid, "ok".to_string()),
            Err(reason) => {
                let text = reason.as_text();
                tracing::debug!(file = %filepath, reason = %text, "invalid file");
                (Validity::Invalid, text)
            }
        };
        // The verdict's reason rides in the document metadata for later
        // inspection; "ok" marks a file that passed every rule.
        let meta_data = serde_json::json!({ "validation": reason, "size": size });

        let persisted: anyhow::Result<()> = async {
            let document_id = eval_sql::documents::upsert(
                folder_id,
                &filepath,
                &filename,
                valid,
                &meta_data,
                &app.catalog,
            )
            .await?;

            if valid == Validity::Valid {
                let key = format!("doc_{document_id}");
                let body_id = crate::encode::encode_and_store(&key, &filepath, &app.work).await?;
                eval_sql::documents::set_encoded_body(document_id, body_id, &app.catalog).await?;
            }
            Ok(())
        }
        .await;

        match persisted {
            Ok(()) if valid == Validity::Valid => outcome.valid_files += 1,
            Ok(()) => outcome.invalid_files += 1,
            Err(err) => {
                outcome.errors.push(format!("{filepath}: {err:#}"));
                outcome.invalid_files += 1;
            }
        }
    }

    Ok(outcome)
}

/// Collect regular files under the root with their sizes. Hidden directories
/// are skipped; walk errors on individual entries are logged and skipped so
/// one unreadable subtree does not poison the inventory.
fn scan_files(root: &Path) -> Vec<(std::path::PathBuf, u64)> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(false)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(?err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => files.push((entry.into_path(), meta.len())),
            Err(err) => tracing::warn!(path = %entry.path().display(), ?err, "failed to stat file"),
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn touch(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn validation_order_empty_wins_over_type() {
        let dir = tempfile::tempdir().unwrap();
        let types = DocumentTypeCache::new();
        // Empty AND unsupported: the empty verdict is reported.
        let path = touch(dir.path(), "weird.xyz", b"");
        assert_eq!(
            validate_file(&path, 0, &types),
            Err(InvalidReason::Empty)
        );
    }

    #[test]
    fn oversized_file_is_rejected_without_reading() {
        let dir = tempfile::tempdir().unwrap();
        let types = DocumentTypeCache::new();
        let path = touch(dir.path(), "big.pdf", b"x");
        assert_eq!(
            validate_file(&path, MAX_FILE_SIZE + 1, &types),
            Err(InvalidReason::TooLarge)
        );
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let types = DocumentTypeCache::new();
        let path = touch(dir.path(), "prog.exe", b"MZ");
        assert_eq!(
            validate_file(&path, 2, &types),
            Err(InvalidReason::UnsupportedType(".exe".to_string()))
        );
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let types = DocumentTypeCache::new();
        let path = dir.path().join("ghost.txt");
        assert!(matches!(
            validate_file(&path, 10, &types),
            Err(InvalidReason::Unreadable(_))
        ));
    }

    #[test]
    fn valid_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let types = DocumentTypeCache::new();
        let path = touch(dir.path(), "report.pdf", b"%PDF-1.4");
        assert_eq!(validate_file(&path, 8, &types), Ok(()));
    }

    #[test]
    fn scan_skips_hidden_directories_and_non_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.txt", b"a");
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("sub"), "b.txt", b"b");
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        touch(&dir.path().join(".hidden"), "c.txt", b"c");

        let files = scan_files(dir.path());
        let names: Vec<String> = files
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }
}
