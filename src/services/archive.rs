// ZIP delivery of a finished batch's working folder

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::errors::{ArchiveError, ArchiveResult};
use crate::core::types::BatchId;

/// Extensions picked up by the archive, compared case-insensitively
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];

/// Builds `processed_images_<id>.zip` from `processed_images_<id>/` under the upload folder
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    upload_folder: PathBuf,
}

impl ArchiveBuilder {
    pub fn new(upload_folder: impl Into<PathBuf>) -> Self {
        Self {
            upload_folder: upload_folder.into(),
        }
    }

    pub fn upload_folder(&self) -> &Path {
        &self.upload_folder
    }

    pub fn working_folder(&self, batch_id: &BatchId) -> PathBuf {
        self.upload_folder.join(batch_id.folder_name())
    }

    pub fn archive_path(&self, batch_id: &BatchId) -> PathBuf {
        self.upload_folder.join(batch_id.archive_name())
    }

    /// Zip the batch's images and return the archive bytes. On success the
    /// working folder and the archive file are removed. On failure only a
    /// partial archive is removed, so the images stay for a retry.
    /// A missing working folder gives an empty archive.
    pub async fn build(&self, batch_id: &BatchId) -> ArchiveResult<Vec<u8>> {
        let folder = self.working_folder(batch_id);
        let zip_path = self.archive_path(batch_id);

        match self.write_and_read(&folder, &zip_path).await {
            Ok(bytes) => {
                self.remove_folder(&folder).await;
                self.remove_zip(&zip_path).await;
                info!("Archive for batch {} built ({} bytes)", batch_id, bytes.len());
                Ok(bytes)
            }
            Err(e) => {
                self.remove_zip(&zip_path).await;
                warn!("Archive for batch {} failed, images kept: {}", batch_id, e);
                Err(e)
            }
        }
    }

    /// Delete a batch's working folder and any leftover archive without zipping
    pub async fn discard(&self, batch_id: &BatchId) {
        self.remove_folder(&self.working_folder(batch_id)).await;
        self.remove_zip(&self.archive_path(batch_id)).await;
    }

    async fn write_and_read(&self, folder: &Path, zip_path: &Path) -> ArchiveResult<Vec<u8>> {
        if let Some(parent) = zip_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ArchiveError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let (folder_owned, zip_owned) = (folder.to_path_buf(), zip_path.to_path_buf());
        let entries = tokio::task::spawn_blocking(move || write_archive(&folder_owned, &zip_owned))
            .await
            .map_err(|e| ArchiveError::TaskJoinFailed(e.to_string()))??;
        debug!("Wrote {} entries to {}", entries, zip_path.display());

        tokio::fs::read(zip_path)
            .await
            .map_err(|source| ArchiveError::Io {
                path: zip_path.display().to_string(),
                source,
            })
    }

    async fn remove_folder(&self, folder: &Path) {
        if folder.is_dir() {
            if let Err(e) = tokio::fs::remove_dir_all(folder).await {
                warn!("Failed to remove working folder {}: {}", folder.display(), e);
            }
        }
    }

    async fn remove_zip(&self, zip_path: &Path) {
        if zip_path.is_file() {
            if let Err(e) = tokio::fs::remove_file(zip_path).await {
                warn!("Failed to remove archive {}: {}", zip_path.display(), e);
            }
        }
    }
}

/// Write every image under `folder` into a new ZIP at `zip_path`, stored at
/// its `/`-separated path relative to `folder`. Returns the entry count.
pub fn write_archive(folder: &Path, zip_path: &Path) -> ArchiveResult<usize> {
    let file = File::create(zip_path).map_err(|source| ArchiveError::Io {
        path: zip_path.display().to_string(),
        source,
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut images = Vec::new();
    if folder.is_dir() {
        collect_images(folder, &mut images)?;
    }
    images.sort();

    for path in &images {
        let name = entry_name(folder, path);
        let data = std::fs::read(path).map_err(|source| ArchiveError::Io {
            path: path.display().to_string(),
            source,
        })?;
        zip.start_file(name, options)?;
        zip.write_all(&data).map_err(|source| ArchiveError::Io {
            path: zip_path.display().to_string(),
            source,
        })?;
    }

    let mut writer = zip.finish()?;
    writer.flush().map_err(|source| ArchiveError::Io {
        path: zip_path.display().to_string(),
        source,
    })?;

    Ok(images.len())
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> ArchiveResult<()> {
    let io_err = |source| ArchiveError::Io {
        path: dir.display().to_string(),
        source,
    };

    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if is_image(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn entry_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entry_names(bytes: Vec<u8>) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_is_image_ignores_case() {
        assert!(is_image(Path::new("a/b/photo.JPG")));
        assert!(is_image(Path::new("photo.jpeg")));
        assert!(is_image(Path::new("photo.Gif")));
        assert!(!is_image(Path::new("notes.txt")));
        assert!(!is_image(Path::new("no_extension")));
    }

    #[tokio::test]
    async fn test_build_keeps_relative_paths_and_cleans_up() {
        let upload = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(upload.path());
        let batch = BatchId::new(1_700_000_000, 0);

        let folder = builder.working_folder(&batch);
        std::fs::create_dir_all(folder.join("object_id_1")).unwrap();
        std::fs::create_dir_all(folder.join("object_id_2")).unwrap();
        std::fs::write(folder.join("object_id_1/a.jpg"), b"jpg").unwrap();
        std::fs::write(folder.join("object_id_2/b.PNG"), b"png").unwrap();
        std::fs::write(folder.join("object_id_2/readme.txt"), b"skip me").unwrap();

        let bytes = builder.build(&batch).await.unwrap();

        assert_eq!(
            entry_names(bytes),
            vec!["object_id_1/a.jpg".to_string(), "object_id_2/b.PNG".to_string()]
        );
        assert!(!folder.exists());
        assert!(!builder.archive_path(&batch).exists());
    }

    #[tokio::test]
    async fn test_missing_folder_gives_empty_archive() {
        let upload = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(upload.path());

        let bytes = builder.build(&BatchId::new(5, 1)).await.unwrap();

        assert!(entry_names(bytes).is_empty());
        assert!(!builder.archive_path(&BatchId::new(5, 1)).exists());
    }

    #[tokio::test]
    async fn test_failed_build_keeps_images() {
        let upload = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(upload.path());
        let batch = BatchId::new(42, 0);

        let folder = builder.working_folder(&batch);
        std::fs::create_dir_all(folder.join("object_id_1")).unwrap();
        std::fs::write(folder.join("object_id_1/a.jpg"), b"jpg").unwrap();
        // A directory where the archive file should go makes the write fail
        std::fs::create_dir_all(builder.archive_path(&batch)).unwrap();

        assert!(builder.build(&batch).await.is_err());
        assert!(folder.join("object_id_1/a.jpg").is_file());

        // Once the obstruction is gone the same batch can be archived
        std::fs::remove_dir(builder.archive_path(&batch)).unwrap();
        let bytes = builder.build(&batch).await.unwrap();
        assert_eq!(entry_names(bytes), vec!["object_id_1/a.jpg".to_string()]);
        assert!(!folder.exists());
    }

    #[tokio::test]
    async fn test_discard_removes_folder() {
        let upload = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(upload.path());
        let batch = BatchId::new(43, 0);

        let folder = builder.working_folder(&batch);
        std::fs::create_dir_all(folder.join("object_id_1")).unwrap();
        std::fs::write(folder.join("object_id_1/a.jpg"), b"jpg").unwrap();

        builder.discard(&batch).await;
        assert!(!folder.exists());
    }

    #[tokio::test]
    async fn test_entry_contents_survive() {
        let upload = tempfile::tempdir().unwrap();
        let builder = ArchiveBuilder::new(upload.path());
        let batch = BatchId::new(9, 0);

        let folder = builder.working_folder(&batch);
        std::fs::create_dir_all(folder.join("object_id_4")).unwrap();
        std::fs::write(folder.join("object_id_4/x.gif"), b"GIF89a-data").unwrap();

        let bytes = builder.build(&batch).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut entry = archive.by_name("object_id_4/x.gif").unwrap();
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
        assert_eq!(content, b"GIF89a-data");
    }
}
