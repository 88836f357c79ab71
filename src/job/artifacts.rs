use std::io::{self, Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use mime::Mime;
use mime_classifier::{ApacheBugFlag, LoadContext, MimeClassifier, NoSniffFlag};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncReadExt;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::xattrs::{self, ARTIFACTS_ATTR};

/// How much of a file the MIME probe reads.
const PROBE_LEN: usize = 2048;

/// Properties of one declared artifact present under the job's root mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// Access to the artifacts a job declared: listing with MIME probing,
/// in-memory archiving, and hard-link hand-off between jobs.
#[derive(Clone, derive_more::Debug)]
pub struct Artifacts {
    store: Store,
    #[debug("MimeClassifier")]
    classifier: Arc<MimeClassifier>,
}

impl Artifacts {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            classifier: Arc::new(MimeClassifier::new()),
        }
    }

    /// Artifact paths declared on a job. Declared-but-absent metadata is
    /// an error here, unlike in the job projection: artifact endpoints
    /// are meaningless without a declaration.
    fn declared(&self, id: u64) -> Result<Vec<String>> {
        let properties = self.store.properties_path(id);
        match xattrs::get_string(&properties, ARTIFACTS_ATTR)? {
            Some(raw) if !raw.is_empty() => Ok(raw.split(',').map(str::to_string).collect()),
            _ => Err(Error::not_found("No artifacts found")),
        }
    }

    /// Declared artifacts that exist under the job's root mount. Missing
    /// files are omitted, never invented.
    pub async fn list(&self, id: u64) -> Result<Vec<ArtifactInfo>> {
        let root = self.store.root_mount(id);
        if !fs::try_exists(&root).await? {
            return Err(Error::not_found("Artifacts not found"));
        }
        let mut infos = Vec::new();
        for name in self.declared(id)? {
            let path = root.join(&name);
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let mime_type = self.probe(&name, &path).await?;
            infos.push(ArtifactInfo {
                name,
                size: meta.len(),
                mime_type,
            });
        }
        Ok(infos)
    }

    /// Classify a file by its extension, refined against its leading bytes.
    async fn probe(&self, name: &str, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut data = vec![0u8; PROBE_LEN];
        let mut read = 0;
        loop {
            let n = file.read(&mut data[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
            if read == data.len() {
                break;
            }
        }
        data.truncate(read);

        let supplied_type: Option<Mime> = Path::new(name)
            .extension()
            .and_then(|ext| mime_guess::from_ext(&ext.to_string_lossy()).first());
        let mime = self.classifier.classify(
            LoadContext::Browsing,
            NoSniffFlag::Off,
            ApacheBugFlag::On,
            &supplied_type,
            &data,
        );
        Ok(mime.to_string())
    }

    /// Deflate-compressed ZIP of every existing declared artifact, built
    /// in memory under the declared names.
    pub async fn archive(&self, id: u64) -> Result<Vec<u8>> {
        let root = self.store.root_mount(id);
        if !fs::try_exists(&root).await? {
            return Err(Error::not_found("Artifacts not found"));
        }
        let names = self.declared(id)?;

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for name in names {
            let data = match fs::read(root.join(&name)).await {
                Ok(data) => data,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            zip.start_file(name.as_str(), options).map_err(io::Error::other)?;
            zip.write_all(&data)?;
        }
        let cursor = zip.finish().map_err(io::Error::other)?;
        Ok(cursor.into_inner())
    }

    /// Convey `src`'s declared artifacts to `dst` as hard links under the
    /// destination root mount, creating parent directories as needed. The
    /// bytes are not copied; the next stage sees the same files under
    /// `/root` inside its container.
    ///
    /// A missing source artifact fails the copy; so does a destination
    /// path that already exists. Links made before a failure are left in
    /// place.
    pub async fn copy(&self, src: u64, dst: u64) -> Result<()> {
        if !fs::try_exists(self.store.job_dir(src)).await? {
            return Err(Error::not_found("Job not found"));
        }
        let src_root = self.store.root_mount(src);
        if !fs::try_exists(&src_root).await? {
            return Err(Error::not_found("Artifacts not found"));
        }
        if !fs::try_exists(self.store.job_dir(dst)).await? {
            return Err(Error::not_found("Destination job not found"));
        }
        let dst_root = self.store.root_mount(dst);
        fs::create_dir_all(&dst_root).await?;

        for name in self.declared(src)? {
            let src_file = src_root.join(&name);
            if !fs::try_exists(&src_file).await? {
                return Err(Error::not_found(format!(
                    "Artifact {name} not found in source job"
                )));
            }
            let dst_file = dst_root.join(&name);
            if fs::try_exists(&dst_file).await? {
                return Err(Error::conflict(format!(
                    "Artifact {name} already exists in destination job"
                )));
            }
            if let Some(parent) = dst_file.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::hard_link(&src_file, &dst_file).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::images::Images;
    use crate::job::{JobProperties, Jobs};
    use crate::test_utils::temp_store;

    async fn job_with_artifacts(jobs: &Jobs, images: &Images, declared: &[&str]) -> u64 {
        let id = jobs.create().unwrap();
        jobs.bind_image(
            id,
            &JobProperties {
                image: "alpine".to_string(),
                artifacts: Some(declared.iter().map(|s| s.to_string()).collect()),
            },
        )
        .await
        .unwrap();
        id
    }

    fn write_artifact(store: &Store, id: u64, name: &str, content: &str) {
        let path = store.root_mount(id).join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_list_omits_missing_files() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let artifacts = Artifacts::new(store.clone());

        let id = job_with_artifacts(&jobs, &images, &["out.txt", "ghost.bin"]).await;
        write_artifact(&store, id, "out.txt", "hi there\n");

        let infos = artifacts.list(id).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "out.txt");
        assert_eq!(infos[0].size, 9);
        assert!(infos[0].mime_type.starts_with("text/"), "{}", infos[0].mime_type);
    }

    #[tokio::test]
    async fn test_list_without_declaration() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let artifacts = Artifacts::new(store.clone());

        let id = jobs.create().unwrap();
        std::fs::create_dir_all(store.root_mount(id)).unwrap();
        let err = artifacts.list(id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_archive_is_deterministic() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let artifacts = Artifacts::new(store.clone());

        let id = job_with_artifacts(&jobs, &images, &["out.txt", "data/numbers.csv"]).await;
        write_artifact(&store, id, "out.txt", "hello\n");
        write_artifact(&store, id, "data/numbers.csv", "1,2,3\n");

        let first = artifacts.archive(id).await.unwrap();
        let second = artifacts.archive(id).await.unwrap();
        assert_eq!(first, second);

        let mut archive = zip::ZipArchive::new(Cursor::new(first)).unwrap();
        let names: Vec<_> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names, vec!["out.txt", "data/numbers.csv"]);
        let mut content = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("out.txt").unwrap(), &mut content)
            .unwrap();
        assert_eq!(content, "hello\n");
    }

    #[tokio::test]
    async fn test_copy_hard_links() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let artifacts = Artifacts::new(store.clone());

        let src = job_with_artifacts(&jobs, &images, &["out.txt"]).await;
        write_artifact(&store, src, "out.txt", "payload");
        let dst = jobs.create().unwrap();

        artifacts.copy(src, dst).await.unwrap();

        let src_meta = std::fs::metadata(store.root_mount(src).join("out.txt")).unwrap();
        let dst_meta = std::fs::metadata(store.root_mount(dst).join("out.txt")).unwrap();
        assert_eq!(src_meta.ino(), dst_meta.ino());

        // the destination now satisfies its own listings
        jobs.bind_image(
            dst,
            &JobProperties {
                image: "alpine".to_string(),
                artifacts: Some(vec!["out.txt".to_string()]),
            },
        )
        .await
        .unwrap();
        let infos = artifacts.list(dst).await.unwrap();
        assert_eq!(infos.len(), 1);

        // a second copy hits the existing destination file
        let err = artifacts.copy(src, dst).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_copy_missing_source_artifact() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let artifacts = Artifacts::new(store.clone());

        let src = job_with_artifacts(&jobs, &images, &["out.txt"]).await;
        std::fs::create_dir_all(store.root_mount(src)).unwrap();
        let dst = jobs.create().unwrap();

        let err = artifacts.copy(src, dst).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    }
}
