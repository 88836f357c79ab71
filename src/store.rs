use std::io;
use std::path::{Path, PathBuf};

pub(crate) const IMAGES_DIR: &str = "images";
pub(crate) const JOBS_DIR: &str = "jobs";
pub(crate) const COUNTER_FILE: &str = "max_job_id.txt";
pub(crate) const PROPERTIES_NAME: &str = "properties";
pub(crate) const SCRIPT_NAME: &str = "script";
pub(crate) const IMAGE_LINK_NAME: &str = "image.sif";
pub(crate) const OVERLAY_DIR: &str = "overlay";
pub(crate) const ROOT_MOUNT: &str = "root";
pub(crate) const LOG_FILE: &str = "job.log";
pub(crate) const IMAGE_EXT: &str = "sif";

/// Body of the per-job `properties` marker file. The file's extended
/// attributes are the authoritative metadata; the content is a pointer
/// for humans poking around the store.
pub(crate) const PROPERTIES_BODY: &str = "SEE EXTENDED ATTRIBUTES\n";

/// On-disk layout of the service: one subtree for image blobs, one
/// subtree per job. Cheap to clone and share across handlers; all state
/// lives on the filesystem.
#[derive(Debug, Clone)]
pub struct Store {
    images_root: PathBuf,
    jobs_root: PathBuf,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let store = Self {
            images_root: root.join(IMAGES_DIR),
            jobs_root: root.join(JOBS_DIR),
        };
        std::fs::create_dir_all(&store.images_root)?;
        std::fs::create_dir_all(&store.jobs_root)?;
        Ok(store)
    }

    pub fn images_root(&self) -> &Path {
        &self.images_root
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    /// Blob location for image `name`.
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.images_root.join(format!("{name}.{IMAGE_EXT}"))
    }

    /// Counter file holding the largest allocated job id.
    pub fn counter_path(&self) -> PathBuf {
        self.jobs_root.join(COUNTER_FILE)
    }

    pub fn job_dir(&self, id: u64) -> PathBuf {
        self.jobs_root.join(id.to_string())
    }

    pub fn properties_path(&self, id: u64) -> PathBuf {
        self.job_dir(id).join(PROPERTIES_NAME)
    }

    pub fn script_path(&self, id: u64) -> PathBuf {
        self.job_dir(id).join(SCRIPT_NAME)
    }

    /// Symlink from the job directory into the image root.
    pub fn image_link_path(&self, id: u64) -> PathBuf {
        self.job_dir(id).join(IMAGE_LINK_NAME)
    }

    /// Writable overlay the container runtime layers over the image.
    pub fn overlay_path(&self, id: u64) -> PathBuf {
        self.job_dir(id).join(OVERLAY_DIR)
    }

    /// Directory mapped to `/root` inside the container, where the script
    /// writes artifacts.
    pub fn root_mount(&self, id: u64) -> PathBuf {
        self.job_dir(id).join(ROOT_MOUNT)
    }

    pub fn log_path(&self, id: u64) -> PathBuf {
        self.job_dir(id).join(LOG_FILE)
    }
}
