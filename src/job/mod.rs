use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;

use bytes::Bytes;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::digest;
use crate::error::{Error, Result};
use crate::store::{Store, PROPERTIES_BODY};
use crate::xattrs::{self, ARTIFACTS_ATTR, EXIT_CODE_ATTR, HASH_ATTR, IMAGE_ATTR, STATE_ATTR};

pub mod artifacts;
pub mod runner;
pub mod state;

/// Client-visible projection of a job, derived entirely from the on-disk
/// layout and extended attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub state: String,
    pub script: String,
    pub exit_code: i64,
    pub image: String,
    pub artifacts: Vec<String>,
}

/// Bind request for a job: the image it runs in and the artifact paths it
/// declares as outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProperties {
    pub image: String,
    #[serde(default)]
    pub artifacts: Option<Vec<String>>,
}

/// Repository over the per-job directories. Ids come from a counter file
/// updated under an exclusive lock; everything else is plain files,
/// symlinks, and extended attributes.
#[derive(Debug, Clone)]
pub struct Jobs {
    store: Store,
}

impl Jobs {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Allocate the next job id and create its directory skeleton.
    ///
    /// The read-increment-write over the counter file runs under an
    /// exclusive file lock so concurrent creates never hand out the same
    /// id. Ids are strictly increasing and never reused, across restarts.
    pub fn create(&self) -> Result<u64> {
        let mut counter = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.store.counter_path())?;
        counter.lock_exclusive()?;
        let id = match Self::next_id(&mut counter) {
            Ok(id) => id,
            Err(err) => {
                let _ = FileExt::unlock(&counter);
                return Err(err);
            }
        };
        FileExt::unlock(&counter)?;

        std::fs::create_dir_all(self.store.job_dir(id))?;
        let properties = self.store.properties_path(id);
        if !properties.exists() {
            std::fs::write(&properties, PROPERTIES_BODY)?;
        }
        info!("created job {}", id);
        Ok(id)
    }

    fn next_id(counter: &mut std::fs::File) -> Result<u64> {
        let mut buf = String::new();
        counter.read_to_string(&mut buf)?;
        let max_id: u64 = match buf.trim() {
            "" => 0,
            s => s.parse().map_err(|_| {
                Error::Internal(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid job id counter",
                ))
            })?,
        };
        let id = max_id + 1;
        counter.set_len(0)?;
        counter.seek(SeekFrom::Start(0))?;
        counter.write_all(id.to_string().as_bytes())?;
        Ok(id)
    }

    /// Bind an image (and optionally artifact declarations) to a job. The
    /// image is referenced twice: as metadata and as a symlink the runner
    /// hands to the container runtime.
    pub async fn bind_image(&self, id: u64, props: &JobProperties) -> Result<Job> {
        if !fs::try_exists(self.store.job_dir(id)).await? {
            return Err(Error::not_found("Job not found"));
        }
        let image_path = match fs::canonicalize(self.store.image_path(&props.image)).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found("Image not found"))
            }
            Err(err) => return Err(err.into()),
        };

        let link = self.store.image_link_path(id);
        match fs::symlink_metadata(&link).await {
            Ok(_) => fs::remove_file(&link).await?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::symlink(&image_path, &link).await?;

        let properties = self.store.properties_path(id);
        xattrs::set(&properties, IMAGE_ATTR, props.image.as_bytes())?;
        if let Some(artifacts) = props.artifacts.as_deref() {
            if !artifacts.is_empty() {
                xattrs::set(&properties, ARTIFACTS_ATTR, artifacts.join(",").as_bytes())?;
            }
        }

        debug!("bound image {} to job {}", props.image, id);
        self.get(id).await
    }

    /// Store the job's script, honoring the etag precondition against the
    /// current script hash. The file is made executable so it can serve as
    /// the container entrypoint.
    pub async fn put_script(
        &self,
        id: u64,
        bytes: Bytes,
        client_etag: Option<&str>,
    ) -> Result<(Job, String)> {
        if !fs::try_exists(self.store.job_dir(id)).await? {
            return Err(Error::not_found("Job not found"));
        }
        if let Some(current) = self.script_etag(id).await? {
            match client_etag {
                None => return Err(Error::PreconditionRequired { current }),
                Some(tag) if tag != current => return Err(Error::PreconditionFailed),
                Some(_) => {}
            }
        }

        let etag = digest::etag(&bytes);
        let script_path = self.store.script_path(id);
        fs::write(&script_path, &bytes).await?;
        xattrs::set(&script_path, HASH_ATTR, etag.as_bytes())?;
        fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).await?;

        let job = self.get(id).await?;
        Ok((job, etag))
    }

    /// Current etag of the stored script, if any. A lost hash attribute is
    /// recomputed from the bytes on disk.
    pub async fn script_etag(&self, id: u64) -> Result<Option<String>> {
        let script_path = self.store.script_path(id);
        if !fs::try_exists(&script_path).await? {
            return Ok(None);
        }
        match xattrs::get_string(&script_path, HASH_ATTR)? {
            Some(tag) => Ok(Some(tag)),
            None => {
                let bytes = fs::read(&script_path).await?;
                Ok(Some(digest::etag(&bytes)))
            }
        }
    }

    pub async fn get_script(&self, id: u64) -> Result<String> {
        if !fs::try_exists(self.store.job_dir(id)).await? {
            return Err(Error::not_found("Job not found"));
        }
        match fs::read_to_string(self.store.script_path(id)).await {
            Ok(script) => Ok(script),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::not_found("Script not found"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Projection of a job's observable state. Absent metadata reads as
    /// its sentinel: empty image name, empty artifact list, exit code -1.
    pub async fn get(&self, id: u64) -> Result<Job> {
        if !fs::try_exists(self.store.job_dir(id)).await? {
            return Err(Error::not_found("Job not found"));
        }
        let properties = self.store.properties_path(id);
        let image = xattrs::get_string(&properties, IMAGE_ATTR)?.unwrap_or_default();
        let artifacts = match xattrs::get_string(&properties, ARTIFACTS_ATTR)? {
            Some(raw) if !raw.is_empty() => raw.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        };

        let script_path = self.store.script_path(id);
        if !fs::try_exists(&script_path).await? {
            return Ok(Job {
                id,
                state: state::NOT_READY.to_string(),
                script: String::new(),
                exit_code: -1,
                image,
                artifacts,
            });
        }
        let script = fs::read_to_string(&script_path).await?.trim().to_string();
        let state = self.state(id).await?;
        let exit_code = xattrs::get_string(&properties, EXIT_CODE_ATTR)?
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);

        Ok(Job {
            id,
            state,
            script,
            exit_code,
            image,
            artifacts,
        })
    }

    /// Projected state label for a job.
    ///
    /// A dangling image symlink counts as absent, so deleting an image
    /// demotes its jobs back to `not ready`.
    pub async fn state(&self, id: u64) -> Result<String> {
        if !fs::try_exists(self.store.job_dir(id)).await? {
            return Err(Error::not_found("Job not found"));
        }
        let image_present = fs::try_exists(self.store.image_link_path(id)).await?;
        let script_present = fs::try_exists(self.store.script_path(id)).await?;
        let persisted = xattrs::get_string(&self.store.properties_path(id), STATE_ATTR)?;
        Ok(state::project(
            image_present,
            script_present,
            persisted.as_deref(),
        ))
    }

    /// Persist a transition label (`verb` + "ed") for the job. The job
    /// must have both inputs in place.
    pub async fn set_state(&self, id: u64, verb: &str) -> Result<String> {
        if !fs::try_exists(self.store.job_dir(id)).await? {
            return Err(Error::not_found("Job not found"));
        }
        let properties = self.store.properties_path(id);
        if !fs::try_exists(&properties).await? {
            return Err(Error::not_found("Properties file not found"));
        }
        if self.state(id).await? == state::NOT_READY {
            return Err(Error::invalid("Job is not ready"));
        }
        let label = state::label(verb);
        xattrs::set(&properties, STATE_ATTR, label.as_bytes())?;
        debug!("job {} state set to {}", id, label);
        Ok(label)
    }

    /// Combined stdout/stderr capture of the job's last run.
    pub async fn get_log(&self, id: u64) -> Result<String> {
        match fs::read_to_string(self.store.log_path(id)).await {
            Ok(log) => Ok(log),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::not_found("Log file not found"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All jobs with a numeric directory name, ascending by id. A
    /// non-empty `state_filter` keeps jobs whose projected state contains
    /// the filter, case-insensitively.
    pub async fn list(&self, state_filter: &str) -> Result<Vec<Job>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(self.store.jobs_root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<u64>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let filter = state_filter.to_lowercase();
        let mut jobs = Vec::new();
        for id in ids {
            let job = match self.get(id).await {
                Ok(job) => job,
                // deleted while listing
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if filter.is_empty() || job.state.to_lowercase().contains(&filter) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}
