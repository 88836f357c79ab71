use std::io;
use std::process::Stdio;

use tokio::fs;
use tokio::process::{Child, Command};
use tracing::info;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::xattrs::{self, EXIT_CODE_ATTR, STATE_ATTR};

use super::state;

/// Exit code sentinel meaning "no run has completed".
pub const EXIT_CODE_UNSET: i64 = -1;

/// Launches job children under the container runtime and records their
/// completion into the job's extended attributes.
///
/// The child is a shell pipeline: the runtime runs the script inside the
/// job's image, then the shell stamps `$?` and the `done` label onto the
/// job's `properties` file. Recording completion from inside the child
/// keeps the exit code write ordered after the last byte of output.
#[derive(Debug, Clone)]
pub struct Runner {
    store: Store,
    runtime: String,
}

impl Runner {
    pub fn new(store: Store, runtime: String) -> Self {
        Self { store, runtime }
    }

    /// Spawn the container runtime for a job. Fails synchronously when the
    /// script or image is missing; anything after the spawn is reflected in
    /// `job.log` and the recorded exit code instead.
    ///
    /// The returned child is detached from the calling request; await it
    /// with [`Runner::wait`].
    pub async fn launch(&self, id: u64) -> Result<Child> {
        let script = match fs::canonicalize(self.store.script_path(id)).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found("Script not found"))
            }
            Err(err) => return Err(err.into()),
        };
        // canonicalize also rejects a dangling image symlink
        let image = match fs::canonicalize(self.store.image_link_path(id)).await {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found("Image not found"))
            }
            Err(err) => return Err(err.into()),
        };

        let overlay = self.store.overlay_path(id);
        fs::create_dir_all(&overlay).await?;
        let root_mount = self.store.root_mount(id);
        fs::create_dir_all(&root_mount).await?;
        let properties = fs::canonicalize(self.store.properties_path(id)).await?;

        let cmd = format!(
            "{runtime} exec -C --fakeroot --bind {script} --bind {root}:/root/ --overlay {overlay} {image} {script}; \
             setfattr --name {exit_attr} --value $? {properties}; \
             setfattr --name {state_attr} --value {done} {properties};",
            runtime = self.runtime,
            script = script.display(),
            root = root_mount.display(),
            overlay = overlay.display(),
            image = image.display(),
            exit_attr = EXIT_CODE_ATTR,
            properties = properties.display(),
            state_attr = STATE_ATTR,
            done = state::DONE,
        );
        info!("launching job {} with command: {}", id, cmd);

        let log = std::fs::File::create(self.store.log_path(id))?;
        let log_err = log.try_clone()?;
        let child = Command::new("bash")
            .arg("-c")
            .arg(&cmd)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;
        Ok(child)
    }

    /// Await the child and return the exit code recorded for the run.
    ///
    /// Normally the shell has already stamped the attributes by the time
    /// the child exits. When it could not (no `setfattr`, no xattr
    /// support), the child's own status is recorded here so the run still
    /// ends in `done` with a real exit code.
    pub async fn wait(&self, id: u64, mut child: Child) -> Result<i64> {
        let status = child.wait().await?;
        let properties = self.store.properties_path(id);

        let mut exit_code = xattrs::get_string(&properties, EXIT_CODE_ATTR)?
            .and_then(|s| s.trim().parse::<i64>().ok());
        if exit_code.is_none() {
            let code = status.code().map(i64::from).unwrap_or(EXIT_CODE_UNSET);
            xattrs::set(&properties, EXIT_CODE_ATTR, code.to_string().as_bytes())?;
            exit_code = Some(code);
        }
        if xattrs::get_string(&properties, STATE_ATTR)?.as_deref() != Some(state::DONE) {
            xattrs::set(&properties, STATE_ATTR, state::DONE.as_bytes())?;
        }

        let exit_code = exit_code.unwrap_or(EXIT_CODE_UNSET);
        info!("job {} completed with exit code: {}", id, exit_code);
        Ok(exit_code)
    }

    /// Launch the job and wait for it to complete.
    pub async fn launch_and_wait(&self, id: u64) -> Result<i64> {
        let child = self.launch(id).await?;
        self.wait(id, child).await
    }
}
