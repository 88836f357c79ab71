use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::Result;
use crate::job::artifacts::Artifacts;
use crate::job::runner::Runner;
use crate::job::state;
use crate::job::{JobProperties, Jobs};

/// One stage of a pipeline: a job definition the orchestrator allocates
/// and runs in order. Script lines are joined with newlines into the
/// stage job's script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub name: String,
    pub image: String,
    pub script: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub jobs: Vec<PipelineJob>,
}

/// Sequences a linear chain of jobs: every stage is allocated up front,
/// then executed in order on a detached task, handing its artifacts to
/// the next stage after each run.
///
/// Pipelines are ephemeral; once created they exist only as the job ids
/// they produced. In-flight pipelines are not resumed across a process
/// restart, but their stage jobs stay queryable.
#[derive(Debug, Clone)]
pub struct Pipeline {
    jobs: Jobs,
    runner: Runner,
    artifacts: Artifacts,
}

impl Pipeline {
    pub fn new(jobs: Jobs, runner: Runner, artifacts: Artifacts) -> Self {
        Self {
            jobs,
            runner,
            artifacts,
        }
    }

    /// Allocate and prepare one job per stage, then kick off execution on
    /// a detached task. Returns the allocated ids immediately; callers
    /// observe progress through the jobs themselves.
    pub async fn create(&self, def: PipelineDefinition) -> Result<Vec<u64>> {
        let ids = self.prepare(&def).await?;

        let orchestrator = self.clone();
        let run_ids = ids.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.execute(&run_ids).await {
                error!("error executing pipeline: {}", err);
            }
        });

        Ok(ids)
    }

    /// Synchronous phase: create, bind, and script each stage job, then
    /// stamp it queued. Already-created jobs survive a failed later stage.
    async fn prepare(&self, def: &PipelineDefinition) -> Result<Vec<u64>> {
        let mut ids = Vec::with_capacity(def.jobs.len());
        for stage in &def.jobs {
            let id = self.jobs.create()?;
            ids.push(id);
            let props = JobProperties {
                image: stage.image.clone(),
                artifacts: (!stage.artifacts.is_empty()).then(|| stage.artifacts.clone()),
            };
            self.jobs.bind_image(id, &props).await?;
            self.jobs
                .put_script(id, stage.script.join("\n").into(), None)
                .await?;
            self.jobs.set_state(id, state::QUEUE_VERB).await?;
            info!("prepared pipeline stage {} as job {}", stage.name, id);
        }
        Ok(ids)
    }

    /// Asynchronous phase: run the stages in order. Stage N+1 never
    /// launches before stage N's child has exited, and each stage's
    /// artifacts are linked into the next before it starts.
    async fn execute(&self, ids: &[u64]) -> Result<()> {
        for (i, &id) in ids.iter().enumerate() {
            self.jobs.set_state(id, state::START_VERB).await?;
            let exit_code = self.runner.launch_and_wait(id).await?;
            info!("pipeline stage job {} exited with code {}", id, exit_code);
            if let Some(&next) = ids.get(i + 1) {
                self.artifacts.copy(id, next).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::Images;
    use crate::job::state;
    use crate::test_utils::temp_store;

    fn stage(name: &str, artifacts: &[&str]) -> PipelineJob {
        PipelineJob {
            name: name.to_string(),
            image: "alpine".to_string(),
            script: vec!["#!/bin/sh".to_string(), "echo hi > /root/out.txt".to_string()],
            artifacts: artifacts.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_prepare_allocates_queued_stages() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let pipeline = Pipeline::new(
            jobs.clone(),
            Runner::new(store.clone(), "true".to_string()),
            Artifacts::new(store),
        );

        let def = PipelineDefinition {
            jobs: vec![stage("produce", &["out.txt"]), stage("consume", &["out.txt"])],
        };
        let ids = pipeline.prepare(&def).await.unwrap();
        assert_eq!(ids, vec![1, 2]);

        for id in ids {
            let job = jobs.get(id).await.unwrap();
            assert_eq!(job.state, "queueded");
            assert_eq!(job.image, "alpine");
            assert_eq!(job.script, "#!/bin/sh\necho hi > /root/out.txt");
            assert_eq!(job.artifacts, vec!["out.txt"]);
        }
    }

    #[tokio::test]
    async fn test_prepare_fails_on_missing_image() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let pipeline = Pipeline::new(
            jobs.clone(),
            Runner::new(store.clone(), "true".to_string()),
            Artifacts::new(store),
        );

        let def = PipelineDefinition {
            jobs: vec![stage("produce", &[])],
        };
        let err = pipeline.prepare(&def).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)), "{err:?}");
        // the allocated job survives for inspection
        assert!(jobs.get(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_runs_stages_in_order_and_links_artifacts() {
        crate::test_utils::setup_logging();
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let pipeline = Pipeline::new(
            jobs.clone(),
            Runner::new(store.clone(), "true".to_string()),
            Artifacts::new(store.clone()),
        );

        let def = PipelineDefinition {
            jobs: vec![stage("produce", &["out.txt"]), stage("consume", &["out.txt"])],
        };
        let ids = pipeline.prepare(&def).await.unwrap();

        // the runtime stub does not execute the script, so produce the
        // first stage's artifact the way a real run would have
        let out = store.root_mount(ids[0]).join("out.txt");
        std::fs::create_dir_all(out.parent().unwrap()).unwrap();
        std::fs::write(&out, "hi\n").unwrap();

        pipeline.execute(&ids).await.unwrap();

        for &id in &ids {
            assert_eq!(jobs.state(id).await.unwrap(), state::DONE);
        }
        use std::os::unix::fs::MetadataExt;
        let src = std::fs::metadata(&out).unwrap();
        let dst = std::fs::metadata(store.root_mount(ids[1]).join("out.txt")).unwrap();
        assert_eq!(src.ino(), dst.ino());
    }

    #[tokio::test]
    async fn test_execute_aborts_on_missing_artifact() {
        let (_dir, store) = temp_store();
        let jobs = Jobs::new(store.clone());
        let images = Images::new(store.clone());
        images.put("alpine", "img".into(), None).await.unwrap();
        let pipeline = Pipeline::new(
            jobs.clone(),
            Runner::new(store.clone(), "true".to_string()),
            Artifacts::new(store.clone()),
        );

        let def = PipelineDefinition {
            jobs: vec![stage("produce", &["out.txt"]), stage("consume", &["out.txt"])],
        };
        let ids = pipeline.prepare(&def).await.unwrap();
        // stage one never writes out.txt, so the hand-off fails
        let err = pipeline.execute(&ids).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::NotFound(_)), "{err:?}");

        // the first stage finished; the second never launched
        assert_eq!(jobs.state(ids[0]).await.unwrap(), state::DONE);
        assert_eq!(jobs.state(ids[1]).await.unwrap(), "queueded");
    }
}
