//! Running new jobs: resolve the release, pick a host, optionally attach,
//! submit, and hand back either a summary or a live attach stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{App, Catalog, ImageRef};
use crate::cluster::{
    AddJobsRequest, AttachFlags, AttachRequest, AttachSession, AttachStream, ClusterClient,
    ContainerConfig, HostLease, JobSpec,
};
use crate::error::{ControllerError, Phase, Result};
use crate::scheduler::{format_env, new_job_id, CompositeJobId, HostSelector, JobSummary, NewJob};

/// Tag keys attached to every dispatched job.
pub const TAG_APP: &str = "app";
pub const TAG_RELEASE: &str = "release";

/// An interactive job whose attach stream is live.
///
/// Holds the host connection for as long as the stream is in use.
pub struct AttachedJob {
    pub id: CompositeJobId,
    pub stream: AttachStream,
    pub host: HostLease,
}

impl std::fmt::Debug for AttachedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedJob").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
pub enum Dispatched {
    Scheduled(JobSummary),
    Attached(AttachedJob),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchTimeouts {
    /// Upper bound on waiting for an attach to be confirmed.
    pub attach_wait: Duration,
    /// Upper bound on draining an attach whose job failed to schedule.
    pub drain: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            attach_wait: Duration::from_secs(30),
            drain: Duration::from_secs(1),
        }
    }
}

pub struct Dispatcher {
    catalog: Arc<dyn Catalog>,
    cluster: Arc<dyn ClusterClient>,
    selector: Arc<dyn HostSelector>,
    timeouts: DispatchTimeouts,
}

impl Dispatcher {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        cluster: Arc<dyn ClusterClient>,
        selector: Arc<dyn HostSelector>,
    ) -> Self {
        Self {
            catalog,
            cluster,
            selector,
            timeouts: DispatchTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: DispatchTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Build the job record for `new_job` against `release_env` and `image`.
    pub fn build_job(
        app: &App,
        new_job: &NewJob,
        image: ImageRef,
        release_env: &BTreeMap<String, String>,
        interactive: bool,
    ) -> JobSpec {
        let tags = BTreeMap::from([
            (TAG_APP.to_string(), app.id.clone()),
            (TAG_RELEASE.to_string(), new_job.release_id.clone()),
        ]);

        JobSpec {
            id: new_job_id(),
            app_id: app.id.clone(),
            release_id: new_job.release_id.clone(),
            job_type: String::new(),
            tags,
            config: ContainerConfig {
                image,
                cmd: new_job.cmd.clone(),
                env: format_env(release_env, &new_job.env),
                attach_stdout: true,
                attach_stderr: true,
                attach_stdin: interactive,
                stdin_once: interactive,
                open_stdin: interactive,
                tty: new_job.tty,
            },
        }
    }

    /// Run a new job for `app`.
    ///
    /// With `interactive`, the attach is registered on the chosen host before
    /// the job is submitted so none of its output can be missed, and the
    /// result is [`Dispatched::Attached`] once the host confirms the stream.
    pub async fn run_job(&self, app: &App, new_job: NewJob, interactive: bool) -> Result<Dispatched> {
        if new_job.release_id.is_empty() {
            return Err(ControllerError::validation("releaseID", "is required"));
        }
        let release = self.catalog.release(&new_job.release_id).await?;
        let artifact = self.catalog.artifact(&release.artifact_id).await?;
        let image = ImageRef::parse(&artifact.uri).map_err(|e| {
            tracing::warn!(artifact_id = %artifact.id, error = %e, "Error parsing artifact URI");
            ControllerError::from(e)
        })?;

        let job = Self::build_job(app, &new_job, image, &release.env, interactive);

        let hosts = self
            .cluster
            .list_hosts()
            .await
            .map_err(|e| ControllerError::cluster(Phase::ListHosts, e))?;
        let host_id = self.selector.select(&hosts)?;
        let id = CompositeJobId::new(host_id.clone(), job.id.clone());

        let attach = if interactive {
            let host = HostLease::dial(self.cluster.as_ref(), &host_id)
                .await
                .map_err(|e| ControllerError::cluster(Phase::Connect, e))?;
            let req = AttachRequest {
                job_id: job.id.clone(),
                flags: AttachFlags::STDOUT
                    | AttachFlags::STDERR
                    | AttachFlags::STDIN
                    | AttachFlags::STREAM,
                height: new_job.lines,
                width: new_job.columns,
            };
            let session = host
                .attach(req, true)
                .await
                .map_err(|e| ControllerError::cluster(Phase::Attach, e))?;
            tracing::debug!(job_id = %id, "Attach established ahead of scheduling");
            Some((host, session))
        } else {
            None
        };

        let submit = AddJobsRequest {
            host_jobs: HashMap::from([(host_id.clone(), vec![job])]),
        };
        if let Err(e) = self.cluster.add_jobs(submit).await {
            if let Some((host, session)) = attach {
                self.abandon_attach(&host, &id, session).await;
            }
            return Err(ControllerError::cluster(Phase::Schedule, e));
        }
        tracing::info!(job_id = %id, app_id = %app.id, release_id = %new_job.release_id, interactive, "Job scheduled");

        match attach {
            None => Ok(Dispatched::Scheduled(JobSummary {
                id: id.to_string(),
                job_type: None,
                release_id: new_job.release_id,
                cmd: Some(new_job.cmd),
            })),
            Some((host, mut session)) => {
                if let Some(ready) = session.ready.take() {
                    let confirmed = match tokio::time::timeout(self.timeouts.attach_wait, ready.wait()).await {
                        Ok(result) => result.map_err(|e| ControllerError::cluster(Phase::AttachWait, e)),
                        Err(_) => Err(ControllerError::Transport {
                            phase: Phase::AttachWait,
                            message: "timed out waiting for job to start".to_string(),
                        }),
                    };
                    confirmed?;
                }
                Ok(Dispatched::Attached(AttachedJob {
                    id,
                    stream: session.stream,
                    host,
                }))
            }
        }
    }

    /// Release an attach whose job never made it onto the host.
    async fn abandon_attach(&self, host: &HostLease, id: &CompositeJobId, session: AttachSession) {
        if let Err(e) = host.detach(&id.job_id).await {
            tracing::debug!(job_id = %id, error = %e, "Detach after failed schedule failed");
        }
        let discarded = session.drain(self.timeouts.drain).await;
        tracing::debug!(job_id = %id, discarded, "Orphaned attach drained");
    }
}
