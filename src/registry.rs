use crate::cluster::{ClusterClient, HostLease};
use crate::error::{ControllerError, Phase, Result};
use crate::scheduler::{CompositeJobId, JobSummary};

/// All running jobs that belong to `app_id`, across every host.
///
/// Order follows host and job iteration and is not meaningful.
pub async fn list_jobs(cluster: &dyn ClusterClient, app_id: &str) -> Result<Vec<JobSummary>> {
    let hosts = cluster
        .list_hosts()
        .await
        .map_err(|e| ControllerError::cluster(Phase::ListHosts, e))?;

    let jobs = hosts
        .values()
        .flat_map(|host| {
            host.jobs
                .iter()
                .filter(|job| job.app_id == app_id)
                .map(move |job| {
                    let ad_hoc = job.job_type.is_empty();
                    JobSummary {
                        id: CompositeJobId::new(host.id.clone(), job.id.clone()).to_string(),
                        job_type: (!ad_hoc).then(|| job.job_type.clone()),
                        release_id: job.release_id.clone(),
                        cmd: ad_hoc.then(|| job.config.cmd.clone()),
                    }
                })
        })
        .collect();

    Ok(jobs)
}

/// Stop job `id` (`<hostID>-<jobID>`) on its host.
pub async fn kill_job(cluster: &dyn ClusterClient, id: &str) -> Result<()> {
    let id = CompositeJobId::parse(id)?;
    let host = HostLease::dial(cluster, &id.host_id)
        .await
        .map_err(|e| ControllerError::cluster(Phase::Connect, e))?;

    host.stop_job(&id.job_id)
        .await
        .map_err(|e| ControllerError::cluster(Phase::Stop, e))?;
    tracing::info!(job_id = %id, "Job stopped");
    Ok(())
}
