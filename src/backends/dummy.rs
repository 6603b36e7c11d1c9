use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BackendJobState, BackendResult, ClusterBackend, JobReport, SubmissionBatch, SubmissionReceipt,
};

/// Accepts everything; every job reports DONE
#[derive(Debug, Default, Clone)]
pub struct DummyBackend;

#[async_trait]
impl ClusterBackend for DummyBackend {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn submit(&self, batch: &SubmissionBatch) -> BackendResult<SubmissionReceipt> {
        let batch_id = Uuid::new_v4().to_string();
        let job_ids = (0..batch.jobs.len())
            .map(|index| Some(format!("{batch_id}.{index}")))
            .collect();
        Ok(SubmissionReceipt {
            distributor_batch_id: batch_id,
            job_ids,
        })
    }

    async fn poll(&self, distributor_ids: &[String]) -> BackendResult<Vec<JobReport>> {
        Ok(distributor_ids
            .iter()
            .map(|id| JobReport {
                distributor_id: id.clone(),
                state: BackendJobState::Done,
                error_log: None,
            })
            .collect())
    }

    async fn terminate(&self, _distributor_ids: &[String]) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::JobSpec;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_dummy_assigns_one_id_per_job() {
        let batch = SubmissionBatch {
            batch_key: "k".into(),
            queue: "all.q".into(),
            resources: BTreeMap::new(),
            jobs: (0..3)
                .map(|i| JobSpec {
                    task_instance_id: i,
                    task_id: i,
                    name: format!("t{i}"),
                    command: "true".into(),
                })
                .collect(),
        };
        let receipt = DummyBackend.submit(&batch).await.unwrap();
        assert_eq!(receipt.job_ids.len(), 3);
        assert!(receipt.job_ids.iter().all(Option::is_some));

        let ids: Vec<String> = receipt.job_ids.into_iter().flatten().collect();
        let reports = DummyBackend.poll(&ids).await.unwrap();
        assert!(reports.iter().all(|r| r.state == BackendJobState::Done));
    }
}
