use super::{JobOutcome, ProvingJobDatabase, StoredJob};
use crate::BrokerError;
use crate::metrics::DATABASE_METRICS;
use epoch_prover_types::{ProofUri, ProvingJob, ProvingJobId};
use rocksdb::{DB, IteratorMode, Options, WriteBatch, WriteOptions};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug)]
enum JobColumnFamily {
    Jobs,
    Outcomes,
}

impl JobColumnFamily {
    const ALL: [Self; 2] = [Self::Jobs, Self::Outcomes];

    fn name(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Outcomes => "outcomes",
        }
    }
}

/// Job database persisted in RocksDB. Jobs and outcomes live in separate column families keyed
/// by job id.
pub struct RocksDbDatabase {
    db: DB,
    path: PathBuf,
}

impl fmt::Debug for RocksDbDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksDbDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbDatabase {
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let db = DB::open_cf(
            &options,
            path,
            JobColumnFamily::ALL.iter().map(|cf| cf.name()),
        )?;
        tracing::info!(path = %path.display(), "opened proving job database");
        Ok(Self {
            db,
            path: path.to_owned(),
        })
    }

    fn cf(&self, cf: JobColumnFamily) -> Result<&rocksdb::ColumnFamily, BrokerError> {
        self.db
            .cf_handle(cf.name())
            .ok_or_else(|| BrokerError::Database(format!("missing column family {}", cf.name())))
    }

    fn write_options() -> WriteOptions {
        let mut options = WriteOptions::default();
        options.set_sync(true);
        options
    }

    fn put<T: Serialize>(
        &self,
        cf: JobColumnFamily,
        id: &ProvingJobId,
        value: &T,
    ) -> Result<(), BrokerError> {
        let latency = DATABASE_METRICS.write_latency.start();
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(BrokerError::database)?;
        self.db.put_cf_opt(
            self.cf(cf)?,
            id.as_str().as_bytes(),
            bytes,
            &Self::write_options(),
        )?;
        latency.observe();
        Ok(())
    }

    fn set_outcome(&self, id: &ProvingJobId, outcome: &JobOutcome) -> Result<(), BrokerError> {
        if self
            .db
            .get_pinned_cf(self.cf(JobColumnFamily::Jobs)?, id.as_str().as_bytes())?
            .is_none()
        {
            return Err(BrokerError::JobNotFound(id.clone()));
        }
        self.put(JobColumnFamily::Outcomes, id, outcome)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BrokerError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(BrokerError::database)
}

impl ProvingJobDatabase for RocksDbDatabase {
    fn add_job(&self, job: &ProvingJob) -> Result<(), BrokerError> {
        self.put(JobColumnFamily::Jobs, &job.id, job)
    }

    fn set_job_result(&self, id: &ProvingJobId, result_ref: &ProofUri) -> Result<(), BrokerError> {
        self.set_outcome(
            id,
            &JobOutcome::Completed {
                result_ref: result_ref.clone(),
            },
        )
    }

    fn set_job_error(
        &self,
        id: &ProvingJobId,
        reason: &str,
        retryable: bool,
    ) -> Result<(), BrokerError> {
        self.set_outcome(
            id,
            &JobOutcome::Failed {
                reason: reason.to_owned(),
                retryable,
            },
        )
    }

    fn set_job_cancelled(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        self.set_outcome(id, &JobOutcome::Cancelled)
    }

    fn delete_job(&self, id: &ProvingJobId) -> Result<(), BrokerError> {
        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(JobColumnFamily::Jobs)?, key);
        batch.delete_cf(self.cf(JobColumnFamily::Outcomes)?, key);
        self.db.write_opt(batch, &Self::write_options())?;
        Ok(())
    }

    fn all_jobs(&self) -> Result<Vec<StoredJob>, BrokerError> {
        let outcomes = self.cf(JobColumnFamily::Outcomes)?;
        let mut jobs = Vec::new();
        for entry in self
            .db
            .iterator_cf(self.cf(JobColumnFamily::Jobs)?, IteratorMode::Start)
        {
            let (key, value) = entry?;
            let job: ProvingJob = decode(&value)?;
            let outcome = self
                .db
                .get_pinned_cf(outcomes, &key)?
                .map(|bytes| decode(&bytes))
                .transpose()?;
            jobs.push(StoredJob { job, outcome });
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use epoch_prover_types::ProvingRequestType;

    fn job(epoch: u64, tag: u8) -> ProvingJob {
        let ty = ProvingRequestType::BaseParity;
        ProvingJob {
            id: ProvingJobId::new(epoch, ty, &[tag]),
            ty,
            inputs: ProofUri::new(format!("data:,{tag}")),
            epoch_number: epoch,
            created_at: 1_000,
        }
    }

    #[test]
    fn rows_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (job(1, 1), job(1, 2), job(2, 3));
        {
            let db = RocksDbDatabase::open(dir.path()).unwrap();
            db.add_job(&a).unwrap();
            db.add_job(&b).unwrap();
            db.add_job(&c).unwrap();
            db.set_job_result(&a.id, &ProofUri::new("data:,out")).unwrap();
            db.set_job_error(&b.id, "boom", false).unwrap();
        }

        let db = RocksDbDatabase::open(dir.path()).unwrap();
        let mut rows = db.all_jobs().unwrap();
        rows.sort_by(|x, y| x.job.id.cmp(&y.job.id));
        assert_eq!(rows.len(), 3);
        let find = |id: &ProvingJobId| rows.iter().find(|row| &row.job.id == id).unwrap();
        assert_eq!(
            find(&a.id).outcome,
            Some(JobOutcome::Completed {
                result_ref: ProofUri::new("data:,out")
            })
        );
        assert_eq!(
            find(&b.id).outcome,
            Some(JobOutcome::Failed {
                reason: "boom".into(),
                retryable: false
            })
        );
        assert_eq!(find(&c.id).outcome, None);
        assert_eq!(find(&c.id).job, c);

        db.delete_job(&a.id).unwrap();
        assert_eq!(db.all_jobs().unwrap().len(), 2);
    }

    #[test]
    fn outcome_for_unknown_job_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksDbDatabase::open(dir.path()).unwrap();
        let id = ProvingJobId::from("1:tube:ff");
        assert_matches!(db.set_job_cancelled(&id), Err(BrokerError::JobNotFound(_)));
        assert!(db.all_jobs().unwrap().is_empty());
    }
}
