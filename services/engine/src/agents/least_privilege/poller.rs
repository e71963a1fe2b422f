//! Job Poller
//!
//! Drives a remote activation job to a terminal state by polling its status
//! on a fixed interval. The wait is bounded twice: by the job's own budget
//! (`max_wait`, followed by one final check) and by the invocation
//! deadline (no final check, the caller is out of time).

use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::error::{RemediationError, Result};
use super::providers::JobApi;
use super::types::{Job, JobOutcome, JobStatus, JobStatusReport};

#[derive(Debug, Clone, Copy)]
pub struct JobPoller {
    max_wait: Duration,
    poll_interval: Duration,
    deadline: Option<Instant>,
}

/// What a single status check produced
enum Check {
    Report(JobStatusReport),
    Transient,
    DeadlineReached,
}

impl JobPoller {
    pub fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            max_wait,
            poll_interval,
            deadline: None,
        }
    }

    /// Stop polling once the invocation deadline passes
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// One status call, cut off at `limit` or the invocation deadline
    async fn check<J: JobApi + ?Sized>(&self, api: &J, job: &mut Job, limit: Instant) -> Check {
        job.attempts += 1;

        let cutoff = self.deadline.map_or(limit, |d| d.min(limit));
        let response = match timeout_at(cutoff, api.job_status(&job.job_id)).await {
            Ok(response) => response,
            Err(_) if self.deadline_passed() => return Check::DeadlineReached,
            Err(_) => {
                warn!(
                    job_id = %job.job_id,
                    attempt = job.attempts,
                    "Job status check outlasted the wait budget"
                );
                return Check::Transient;
            }
        };

        match response {
            Ok(report) => Check::Report(report),
            Err(e) => {
                warn!(
                    job_id = %job.job_id,
                    attempt = job.attempts,
                    error = %e,
                    "Job status check failed, retrying"
                );
                Check::Transient
            }
        }
    }

    fn failure(job: &Job, report: JobStatusReport) -> RemediationError {
        warn!(job_id = %job.job_id, attempts = job.attempts, "Job reported failure");
        RemediationError::JobFailure {
            job_id: job.job_id.clone(),
            status: report.detail,
        }
    }

    fn outcome(mut job: Job, status: JobStatus, last: Option<JobStatusReport>) -> JobOutcome {
        job.status = status;
        if status == JobStatus::TimedOut {
            warn!(
                job_id = %job.job_id,
                attempts = job.attempts,
                last_status = ?last.as_ref().map(|r| r.raw_status.as_str()),
                "Job did not complete in time, outcome unconfirmed"
            );
        } else {
            info!(job_id = %job.job_id, attempts = job.attempts, "Job completed");
        }
        JobOutcome {
            job,
            last_observed: last,
        }
    }

    /// Poll `job_id` until it succeeds, fails or runs out of time.
    ///
    /// `Failure` is raised as `JobFailure`. Running out of budget or hitting
    /// the deadline returns a `TimedOut` outcome, which is never a success.
    pub async fn wait_for_completion<J: JobApi + ?Sized>(
        &self,
        api: &J,
        job_id: &str,
    ) -> Result<JobOutcome> {
        let budget_end = Instant::now() + self.max_wait;
        // No status call may run past one interval beyond the budget
        let hard_limit = budget_end + self.poll_interval;
        let mut job = Job::submitted(job_id);
        let mut last: Option<JobStatusReport> = None;

        loop {
            if self.deadline_passed() {
                return Ok(Self::outcome(job, JobStatus::TimedOut, last));
            }
            if Instant::now() >= budget_end {
                break;
            }

            match self.check(api, &mut job, hard_limit).await {
                Check::Report(report) => match report.status() {
                    Some(JobStatus::Success) => {
                        return Ok(Self::outcome(job, JobStatus::Success, Some(report)));
                    }
                    Some(JobStatus::Failure) => return Err(Self::failure(&job, report)),
                    Some(status @ (JobStatus::Submitted | JobStatus::InProgress)) => {
                        debug!(job_id = %job_id, attempt = job.attempts, %status, "Job still running");
                        job.status = status;
                        last = Some(report);
                    }
                    _ => {
                        warn!(
                            job_id = %job_id,
                            raw_status = %report.raw_status,
                            "Unrecognized job status, treating as transient"
                        );
                        last = Some(report);
                    }
                },
                Check::Transient => {}
                Check::DeadlineReached => {
                    return Ok(Self::outcome(job, JobStatus::TimedOut, last));
                }
            }

            let wake = (Instant::now() + self.poll_interval).min(budget_end);
            if let Some(deadline) = self.deadline {
                if deadline <= wake {
                    sleep_until(deadline).await;
                    return Ok(Self::outcome(job, JobStatus::TimedOut, last));
                }
            }
            sleep_until(wake).await;
        }

        // Budget exhausted: one final look before giving up
        match self.check(api, &mut job, hard_limit).await {
            Check::Report(report) => match report.status() {
                Some(JobStatus::Success) => Ok(Self::outcome(job, JobStatus::Success, Some(report))),
                Some(JobStatus::Failure) => Err(Self::failure(&job, report)),
                _ => Ok(Self::outcome(job, JobStatus::TimedOut, Some(report))),
            },
            Check::Transient | Check::DeadlineReached => {
                Ok(Self::outcome(job, JobStatus::TimedOut, last))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::least_privilege::testing::FakeJobs;

    /// Every status call takes `delay` and reports the job still running
    struct SlowJobs {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl JobApi for SlowJobs {
        async fn job_status(&self, _job_id: &str) -> anyhow::Result<JobStatusReport> {
            tokio::time::sleep(self.delay).await;
            Ok(JobStatusReport::from_payload(
                serde_json::json!({"status": "InProgress"}),
            ))
        }
    }

    fn poller() -> JobPoller {
        JobPoller::new(Duration::from_secs(300), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_second_poll_within_two_intervals() {
        let jobs = FakeJobs::scripted(["inprogress", "success"]);
        let started = Instant::now();

        let outcome = poller().wait_for_completion(&jobs, "job-1").await.unwrap();

        assert!(outcome.is_confirmed());
        assert_eq!(outcome.job.attempts, 2);
        assert!(started.elapsed() <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_job_times_out_without_raising() {
        let jobs = FakeJobs::scripted(["InProgress"]);
        let started = Instant::now();

        let outcome = poller().wait_for_completion(&jobs, "job-1").await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::TimedOut);
        assert!(!outcome.is_confirmed());
        assert!(started.elapsed() <= Duration::from_secs(310));
        assert_eq!(
            outcome.last_observed.map(|r| r.raw_status),
            Some("InProgress".to_string())
        );
        // 30 interval polls plus the final check
        assert_eq!(jobs.polls(), 31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_raises_with_payload() {
        let jobs = FakeJobs::scripted(["inprogress", "failure"]);

        let err = poller().wait_for_completion(&jobs, "job-9").await.unwrap_err();

        match err {
            RemediationError::JobFailure { job_id, status } => {
                assert_eq!(job_id, "job-9");
                assert_eq!(status["status"], "failure");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_status_and_fetch_errors_are_transient() {
        let jobs = FakeJobs::scripted(["warming-up", "!connection reset", "completed"]);

        let outcome = poller().wait_for_completion(&jobs, "job-1").await.unwrap();

        assert!(outcome.is_confirmed());
        assert_eq!(jobs.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_check_failure_raises() {
        let jobs = FakeJobs::scripted(["inprogress", "inprogress", "failed"]);
        let poller = JobPoller::new(Duration::from_secs(20), Duration::from_secs(10));

        let err = poller.wait_for_completion(&jobs, "job-1").await;

        assert!(matches!(err, Err(RemediationError::JobFailure { .. })));
        assert_eq!(jobs.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_check_success_is_confirmed() {
        let jobs = FakeJobs::scripted(["inprogress", "inprogress", "success"]);
        let poller = JobPoller::new(Duration::from_secs(20), Duration::from_secs(10));

        let outcome = poller.wait_for_completion(&jobs, "job-1").await.unwrap();

        assert!(outcome.is_confirmed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_polling_without_final_check() {
        let jobs = FakeJobs::scripted(["inprogress"]);
        let started = Instant::now();
        let poller = poller().with_deadline(Some(started + Duration::from_secs(25)));

        let outcome = poller.wait_for_completion(&jobs, "job-1").await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(25));
        assert_eq!(jobs.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_status_calls_cannot_stretch_the_wait() {
        let jobs = SlowJobs {
            delay: Duration::from_secs(30),
        };
        let poller = JobPoller::new(Duration::from_secs(60), Duration::from_secs(10));
        let started = Instant::now();

        let outcome = poller.wait_for_completion(&jobs, "job-1").await.unwrap();

        assert_eq!(outcome.job.status, JobStatus::TimedOut);
        assert!(started.elapsed() <= Duration::from_secs(70));
    }
}
