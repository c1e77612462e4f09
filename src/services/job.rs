use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::cancel::CancellationController;
use crate::{
    error::EncodeError,
    jobs::{
        display_name,
        transcode::{
            synthesize, validate_template, EncodeOptions, EncoderLocator, ProcessOutcome,
            ProcessSupervisor, ProgressSample, Supervise, SupervisorEvent,
        },
        BatchEvent, BatchSummary, ExecutionState, Job, JobReport,
    },
};

/// What `GET /batch` shows about the job currently running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentJob {
    pub index: usize,
    pub total: usize,
    pub name: String,
    pub state: ExecutionState,
    pub progress: Option<ProgressSample>,
}

/// Read-only snapshot of the runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchStatus {
    /// `Idle`, `Running`, or `CancelRequested` while draining
    pub phase: ExecutionState,
    pub current: Option<CurrentJob>,
    pub last_summary: Option<BatchSummary>,
}

#[derive(Default)]
struct RunnerState {
    status: BatchStatus,
    cancel: Option<CancellationController>,
}

/// Runs batches of encodes strictly one file at a time.
pub struct BatchRunner {
    locator: EncoderLocator,
    supervisor: Arc<dyn Supervise>,
    events: broadcast::Sender<BatchEvent>,
    state: Mutex<RunnerState>,
}

/// A batch that passed the start checks and holds the runner's `Running` slot.
pub struct Batch {
    claim: Claim,
    files: Vec<PathBuf>,
    options: EncodeOptions,
    cancel: CancellationController,
}

/// Gives the runner back to `Idle` if a prepared batch is dropped without finishing.
struct Claim {
    runner: Arc<BatchRunner>,
    released: bool,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.released {
            debug!("prepared batch dropped before completion");
            let mut state = self.runner.lock();
            state.status.phase = ExecutionState::Idle;
            state.status.current = None;
            state.cancel = None;
        }
    }
}

impl BatchRunner {
    pub fn new(locator: EncoderLocator, event_buffer: usize) -> Arc<Self> {
        Self::with_supervisor(locator, Arc::new(ProcessSupervisor::new()), event_buffer)
    }

    pub fn with_supervisor(
        locator: EncoderLocator,
        supervisor: Arc<dyn Supervise>,
        event_buffer: usize,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Arc::new(Self {
            locator,
            supervisor,
            events,
            state: Mutex::new(RunnerState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn locator(&self) -> &EncoderLocator {
        &self.locator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Publish to every subscriber. Having none is fine.
    pub fn publish(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> BatchStatus {
        self.lock().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().status.phase != ExecutionState::Idle
    }

    /// Ask the running batch to stop. Returns false when nothing is running or a stop
    /// was already requested.
    pub fn request_cancel(&self) -> bool {
        let cancel = {
            let mut state = self.lock();
            if state.status.phase == ExecutionState::Running {
                state.status.phase = ExecutionState::CancelRequested;
                if let Some(current) = state.status.current.as_mut() {
                    current.state = ExecutionState::CancelRequested;
                }
            }
            state.cancel.clone()
        };
        cancel.is_some_and(|c| c.request())
    }

    /// Claim the runner for a new batch. Fails if one is already running or the manual
    /// template is broken; in both cases nothing is attempted.
    pub fn prepare(
        self: &Arc<Self>,
        files: Vec<PathBuf>,
        options: EncodeOptions,
        cancel: CancellationController,
    ) -> Result<Batch, EncodeError> {
        // identical for every file, so fail before starting any
        if let Some(template) = options.manual_template.as_deref() {
            validate_template(template)?;
        }

        let mut state = self.lock();
        if state.status.phase != ExecutionState::Idle {
            return Err(EncodeError::AlreadyRunning);
        }
        state.status.phase = ExecutionState::Running;
        state.status.current = None;
        state.cancel = Some(cancel.clone());

        Ok(Batch {
            claim: Claim {
                runner: Arc::clone(self),
                released: false,
            },
            files,
            options,
            cancel,
        })
    }

    /// Run every file in order and return the aggregate outcome.
    pub async fn run_all(
        self: &Arc<Self>,
        files: Vec<PathBuf>,
        options: EncodeOptions,
        cancel: CancellationController,
    ) -> Result<BatchSummary, EncodeError> {
        Ok(self.prepare(files, options, cancel)?.run().await)
    }

    fn set_current(&self, current: Option<CurrentJob>) {
        self.lock().status.current = current;
    }

    fn update_current(&self, f: impl FnOnce(&mut CurrentJob)) {
        if let Some(current) = self.lock().status.current.as_mut() {
            f(current);
        }
    }

    fn finish(&self, summary: &BatchSummary) {
        let mut state = self.lock();
        state.status.phase = ExecutionState::Idle;
        state.status.current = None;
        state.status.last_summary = Some(summary.clone());
        state.cancel = None;
    }
}

impl Batch {
    #[instrument(skip_all)]
    pub async fn run(self) -> BatchSummary {
        let Batch {
            mut claim,
            files,
            options,
            cancel,
        } = self;
        let runner = Arc::clone(&claim.runner);
        let total = files.len();
        info!("starting batch of {} file(s)", total);

        // options are fixed for the run, the encoder is looked up once per batch
        let encoder = runner.locator.locate().unwrap_or_default();
        if encoder.as_os_str().is_empty() {
            error!(
                "{} not found, every job in this batch will fail",
                runner.locator.file_name()
            );
        }

        let mut reports: Vec<JobReport> = files
            .iter()
            .enumerate()
            .map(|(index, source)| JobReport::pending(index, source.clone()))
            .collect();

        for report in reports.iter_mut() {
            if cancel.is_requested() {
                info!("batch stopped, {} job(s) not attempted", total - report.index);
                break;
            }

            let index = report.index;
            let name = display_name(&report.source);

            let job = match synthesize(&report.source, &options, &encoder) {
                Ok((argv, output)) => Job {
                    index,
                    source: report.source.clone(),
                    output,
                    argv,
                },
                Err(err) => {
                    warn!("skipping {}: {}", name, err);
                    report.fail(err.to_string(), None);
                    runner.publish(BatchEvent::JobFinished {
                        report: report.clone(),
                    });
                    continue;
                }
            };
            report.output = Some(job.output.clone());

            if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(err) = tokio::fs::create_dir_all(parent).await {
                    warn!("could not create {}: {}", parent.display(), err);
                    report.fail(
                        format!("could not create {}: {}", parent.display(), err),
                        None,
                    );
                    runner.publish(BatchEvent::JobFinished {
                        report: report.clone(),
                    });
                    continue;
                }
            }

            report.advance(ExecutionState::Running);
            runner.set_current(Some(CurrentJob {
                index,
                total,
                name: job.name(),
                state: ExecutionState::Running,
                progress: None,
            }));
            info!("start {}/{}: {}", job.index + 1, total, name);
            runner.publish(BatchEvent::JobStarted {
                index,
                total,
                name: name.clone(),
                argv: job.argv.clone(),
            });

            let outcome = {
                let sink = Arc::clone(&runner);
                let name = name.clone();
                let mut forward = move |event: SupervisorEvent| match event {
                    SupervisorEvent::RawLine(line) => {
                        debug!("[{}] {}", index, line);
                        sink.publish(BatchEvent::Log { index, line });
                    }
                    SupervisorEvent::Progress(sample) => {
                        sink.update_current(|c| c.progress = Some(sample));
                        sink.publish(BatchEvent::Progress {
                            index,
                            total,
                            name: name.clone(),
                            sample,
                        });
                    }
                };
                runner
                    .supervisor
                    .run(&job.argv, &cancel, &mut forward)
                    .await
            };

            let stopped = cancel.is_requested();
            match outcome {
                ProcessOutcome::Exited(0) => {
                    report.advance(ExecutionState::Succeeded);
                }
                ProcessOutcome::StartFailure(reason) => {
                    report.fail(reason, None);
                }
                _ if stopped => {
                    report.advance(ExecutionState::CancelRequested);
                    report.advance(ExecutionState::Cancelled);
                    report.reason = Some("cancelled".into());
                }
                ProcessOutcome::Exited(code) => {
                    report.fail(format!("encoder exited with code {}", code), Some(code));
                }
                ProcessOutcome::Terminated => {
                    report.fail("encoder was terminated by a signal", None);
                }
            }
            if !report.state.is_terminal() {
                warn!("job {} left in {:?}", index, report.state);
            }
            info!("finished {}/{}: {} - {:?}", index + 1, total, name, report.state);
            runner.publish(BatchEvent::JobFinished {
                report: report.clone(),
            });
        }

        let summary = BatchSummary::from_reports(reports, cancel.is_requested());
        info!(
            "batch complete: {} succeeded, {} failed, {} cancelled, {} not attempted",
            summary.succeeded, summary.failed, summary.cancelled, summary.not_attempted
        );
        runner.finish(&summary);
        claim.released = true;
        runner.publish(BatchEvent::BatchFinished {
            summary: summary.clone(),
        });
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::transcode::Codec;

    /// Scripted stand-in for the encoder: outcome per call, optionally blocking until a
    /// stop is requested.
    struct FakeSupervisor {
        script: Mutex<Vec<Step>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    enum Step {
        Finish(ProcessOutcome),
        WaitForCancel,
    }

    impl FakeSupervisor {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Supervise for FakeSupervisor {
        async fn run(
            &self,
            argv: &[String],
            cancel: &CancellationController,
            on_event: &mut (dyn FnMut(SupervisorEvent) + Send),
        ) -> ProcessOutcome {
            self.calls.lock().unwrap().push(argv.to_vec());
            let step = self.script.lock().unwrap().remove(0);

            on_event(SupervisorEvent::RawLine("Duration: 00:00:10.00".into()));
            on_event(SupervisorEvent::RawLine("time=00:00:05.00".into()));
            on_event(SupervisorEvent::Progress(ProgressSample {
                elapsed_seconds: 5.0,
                total_seconds: 10.0,
                fraction: 0.5,
            }));

            match step {
                Step::Finish(outcome) => outcome,
                Step::WaitForCancel => {
                    while !cancel.is_requested() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    tokio::time::sleep(cancel.grace()).await;
                    ProcessOutcome::Terminated
                }
            }
        }
    }

    fn runner_with(fake: Arc<FakeSupervisor>, encoder: &std::path::Path) -> Arc<BatchRunner> {
        BatchRunner::with_supervisor(
            EncoderLocator::new("ffmpeg", Some(encoder.to_path_buf())),
            fake,
            256,
        )
    }

    fn fake_encoder(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("ffmpeg");
        std::fs::write(&path, b"").unwrap();
        path
    }

    fn sources(dir: &tempfile::TempDir, names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| dir.path().join(n)).collect()
    }

    #[tokio::test]
    async fn runs_jobs_in_order_and_keeps_going_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![
            Step::Finish(ProcessOutcome::Exited(0)),
            Step::Finish(ProcessOutcome::Exited(1)),
            Step::Finish(ProcessOutcome::StartFailure("boom".into())),
        ]);
        let runner = runner_with(fake.clone(), &fake_encoder(&dir));
        let files = sources(&dir, &["a.mkv", "b.mkv", "c.mkv"]);

        let summary = runner
            .run_all(files.clone(), EncodeOptions::default(), CancellationController::default())
            .await
            .unwrap();

        let states: Vec<_> = summary.jobs.iter().map(|j| j.state).collect();
        assert_eq!(
            states,
            vec![
                ExecutionState::Succeeded,
                ExecutionState::Failed,
                ExecutionState::Failed
            ]
        );
        assert_eq!(summary.jobs[1].exit_code, Some(1));
        assert_eq!(summary.jobs[2].reason.as_deref(), Some("boom"));
        assert!(!summary.stopped);

        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        for (call, file) in calls.iter().zip(&files) {
            assert!(call.contains(&file.to_string_lossy().to_string()));
        }
        assert!(!runner.is_running());
        assert_eq!(runner.status().last_summary, Some(summary));
    }

    #[tokio::test]
    async fn cancelling_the_second_job_skips_the_third() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![
            Step::Finish(ProcessOutcome::Exited(0)),
            Step::WaitForCancel,
            Step::Finish(ProcessOutcome::Exited(0)),
        ]);
        let runner = runner_with(fake.clone(), &fake_encoder(&dir));
        let mut events = runner.subscribe();
        let cancel = CancellationController::new(Duration::from_millis(20));

        let batch = runner
            .prepare(
                sources(&dir, &["a.mkv", "b.mkv", "c.mkv"]),
                EncodeOptions::default(),
                cancel,
            )
            .unwrap();
        let worker = tokio::spawn(batch.run());

        // stop once job 2 has started
        loop {
            if let BatchEvent::JobStarted { index: 1, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(runner.request_cancel());
        assert_eq!(runner.status().phase, ExecutionState::CancelRequested);
        assert!(!runner.request_cancel());

        let summary = worker.await.unwrap();
        assert_eq!(summary.jobs[0].state, ExecutionState::Succeeded);
        assert_eq!(summary.jobs[1].state, ExecutionState::Cancelled);
        assert_eq!(summary.jobs[2].state, ExecutionState::Idle);
        assert!(!summary.jobs[2].attempted());
        assert_eq!(summary.not_attempted, 1);
        assert_eq!(summary.cancelled, 1);
        assert!(summary.stopped);
        assert_eq!(fake.calls().len(), 2);
        assert_eq!(runner.status().phase, ExecutionState::Idle);
    }

    #[tokio::test]
    async fn broken_template_attempts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![]);
        let runner = runner_with(fake.clone(), &fake_encoder(&dir));
        let options = EncodeOptions {
            manual_template: Some("ffmpeg -i %%INPUT%% -c copy out.mkv".into()),
            ..Default::default()
        };

        let err = runner
            .run_all(
                sources(&dir, &["a.mkv", "b.mkv"]),
                options,
                CancellationController::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EncodeError::Template(_)));
        assert!(fake.calls().is_empty());
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn second_batch_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(FakeSupervisor::new(vec![]), &fake_encoder(&dir));

        let first = runner
            .prepare(
                sources(&dir, &["a.mkv"]),
                EncodeOptions::default(),
                CancellationController::default(),
            )
            .unwrap();
        let second = runner.prepare(
            sources(&dir, &["b.mkv"]),
            EncodeOptions::default(),
            CancellationController::default(),
        );
        assert!(matches!(second, Err(EncodeError::AlreadyRunning)));

        // dropping an unstarted batch frees the runner again
        drop(first);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn missing_encoder_fails_every_job_but_finishes_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![]);
        let runner = BatchRunner::with_supervisor(
            EncoderLocator::new("ffmpeg", Some(dir.path().join("missing"))),
            fake.clone(),
            16,
        );

        let summary = runner
            .run_all(
                sources(&dir, &["a.mkv", "b.mkv"]),
                EncodeOptions::default(),
                CancellationController::default(),
            )
            .await
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert!(summary.jobs[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("encoder executable not found"));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn events_arrive_in_order_with_summary_last() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![Step::Finish(ProcessOutcome::Exited(0))]);
        let runner = runner_with(fake, &fake_encoder(&dir));
        let mut events = runner.subscribe();

        runner
            .run_all(
                sources(&dir, &["a.mkv"]),
                EncodeOptions::default(),
                CancellationController::default(),
            )
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match event {
                BatchEvent::JobStarted { .. } => "started",
                BatchEvent::Log { .. } => "log",
                BatchEvent::Progress { .. } => "progress",
                BatchEvent::JobFinished { .. } => "finished",
                BatchEvent::BatchFinished { .. } => "batch",
                BatchEvent::OptionsChanged { .. } => "options",
            });
        }
        assert_eq!(
            kinds,
            vec!["started", "log", "log", "progress", "finished", "batch"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopping_a_real_encoder_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        // stands in for ffmpeg: the second file never finishes on its own
        let script = dir.path().join("encode.sh");
        std::fs::write(
            &script,
            "case \"$1\" in *b.mkv) echo 'Duration: 00:00:30.00' >&2; exec sleep 30;; esac\nexit 0\n",
        )
        .unwrap();
        let runner = BatchRunner::new(
            EncoderLocator::new("sh", Some(PathBuf::from("/bin/sh"))),
            64,
        );
        let options = EncodeOptions {
            manual_template: Some(format!(
                "ffmpeg {} %%INPUT%% %%OUTPUT%%",
                script.display()
            )),
            ..Default::default()
        };
        let mut events = runner.subscribe();

        let batch = runner
            .prepare(
                sources(&dir, &["a.mkv", "b.mkv", "c.mkv"]),
                options,
                CancellationController::new(Duration::from_millis(500)),
            )
            .unwrap();
        let worker = tokio::spawn(batch.run());

        loop {
            if let BatchEvent::JobStarted { index: 1, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert!(runner.request_cancel());

        let summary = tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .unwrap()
            .unwrap();
        let states: Vec<_> = summary.jobs.iter().map(|j| j.state).collect();
        assert_eq!(
            states,
            vec![
                ExecutionState::Succeeded,
                ExecutionState::Cancelled,
                ExecutionState::Idle
            ]
        );
        assert_eq!(summary.not_attempted, 1);
        assert!(summary.stopped);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn proxy_jobs_get_their_folder_created() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![Step::Finish(ProcessOutcome::Exited(0))]);
        let runner = runner_with(fake, &fake_encoder(&dir));
        let options = EncodeOptions {
            codec: Codec::ProxyOnly,
            ..Default::default()
        };

        let summary = runner
            .run_all(
                sources(&dir, &["a.mkv"]),
                options,
                CancellationController::default(),
            )
            .await
            .unwrap();

        assert!(dir.path().join("proxy").is_dir());
        assert_eq!(
            summary.jobs[0].output,
            Some(dir.path().join("proxy").join("a.mkv"))
        );
    }

    #[tokio::test]
    async fn repeated_runs_target_the_same_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSupervisor::new(vec![
            Step::Finish(ProcessOutcome::Exited(0)),
            Step::Finish(ProcessOutcome::Exited(0)),
            Step::Finish(ProcessOutcome::Exited(0)),
            Step::Finish(ProcessOutcome::Exited(0)),
        ]);
        let runner = runner_with(fake, &fake_encoder(&dir));
        let files = sources(&dir, &["a.mkv", "b.mkv"]);
        let options = EncodeOptions {
            quality: 30,
            ..Default::default()
        };

        let outputs = |summary: BatchSummary| {
            summary
                .jobs
                .into_iter()
                .map(|j| j.output)
                .collect::<Vec<_>>()
        };
        let first = runner
            .run_all(files.clone(), options.clone(), CancellationController::default())
            .await
            .unwrap();
        let second = runner
            .run_all(files, options, CancellationController::default())
            .await
            .unwrap();
        assert_eq!(outputs(first), outputs(second));
    }
}
