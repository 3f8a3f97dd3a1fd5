use crate::{
    Supervisor, TaskService,
    service::ServiceCore,
};
use chrono::{DateTime, Utc};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use roadlens_common::{
    Error, Result, TaskItem, TaskOutput, TaskParamMeta, TaskState, output_type, parse_timestamp,
    require_param, validate_params,
};
use roadlens_store::{OutputCatalog, StreamCatalog, TaskRegistry};
use std::{collections::BTreeMap, path::Path, process::Stdio, sync::Arc, time::Duration};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub(crate) const METRIC_FFMPEG_INVOCATIONS: &str = "roadlens_record_ffmpeg_invocations";

const LABEL: &str = "record";

const PARAMS: &[TaskParamMeta] = &[
    TaskParamMeta::new("cctv", "stream to record", &["str"]),
    TaskParamMeta::new("startat", "recording window start", &["datetime"]),
    TaskParamMeta::new("endat", "recording window end", &["datetime"]),
];

/// How often the pre-start waiter looks at the clock and the cancel flag.
const WAIT_TICK: Duration = Duration::from_millis(500);
/// How often the running recording is supervised.
const SUPERVISE_TICK: Duration = Duration::from_secs(1);

/// Records a stream over HLS for a scheduled wall-clock window by driving
/// an ffmpeg child process.
pub struct RecordTaskSrv {
    core: ServiceCore,
    streams: Arc<dyn StreamCatalog>,
}

impl RecordTaskSrv {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        outputs: Arc<dyn OutputCatalog>,
        streams: Arc<dyn StreamCatalog>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            core: ServiceCore {
                registry,
                outputs,
                supervisor,
            },
            streams,
        }
    }
}

impl TaskService for RecordTaskSrv {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn params(&self) -> &'static [TaskParamMeta] {
        PARAMS
    }

    fn tasks(&self) -> Vec<TaskItem> {
        self.core.tasks(LABEL)
    }

    #[tracing::instrument(skip_all)]
    fn start(&self, params: BTreeMap<String, String>) -> Result<TaskItem> {
        validate_params(PARAMS, &params)?;

        let stream = self.streams.get(require_param(&params, "cctv")?)?;
        let startat = parse_timestamp(require_param(&params, "startat")?)?;
        let endat = parse_timestamp(require_param(&params, "endat")?)?;

        if endat <= startat || endat <= Utc::now() {
            return Err(Error::Validation(
                "the recording window is invalid: endat must be after startat and in the future"
                    .to_string(),
            ));
        }

        // Canonicalised copies of the literal inputs.
        let mut task_params = BTreeMap::new();
        let _ = task_params.insert("cctv".to_string(), stream.name.clone());
        let _ = task_params.insert("startat".to_string(), startat.to_rfc3339());
        let _ = task_params.insert("endat".to_string(), endat.to_rfc3339());

        let task = self.core.registry.add(TaskItem::new(
            LABEL,
            task_params.clone(),
            "waiting for the recording window",
        ))?;

        let token = self.core.supervisor.register(&task.id);
        info!("Submitted recording task {} for \"{}\"", task.id, stream.name);

        self.core.supervisor.spawn(
            task.id.clone(),
            run_record(RecordJob {
                registry: self.core.registry.clone(),
                outputs: self.core.outputs.clone(),
                streams: self.streams.clone(),
                token,
                task_id: task.id.clone(),
                cctv: stream.name,
                startat,
                endat,
                metadata: task_params,
            }),
        );

        Ok(task)
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.core.stop(id)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.core.delete(id)
    }
}

struct RecordJob {
    registry: Arc<dyn TaskRegistry>,
    outputs: Arc<dyn OutputCatalog>,
    streams: Arc<dyn StreamCatalog>,
    token: tokio_util::sync::CancellationToken,
    task_id: String,
    cctv: String,
    startat: DateTime<Utc>,
    endat: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
}

/// Driver body. Returns the final reason on success; the supervisor turns
/// the result into the terminal state.
async fn run_record(job: RecordJob) -> Result<String> {
    // Wait phase: hold until the window opens, fail if it already closed,
    // honour cancellation between ticks.
    loop {
        let now = Utc::now();
        if now >= job.endat {
            return Err(Error::Validation(
                "the recording window has already passed".to_string(),
            ));
        }
        if now >= job.startat {
            break;
        }
        if job.token.is_cancelled() {
            return Err(Error::Canceled(
                "recording was cancelled before it started".to_string(),
            ));
        }
        tokio::time::sleep(WAIT_TICK).await;
    }

    // The playlist URL is only resolved now; HLS URLs go stale quickly.
    let hls = job.streams.resolve_hls(&job.cctv).await?;
    let duration = (job.endat - Utc::now()).num_seconds().max(1);

    let outputs_dir = job.outputs.outputs_dir().to_owned();
    let video_path = outputs_dir.join(format!("{}.mp4", job.task_id));
    let log_path = outputs_dir.join(format!("{}.log", job.task_id));
    let err_path = outputs_dir.join(format!("{}.err", job.task_id));

    let stdout_sink = std::fs::File::create(&log_path)?;
    let stderr_sink = std::fs::File::create(&err_path)?;

    // HLS pre-buffers the window, so relying on stream EOF overruns by
    // around ten seconds; the child gets its own wall-clock deadline.
    let mut child = Command::new("ffmpeg")
        .arg("-i")
        .arg(hls.as_str())
        .args(["-c", "copy", "-t", &duration.to_string()])
        .arg(&video_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_sink))
        .stderr(Stdio::from(stderr_sink))
        .spawn()
        .map_err(|err| Error::External(format!("failed to spawn ffmpeg: {err}")))?;
    metrics::counter!(METRIC_FFMPEG_INVOCATIONS).increment(1);
    debug!("Recording task {} spawned ffmpeg: {:?}", job.task_id, child.id());

    let _ = job.registry.update(
        &job.task_id,
        TaskState::Started,
        "the recording window opened, recording",
    )?;

    // Supervise phase.
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|err| Error::External(format!("failed to poll ffmpeg: {err}")))?
        {
            break status;
        }

        let window = (job.endat - job.startat).num_milliseconds() as f64;
        let elapsed = (Utc::now() - job.startat).num_milliseconds() as f64;
        job.registry
            .set_progress(&job.task_id, (elapsed / window).min(1.0))?;

        if job.token.is_cancelled() {
            terminate_gracefully(&mut child).await;
            remove_if_exists(&video_path);
            remove_if_exists(&log_path);
            remove_if_exists(&err_path);
            return Err(Error::Canceled(
                "recording was cancelled by request".to_string(),
            ));
        }

        tokio::time::sleep(SUPERVISE_TICK).await;
    };

    if status.success() {
        let _ = job.outputs.save(TaskOutput::new(
            &job.task_id,
            &format!("{}.mp4", job.task_id),
            output_type::VIDEO_MP4,
            &format!("{} recording", job.cctv),
            job.metadata.clone(),
        ))?;
        remove_if_exists(&log_path);
        remove_if_exists(&err_path);
        Ok("recording finished".to_string())
    } else {
        // Keep the child's output around for diagnosis; the stdout sink is
        // renamed so the registered name matches the file on disk.
        let out_path = outputs_dir.join(format!("{}.out", job.task_id));
        std::fs::rename(&log_path, &out_path)?;

        let _ = job.outputs.save(TaskOutput::new(
            &job.task_id,
            &format!("{}.out", job.task_id),
            output_type::TEXT_STDOUT,
            &format!("{} recording stdout", job.cctv),
            job.metadata.clone(),
        ))?;
        let _ = job.outputs.save(TaskOutput::new(
            &job.task_id,
            &format!("{}.err", job.task_id),
            output_type::TEXT_STDERR,
            &format!("{} recording stderr", job.cctv),
            job.metadata.clone(),
        ))?;
        remove_if_exists(&video_path);

        Err(Error::External(format!("ffmpeg exited with {status}")))
    }
}

/// Ask ffmpeg to stop cleanly. SIGINT makes it finalise the container
/// before exiting; KILL is never used.
async fn terminate_gracefully(child: &mut Child) {
    if let Some(pid) = child.id() {
        info!("Sending {} to ffmpeg process {pid}", Signal::SIGINT);
        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            warn!("Failed to signal ffmpeg process {pid}: {err}");
        }
    }
    let _ = child.wait().await;
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to remove {}: {err}", path.display()),
    }
}
