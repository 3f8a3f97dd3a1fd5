use crate::{
    Supervisor, TaskService,
    service::ServiceCore,
    table::{self, DetectionRow},
};
use roadlens_common::{
    Error, Result, TaskItem, TaskOutput, TaskParamMeta, TaskState, output_type, require_param,
    validate_params,
};
use roadlens_store::{OutputCatalog, TaskRegistry};
use roadlens_vision::{
    DetectorConfig, FrameReader, FrameWriter, GREEN, IouTracker, ObjectDetector, TrackerConfig,
    draw_circle_filled, draw_rect, probe_video,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const LABEL: &str = "tracking";

const PARAMS: &[TaskParamMeta] = &[
    TaskParamMeta::new("targetname", "video output to analyse", &["video/mp4"]),
    TaskParamMeta::optional("confidence", "detection confidence threshold", &["float"]),
];

const DEFAULT_CONFIDENCE: f32 = 0.6;

/// Object detection and tracking over a recorded video.
///
/// Tracking saturates the machine, so submissions funnel through a FIFO
/// queue with a single worker; queued tasks sit in `Pending` until their
/// turn, and a cancel request is honoured before any work starts.
pub struct TrackingTaskSrv {
    core: ServiceCore,
    queue_tx: mpsc::UnboundedSender<TrackJob>,
}

struct TrackJob {
    task_id: String,
    token: CancellationToken,
    input_name: String,
    confidence: f32,
    metadata: BTreeMap<String, String>,
}

impl TrackingTaskSrv {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        outputs: Arc<dyn OutputCatalog>,
        supervisor: Arc<Supervisor>,
        model_path: PathBuf,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let worker = TrackWorker {
            registry: registry.clone(),
            outputs: outputs.clone(),
            supervisor: supervisor.clone(),
            model_path,
        };
        let shutdown = supervisor.shutdown_token();
        supervisor.spawn_worker(worker.run(queue_rx, shutdown));

        Self {
            core: ServiceCore {
                registry,
                outputs,
                supervisor,
            },
            queue_tx,
        }
    }
}

impl TaskService for TrackingTaskSrv {
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

        let target = self
            .core
            .outputs
            .get_by_name(require_param(&params, "targetname")?)?;
        if target.media_type != output_type::VIDEO_MP4 {
            return Err(Error::Validation(format!(
                "output \"{}\" is {}, tracking needs {}",
                target.name,
                target.media_type,
                output_type::VIDEO_MP4
            )));
        }

        let confidence = match params.get("confidence") {
            Some(value) => value.parse::<f32>().map_err(|_| {
                Error::Validation(format!("confidence \"{value}\" is not a number"))
            })?,
            None => DEFAULT_CONFIDENCE,
        };

        // Context from the recording rides along on the tracking task and
        // its outputs.
        let carry = |key: &str| {
            target
                .metadata
                .get(key)
                .cloned()
                .unwrap_or_else(|| "N/A".to_string())
        };
        let mut task_params = BTreeMap::new();
        let _ = task_params.insert("targetname".to_string(), target.name.clone());
        let _ = task_params.insert("confidence".to_string(), confidence.to_string());
        let _ = task_params.insert("cctv".to_string(), carry("cctv"));
        let _ = task_params.insert("startat".to_string(), carry("startat"));
        let _ = task_params.insert("endat".to_string(), carry("endat"));

        let task = self.core.registry.add(TaskItem::new(
            LABEL,
            task_params.clone(),
            "queued for tracking",
        ))?;

        let token = self.core.supervisor.register(&task.id);
        info!("Queued tracking task {} on \"{}\"", task.id, target.name);

        self.queue_tx
            .send(TrackJob {
                task_id: task.id.clone(),
                token,
                input_name: target.name,
                confidence,
                metadata: task_params,
            })
            .map_err(|_| Error::External("the tracking worker is gone".to_string()))?;

        Ok(task)
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.core.stop(id)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.core.delete(id)
    }
}

struct TrackWorker {
    registry: Arc<dyn TaskRegistry>,
    outputs: Arc<dyn OutputCatalog>,
    supervisor: Arc<Supervisor>,
    model_path: PathBuf,
}

impl TrackWorker {
    /// Single-worker FIFO loop: exactly one tracking job runs at a time.
    async fn run(
        self,
        mut queue_rx: mpsc::UnboundedReceiver<TrackJob>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                job = queue_rx.recv() => {
                    let Some(job) = job else { break };
                    let task_id = job.task_id.clone();
                    let result = self.run_job(job).await;
                    self.supervisor.conclude(&task_id, result);
                }
            }
        }
        info!("Tracking worker stopped");
    }

    async fn run_job(&self, job: TrackJob) -> Result<String> {
        // The task may have been cancelled while it sat in the queue.
        if job.token.is_cancelled() {
            return Err(Error::Canceled(
                "tracking was cancelled while queued".to_string(),
            ));
        }

        let outputs_dir = self.outputs.outputs_dir().to_owned();
        let input_path = outputs_dir.join(&job.input_name);
        let video_path = outputs_dir.join(format!("{}.mp4", job.task_id));
        let csv_path = outputs_dir.join(format!("{}.csv", job.task_id));

        let result = self
            .track_frames(&job, &input_path, &video_path, &csv_path)
            .await;

        if result.is_err() {
            // Nothing partial is registered; nothing partial stays on disk.
            remove_if_exists(&video_path);
            remove_if_exists(&csv_path);
        }
        result
    }

    async fn track_frames(
        &self,
        job: &TrackJob,
        input_path: &Path,
        video_path: &Path,
        csv_path: &Path,
    ) -> Result<String> {
        let detector = ObjectDetector::load(
            &self.model_path,
            DetectorConfig {
                confidence_threshold: job.confidence,
                ..Default::default()
            },
        )
        .map_err(Error::external)?;
        let mut tracker = IouTracker::new(TrackerConfig::default());

        let info = probe_video(input_path).await.map_err(Error::external)?;

        let mut reader = FrameReader::open(input_path, info.width, info.height)
            .await
            .map_err(Error::external)?;
        let mut writer = FrameWriter::create(video_path, info.width, info.height, info.fps)
            .await
            .map_err(Error::external)?;

        let _ = self.registry.update(
            &job.task_id,
            TaskState::Started,
            "input opened, tracking objects",
        )?;

        let total_frames = info.total_frames.max(1);
        let mut rows: Vec<DetectionRow> = Vec::new();
        let mut frame_index: u64 = 0;

        while let Some(mut frame) = reader.next_frame().await.map_err(Error::external)? {
            if job.token.is_cancelled() {
                return Err(Error::Canceled(
                    "tracking was cancelled by request".to_string(),
                ));
            }

            let detections = detector.detect(&frame).map_err(Error::external)?;
            for track in tracker.update(&detections) {
                let [x, y, w, h] = track.bbox;
                let (cx, cy) = track.center();

                draw_rect(
                    &mut frame,
                    x as i64,
                    y as i64,
                    (x + w) as i64,
                    (y + h) as i64,
                    GREEN,
                    2,
                );
                draw_circle_filled(&mut frame, cx as i64, cy as i64, 2, GREEN);

                rows.push(DetectionRow {
                    frame: frame_index,
                    objid: track.track_id,
                    clsid: track.class_id as i64,
                    x: cx.round() as i64,
                    y: cy.round() as i64,
                });
            }

            writer.write_frame(&frame).await.map_err(Error::external)?;
            frame_index += 1;
            self.registry
                .set_progress(&job.task_id, frame_index as f64 / total_frames as f64)?;
        }

        reader.close().await.map_err(Error::external)?;
        writer.finish().await.map_err(Error::external)?;

        table::write_detections(csv_path, &rows)?;

        let mut metadata = job.metadata.clone();
        let _ = metadata.insert("fps".to_string(), format!("{}", info.fps.round() as i64));
        let cctv = metadata.get("cctv").cloned().unwrap_or_default();

        let _ = self.outputs.save(TaskOutput::new(
            &job.task_id,
            &format!("{}.csv", job.task_id),
            output_type::TEXT_DETECTION,
            &format!("{cctv} object tracks"),
            metadata.clone(),
        ))?;
        let _ = self.outputs.save(TaskOutput::new(
            &job.task_id,
            &format!("{}.mp4", job.task_id),
            output_type::VIDEO_MP4,
            &format!("{cctv} annotated tracking video"),
            metadata,
        ))?;

        Ok(format!(
            "object tracking finished over {frame_index} frames"
        ))
    }
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to remove {}: {err}", path.display()),
    }
}
