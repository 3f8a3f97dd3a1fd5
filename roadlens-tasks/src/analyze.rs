use crate::{
    Supervisor, TaskService,
    service::ServiceCore,
    table::{self, AnalysisRow},
};
use roadlens_common::{
    Error, Result, TaskItem, TaskOutput, TaskParamMeta, TaskState, output_type, require_param,
    validate_params,
};
use roadlens_store::{OutputCatalog, TaskRegistry};
use roadlens_vision::{FrameReader, FrameWriter, GREEN, Homography, draw_line, probe_video};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

const LABEL: &str = "analysis";

const PARAMS: &[TaskParamMeta] = &[
    TaskParamMeta::new("trackdata", "detection table to analyse", &["text/detection"]),
    TaskParamMeta::new("roi", "road quadrilateral [lt, lb, rt, rb]", &["json"]),
    TaskParamMeta::new("roadwidth", "road width in metres", &["float"]),
    TaskParamMeta::new("roadheight", "road length in metres", &["float"]),
];

/// Points kept per object when drawing trails on the top-down video.
const TRAIL_LEN: usize = 30;

/// Rectifies tracked positions into a top-down road plane, interpolates
/// the gaps, estimates per-object speed and renders the warped trail
/// video.
pub struct AnalysisTaskSrv {
    core: ServiceCore,
}

impl AnalysisTaskSrv {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        outputs: Arc<dyn OutputCatalog>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            core: ServiceCore {
                registry,
                outputs,
                supervisor,
            },
        }
    }
}

impl TaskService for AnalysisTaskSrv {
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

        let trackdata = self
            .core
            .outputs
            .get_by_name(require_param(&params, "trackdata")?)?;
        if trackdata.media_type != output_type::TEXT_DETECTION {
            return Err(Error::Validation(format!(
                "output \"{}\" is {}, analysis needs {}",
                trackdata.name,
                trackdata.media_type,
                output_type::TEXT_DETECTION
            )));
        }

        let roi = parse_roi(require_param(&params, "roi")?)?;
        let roadwidth = parse_positive_metres(&params, "roadwidth")?;
        let roadheight = parse_positive_metres(&params, "roadheight")?;

        // The destination rectangle hangs off the ROI's bottom edge: its
        // pixel width, and a height scaled by the real road proportions.
        let (dst, width, height) = destination_rectangle(&roi, roadheight / roadwidth);

        let carry = |key: &str| {
            trackdata
                .metadata
                .get(key)
                .cloned()
                .unwrap_or_else(|| "N/A".to_string())
        };
        let fps: f64 = trackdata
            .metadata
            .get("fps")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30.0);

        let mut task_params = BTreeMap::new();
        let _ = task_params.insert("trackdata".to_string(), trackdata.name.clone());
        let _ = task_params.insert("srcpoints".to_string(), points_json(&roi));
        let _ = task_params.insert("dstpoints".to_string(), points_json(&dst));
        let _ = task_params.insert("roadwidth".to_string(), roadwidth.to_string());
        let _ = task_params.insert("roadheight".to_string(), roadheight.to_string());
        let _ = task_params.insert("fps".to_string(), fps.to_string());
        let _ = task_params.insert("targetname".to_string(), carry("targetname"));
        let _ = task_params.insert("confidence".to_string(), carry("confidence"));
        let _ = task_params.insert("cctv".to_string(), carry("cctv"));
        let _ = task_params.insert("startat".to_string(), carry("startat"));
        let _ = task_params.insert("endat".to_string(), carry("endat"));

        let task = self.core.registry.add(TaskItem::new(
            LABEL,
            task_params.clone(),
            "queued for analysis",
        ))?;

        let token = self.core.supervisor.register(&task.id);
        info!("Submitted analysis task {} on \"{}\"", task.id, trackdata.name);

        self.core.supervisor.spawn(
            task.id.clone(),
            run_analysis(AnalysisJob {
                registry: self.core.registry.clone(),
                outputs: self.core.outputs.clone(),
                token,
                task_id: task.id.clone(),
                trackdata: trackdata.name,
                roi,
                dst,
                width,
                height,
                roadheight,
                fps,
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

fn parse_roi(value: &str) -> Result<[(f64, f64); 4]> {
    let points: Vec<(f64, f64)> = serde_json::from_str(value)
        .map_err(|err| Error::Validation(format!("roi is not a JSON point array: {err}")))?;
    points
        .try_into()
        .map_err(|_| Error::Validation("roi must contain exactly four [x, y] points".to_string()))
}

fn parse_positive_metres(params: &BTreeMap<String, String>, name: &str) -> Result<f64> {
    let value = require_param(params, name)?;
    let metres: f64 = value
        .parse()
        .map_err(|_| Error::Validation(format!("{name} \"{value}\" is not a number")))?;
    if metres <= 0.0 {
        return Err(Error::Validation(format!("{name} must be positive")));
    }
    Ok(metres)
}

/// Destination points `(0,0), (0,h), (w,0), (w,h)` where `w` is the pixel
/// length of the ROI's bottom edge (lb to rb) and `h = round(w * ratio)`.
fn destination_rectangle(roi: &[(f64, f64); 4], ratio: f64) -> ([(f64, f64); 4], u32, u32) {
    let (lb, rb) = (roi[1], roi[3]);
    let width = ((lb.0 - rb.0).powi(2) + (lb.1 - rb.1).powi(2)).sqrt().round();
    let height = (width * ratio).round();

    let dst = [
        (0.0, 0.0),
        (0.0, height),
        (width, 0.0),
        (width, height),
    ];
    (dst, width as u32, height as u32)
}

fn points_json(points: &[(f64, f64); 4]) -> String {
    let rounded: Vec<[i64; 2]> = points
        .iter()
        .map(|&(x, y)| [x.round() as i64, y.round() as i64])
        .collect();
    serde_json::to_string(&rounded).expect("point list should serialise")
}

struct AnalysisJob {
    registry: Arc<dyn TaskRegistry>,
    outputs: Arc<dyn OutputCatalog>,
    token: CancellationToken,
    task_id: String,
    trackdata: String,
    roi: [(f64, f64); 4],
    dst: [(f64, f64); 4],
    width: u32,
    height: u32,
    roadheight: f64,
    fps: f64,
    metadata: BTreeMap<String, String>,
}

async fn run_analysis(job: AnalysisJob) -> Result<String> {
    let outputs_dir = job.outputs.outputs_dir().to_owned();
    let csv_path = outputs_dir.join(format!("{}.csv", job.task_id));
    let video_path = outputs_dir.join(format!("{}.mp4", job.task_id));

    let result = analyse(&job, &outputs_dir, &csv_path, &video_path).await;

    if result.is_err() {
        // No partial outputs on failure.
        remove_if_exists(&csv_path);
        remove_if_exists(&video_path);
    }
    result
}

async fn analyse(
    job: &AnalysisJob,
    outputs_dir: &Path,
    csv_path: &Path,
    video_path: &Path,
) -> Result<String> {
    let _ = job.registry.update(
        &job.task_id,
        TaskState::Started,
        "analysing tracking data",
    )?;

    let transform = Homography::from_quad(&job.roi, &job.dst).map_err(Error::external)?;

    let detections = table::read_detections(&outputs_dir.join(&job.trackdata))?;
    if job.token.is_cancelled() {
        return Err(Error::Canceled("analysis was cancelled by request".to_string()));
    }

    let projected = table::project(&detections, &transform, job.width, job.height);
    let mut rows = table::interpolate(projected);
    let meter_per_pixel = job.roadheight / job.height as f64;
    table::compute_speed(&mut rows, meter_per_pixel, job.fps);

    table::write_analysis(csv_path, &rows)?;
    job.registry.set_progress(&job.task_id, 0.5)?;

    // Second pass: warp the source video to the road plane and draw the
    // recent trail of every object visible in each frame.
    let source_name = &job.metadata["targetname"];
    let source_path = outputs_dir.join(source_name);
    if !source_path.exists() {
        return Err(Error::NotFound(format!("source video \"{source_name}\"")));
    }

    let mut by_frame: HashMap<u64, Vec<&AnalysisRow>> = HashMap::new();
    for row in &rows {
        by_frame.entry(row.frame).or_default().push(row);
    }

    let info = probe_video(&source_path).await.map_err(Error::external)?;
    let mut reader = FrameReader::open(&source_path, info.width, info.height)
        .await
        .map_err(Error::external)?;
    let mut writer = FrameWriter::create(video_path, job.width, job.height, job.fps)
        .await
        .map_err(Error::external)?;

    let total_frames = info.total_frames.max(1);
    let mut trail_history: HashMap<u32, Vec<(i64, i64)>> = HashMap::new();
    let mut frame_index: u64 = 0;

    while let Some(frame) = reader.next_frame().await.map_err(Error::external)? {
        if job.token.is_cancelled() {
            return Err(Error::Canceled("analysis was cancelled by request".to_string()));
        }

        let mut warped = transform
            .warp_image(&frame, job.width, job.height)
            .map_err(Error::external)?;

        let points = by_frame.get(&frame_index).map(Vec::as_slice).unwrap_or(&[]);

        // Objects absent from this frame lose their trail.
        let visible: Vec<u32> = points.iter().map(|r| r.objid).collect();
        trail_history.retain(|objid, _| visible.contains(objid));

        for row in points {
            let trail = trail_history.entry(row.objid).or_default();
            trail.push((row.perspx.round() as i64, row.perspy.round() as i64));
            if trail.len() > TRAIL_LEN {
                let _ = trail.remove(0);
            }

            for pair in trail.windows(2) {
                draw_line(&mut warped, pair[0].0, pair[0].1, pair[1].0, pair[1].1, GREEN);
            }
        }

        writer.write_frame(&warped).await.map_err(Error::external)?;
        frame_index += 1;
        job.registry.set_progress(
            &job.task_id,
            0.5 + 0.5 * frame_index as f64 / total_frames as f64,
        )?;
    }

    reader.close().await.map_err(Error::external)?;
    writer.finish().await.map_err(Error::external)?;

    // Nothing is registered until everything has been produced, so a
    // failure anywhere above emits no partial outputs.
    let _ = job.outputs.save(TaskOutput::new(
        &job.task_id,
        &format!("{}.csv", job.task_id),
        output_type::TEXT_CSV,
        &format!("{} rectified track analysis", job.metadata["cctv"]),
        job.metadata.clone(),
    ))?;
    let _ = job.outputs.save(TaskOutput::new(
        &job.task_id,
        &format!("{}.mp4", job.task_id),
        output_type::VIDEO_MP4,
        &format!("{} top-down track video", job.metadata["cctv"]),
        job.metadata.clone(),
    ))?;

    Ok("analysis finished".to_string())
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("Failed to remove {}: {err}", path.display()),
    }
}
