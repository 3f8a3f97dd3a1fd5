use crate::{VisionError, VisionResult, probe_video};
use rand::Rng;
use std::{path::Path, process::Stdio};
use tokio::process::Command;
use tracing::debug;

/// Extract one frame of a video as a JPEG.
///
/// With `frame_number` unset, frame 0 is used; with `random` set, a frame
/// is picked uniformly. The two options are mutually exclusive.
#[tracing::instrument]
pub async fn video_frame_jpeg(
    path: &Path,
    frame_number: Option<u64>,
    random: bool,
) -> VisionResult<Vec<u8>> {
    if frame_number.is_some() && random {
        return Err(VisionError::Decode(
            "frame_number and random cannot be used together".into(),
        ));
    }

    let info = probe_video(path).await?;
    let total = info.total_frames.max(1);

    let frame = match frame_number {
        Some(requested) => {
            if requested >= total {
                return Err(VisionError::FrameOutOfRange { requested, total });
            }
            requested
        }
        None if random => rand::thread_rng().gen_range(0..total),
        None => 0,
    };
    debug!("Extracting frame {frame}/{total} of {}", path.display());

    let _ = which::which("ffmpeg").map_err(|_| VisionError::FfmpegNotFound)?;

    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-i"])
        .arg(path)
        .args([
            "-vf",
            &format!("select=eq(n\\,{frame})"),
            "-frames:v",
            "1",
            "-f",
            "image2",
            "-c:v",
            "mjpeg",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() || output.stdout.is_empty() {
        return Err(VisionError::Decode(format!(
            "frame extraction failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(output.stdout)
}
