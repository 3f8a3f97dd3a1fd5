use crate::{VisionError, VisionResult};
use serde::Deserialize;
use std::{path::Path, process::Stdio};
use tokio::process::Command;
use tracing::debug;

/// Stream parameters of a video file.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u64,
    pub duration: f64,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

/// Read width/height/fps/frame-count from a video file via ffprobe.
#[tracing::instrument]
pub async fn probe_video(path: &Path) -> VisionResult<VideoInfo> {
    if !path.exists() {
        return Err(VisionError::FileNotFound(path.to_owned()));
    }
    let _ = which::which("ffprobe").map_err(|_| VisionError::FfprobeNotFound)?;

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(VisionError::ProbeFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| VisionError::NoVideoStream(path.to_owned()))?;

    let duration = probe
        .format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let fps = stream
        .avg_frame_rate
        .as_ref()
        .or(stream.r_frame_rate.as_ref())
        .and_then(|r| parse_frame_rate(r))
        .unwrap_or(30.0);

    // Not every container carries nb_frames; fall back to duration * fps.
    let total_frames = stream
        .nb_frames
        .as_ref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or_else(|| (duration * fps).round() as u64);

    let info = VideoInfo {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps,
        total_frames,
        duration,
    };
    debug!("Probed {}: {:?}", path.display(), info);
    Ok(info)
}

/// Parse an ffprobe rate string such as "30/1" or "29.97".
fn parse_frame_rate(value: &str) -> Option<f64> {
    if let Some((num, den)) = value.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
    }
    value.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_frame_rate_fraction() {
        assert!((parse_frame_rate("30/1").unwrap() - 30.0).abs() < 0.01);
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_frame_rate_decimal() {
        assert!((parse_frame_rate("25").unwrap() - 25.0).abs() < 0.01);
    }

    #[test]
    fn test_parse_frame_rate_zero_denominator() {
        assert!(parse_frame_rate("0/0").is_none());
    }

    #[test]
    fn test_probe_output_parses_missing_nb_frames() {
        let json = r#"{
            "format": {"duration": "5.0"},
            "streams": [{"codec_type": "video", "width": 640, "height": 360, "avg_frame_rate": "30/1"}]
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert!(probe.streams[0].nb_frames.is_none());
        assert_eq!(probe.streams[0].width, Some(640));
        assert_eq!(probe.format.duration.as_deref(), Some("5.0"));
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let result = probe_video(Path::new("/does/not/exist.mp4")).await;
        assert!(matches!(result, Err(VisionError::FileNotFound(_))));
    }
}
