use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum VisionError {
    #[error("ffmpeg binary was not found on PATH")]
    FfmpegNotFound,

    #[error("ffprobe binary was not found on PATH")]
    FfprobeNotFound,

    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("video file {0} was not found")]
    FileNotFound(PathBuf),

    #[error("no video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("video decode failed: {0}")]
    Decode(String),

    #[error("video encode failed: {0}")]
    Encode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("degenerate point correspondence, no homography exists")]
    DegenerateHomography,

    #[error("frame number {requested} out of range, video has {total} frames")]
    FrameOutOfRange { requested: u64, total: u64 },

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type VisionResult<T> = Result<T, VisionError>;
