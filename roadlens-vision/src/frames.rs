use crate::{VisionError, VisionResult};
use image::RgbImage;
use std::{path::Path, process::Stdio};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::debug;

/// Frame-by-frame decoder: an ffmpeg child streaming raw RGB24 frames on
/// its stdout pipe.
pub struct FrameReader {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
}

impl FrameReader {
    #[tracing::instrument]
    pub async fn open(path: &Path, width: u32, height: u32) -> VisionResult<Self> {
        let _ = which::which("ffmpeg").map_err(|_| VisionError::FfmpegNotFound)?;

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| VisionError::Decode(format!("failed to spawn ffmpeg: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VisionError::Decode("ffmpeg stdout was not captured".into()))?;

        debug!("Decoding {} at {}x{}", path.display(), width, height);
        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            width,
            height,
        })
    }

    /// Next decoded frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> VisionResult<Option<RgbImage>> {
        let frame_len = (self.width * self.height * 3) as usize;
        let mut buffer = vec![0u8; frame_len];

        match self.stdout.read_exact(&mut buffer).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(VisionError::Decode(err.to_string())),
        }

        RgbImage::from_raw(self.width, self.height, buffer)
            .map(Some)
            .ok_or_else(|| VisionError::Decode("frame buffer size mismatch".into()))
    }

    /// Wait for the decoder to exit. The child is killed on drop anyway;
    /// this is the clean-shutdown path.
    pub async fn close(mut self) -> VisionResult<()> {
        drop(self.stdout);
        let _ = self.child.wait().await?;
        Ok(())
    }
}

/// Frame-by-frame encoder: raw RGB24 frames piped into an ffmpeg child
/// that writes an mp4.
pub struct FrameWriter {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    width: u32,
    height: u32,
}

impl FrameWriter {
    #[tracing::instrument]
    pub async fn create(path: &Path, width: u32, height: u32, fps: f64) -> VisionResult<Self> {
        let _ = which::which("ffmpeg").map_err(|_| VisionError::FfmpegNotFound)?;

        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{width}x{height}"),
                "-r",
                &format!("{fps}"),
                "-i",
                "-",
                "-c:v",
                "mpeg4",
                "-q:v",
                "5",
                "-pix_fmt",
                "yuv420p",
            ])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| VisionError::Encode(format!("failed to spawn ffmpeg: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VisionError::Encode("ffmpeg stdin was not captured".into()))?;

        debug!("Encoding {} at {}x{}@{}", path.display(), width, height, fps);
        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            width,
            height,
        })
    }

    pub async fn write_frame(&mut self, frame: &RgbImage) -> VisionResult<()> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(VisionError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        self.stdin
            .write_all(frame.as_raw())
            .await
            .map_err(|err| VisionError::Encode(err.to_string()))
    }

    /// Flush, close the pipe and wait for the encoder to finish the file.
    pub async fn finish(mut self) -> VisionResult<()> {
        self.stdin
            .flush()
            .await
            .map_err(|err| VisionError::Encode(err.to_string()))?;
        drop(self.stdin);

        let status = self.child.wait().await?;
        if !status.success() {
            return Err(VisionError::Encode(format!(
                "ffmpeg encoder exited with {status}"
            )));
        }
        Ok(())
    }
}
