pub mod error;
pub use self::error::{VisionError, VisionResult};

mod detector;
pub use self::detector::{Detection, DetectorConfig, ObjectDetector};

mod draw;
pub use self::draw::{GREEN, WHITE, draw_circle_filled, draw_line, draw_rect};

mod frames;
pub use self::frames::{FrameReader, FrameWriter};

mod perspective;
pub use self::perspective::Homography;

mod preview;
pub use self::preview::video_frame_jpeg;

mod probe;
pub use self::probe::{VideoInfo, probe_video};

mod tracker;
pub use self::tracker::{IouTracker, TrackState, TrackerConfig};
