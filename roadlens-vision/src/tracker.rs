use crate::detector::{Detection, iou};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    pub iou_threshold: f32,
    /// Frames a track survives without a matching detection.
    pub max_age: u32,
    /// Consecutive hits before a track is reported as confirmed.
    pub min_hits: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 10,
            min_hits: 3,
        }
    }
}

/// A confirmed track as reported to the caller.
#[derive(Debug, Clone)]
pub struct TrackState {
    pub track_id: u32,
    pub class_id: usize,
    /// Left, top, width, height in frame pixels.
    pub bbox: [f32; 4],
}

impl TrackState {
    pub fn center(&self) -> (f32, f32) {
        (
            self.bbox[0] + self.bbox[2] / 2.0,
            self.bbox[1] + self.bbox[3] / 2.0,
        )
    }
}

#[derive(Debug)]
struct Track {
    id: u32,
    bbox: [f32; 4],
    class_id: usize,
    hits: u32,
    time_since_update: u32,
    confirmed: bool,
}

/// Greedy IoU multi-object tracker.
///
/// Detections are matched to live tracks by best IoU; unmatched
/// detections open new tracks, and tracks expire after `max_age` frames
/// without an update. A track is confirmed once it has been matched
/// `min_hits` times, which filters single-frame false positives.
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Advance one frame. Returns the confirmed tracks that were updated
    /// by a detection in this frame.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackState> {
        for track in &mut self.tracks {
            track.time_since_update += 1;
        }

        let (matches, unmatched_detections) = self.match_detections(detections);

        for (track_idx, det_idx) in matches {
            let det = &detections[det_idx];
            let track = &mut self.tracks[track_idx];
            track.bbox = [det.x, det.y, det.width, det.height];
            track.class_id = det.class_id;
            track.hits += 1;
            track.time_since_update = 0;
            if track.hits >= self.config.min_hits {
                track.confirmed = true;
            }
        }

        for det_idx in unmatched_detections {
            let det = &detections[det_idx];
            self.tracks.push(Track {
                id: self.next_id,
                bbox: [det.x, det.y, det.width, det.height],
                class_id: det.class_id,
                hits: 1,
                time_since_update: 0,
                confirmed: self.config.min_hits <= 1,
            });
            self.next_id += 1;
        }

        let max_age = self.config.max_age;
        self.tracks.retain(|t| t.time_since_update <= max_age);

        self.tracks
            .iter()
            .filter(|t| t.confirmed && t.time_since_update == 0)
            .map(|t| TrackState {
                track_id: t.id,
                class_id: t.class_id,
                bbox: t.bbox,
            })
            .collect()
    }

    /// Greedy best-IoU assignment between live tracks and detections.
    fn match_detections(&self, detections: &[Detection]) -> (Vec<(usize, usize)>, Vec<usize>) {
        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for (i, track) in self.tracks.iter().enumerate() {
            let track_det = Detection {
                x: track.bbox[0],
                y: track.bbox[1],
                width: track.bbox[2],
                height: track.bbox[3],
                class_id: track.class_id,
                confidence: 1.0,
            };
            for (j, det) in detections.iter().enumerate() {
                let overlap = iou(&track_det, det);
                if overlap >= self.config.iou_threshold {
                    candidates.push((i, j, overlap));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut matches = Vec::new();
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_detections = vec![false; detections.len()];
        for (track_idx, det_idx, _) in candidates {
            if !matched_tracks[track_idx] && !matched_detections[det_idx] {
                matches.push((track_idx, det_idx));
                matched_tracks[track_idx] = true;
                matched_detections[det_idx] = true;
            }
        }

        let unmatched = (0..detections.len())
            .filter(|&j| !matched_detections[j])
            .collect();
        (matches, unmatched)
    }
}
