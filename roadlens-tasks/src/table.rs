use roadlens_common::{Error, Result};
use roadlens_vision::Homography;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

/// One confirmed track observation, as written by the tracking driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRow {
    pub frame: u64,
    pub objid: u32,
    pub clsid: i64,
    pub x: i64,
    pub y: i64,
}

/// A detection row after rectification, interpolation and speed
/// estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub objid: u32,
    pub frame: u64,
    pub clsid: i64,
    pub x: f64,
    pub y: f64,
    pub perspx: f64,
    pub perspy: f64,
    /// km/h over the speed window; absent for the first frames of each
    /// object.
    pub speed: Option<f64>,
}

/// Frames between the two samples used for speed estimation.
pub(crate) const SPEED_DELTA_FRAMES: u64 = 5;

pub(crate) fn write_detections(path: &Path, rows: &[DetectionRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|err| Error::External(format!("failed to create detection table: {err}")))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| Error::External(format!("failed to write detection row: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| Error::External(format!("failed to flush detection table: {err}")))?;
    Ok(())
}

pub(crate) fn read_detections(path: &Path) -> Result<Vec<DetectionRow>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| Error::External(format!("failed to open detection table: {err}")))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<DetectionRow>, _>>()
        .map_err(|err| Error::External(format!("failed to parse detection table: {err}")))
}

pub(crate) fn write_analysis(path: &Path, rows: &[AnalysisRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|err| Error::External(format!("failed to create analysis table: {err}")))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| Error::External(format!("failed to write analysis row: {err}")))?;
    }
    writer
        .flush()
        .map_err(|err| Error::External(format!("failed to flush analysis table: {err}")))?;
    Ok(())
}

/// Map detections into the rectified plane, dropping points that land
/// outside `[0, width) x [0, height)`.
pub(crate) fn project(
    rows: &[DetectionRow],
    transform: &Homography,
    width: u32,
    height: u32,
) -> Vec<AnalysisRow> {
    rows.iter()
        .filter_map(|row| {
            let (perspx, perspy) = transform.apply(row.x as f64, row.y as f64);
            if perspx < 0.0 || perspx >= width as f64 || perspy < 0.0 || perspy >= height as f64 {
                return None;
            }
            Some(AnalysisRow {
                objid: row.objid,
                frame: row.frame,
                clsid: row.clsid,
                x: row.x as f64,
                y: row.y as f64,
                perspx,
                perspy,
                speed: None,
            })
        })
        .collect()
}

/// Expand every object to its full frame range and fill the gaps: the
/// class carries over, positions interpolate linearly. Output is sorted
/// by `(objid, frame)`.
pub(crate) fn interpolate(rows: Vec<AnalysisRow>) -> Vec<AnalysisRow> {
    let mut by_object: BTreeMap<u32, Vec<AnalysisRow>> = BTreeMap::new();
    for row in rows {
        by_object.entry(row.objid).or_default().push(row);
    }

    let mut result = Vec::new();
    for (_, mut observed) in by_object {
        observed.sort_by_key(|r| r.frame);
        observed.dedup_by_key(|r| r.frame);

        for pair in observed.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            result.push(a.clone());

            let gap = b.frame - a.frame;
            for step in 1..gap {
                let t = step as f64 / gap as f64;
                result.push(AnalysisRow {
                    objid: a.objid,
                    frame: a.frame + step,
                    clsid: a.clsid,
                    x: lerp(a.x, b.x, t),
                    y: lerp(a.y, b.y, t),
                    perspx: lerp(a.perspx, b.perspx, t),
                    perspy: lerp(a.perspy, b.perspy, t),
                    speed: None,
                });
            }
        }
        if let Some(last) = observed.last() {
            result.push(last.clone());
        }
    }
    result
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Per-object speed over a fixed frame window.
///
/// `meter_per_pixel` converts rectified-plane pixels to metres; rows must
/// already be sorted by `(objid, frame)` with contiguous frames per
/// object.
pub(crate) fn compute_speed(rows: &mut [AnalysisRow], meter_per_pixel: f64, fps: f64) {
    let delta_time = SPEED_DELTA_FRAMES as f64 / fps;

    let mut start = 0;
    while start < rows.len() {
        let objid = rows[start].objid;
        let mut end = start;
        while end < rows.len() && rows[end].objid == objid {
            end += 1;
        }

        for i in start..end {
            let window = SPEED_DELTA_FRAMES as usize;
            if i >= start + window {
                let delta = rows[i].perspy - rows[i - window].perspy;
                rows[i].speed = Some(delta * meter_per_pixel / delta_time * 3.6);
            }
        }
        start = end;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(frame: u64, objid: u32, x: i64, y: i64) -> DetectionRow {
        DetectionRow {
            frame,
            objid,
            clsid: 2,
            x,
            y,
        }
    }

    fn analysis(objid: u32, frame: u64, perspy: f64) -> AnalysisRow {
        AnalysisRow {
            objid,
            frame,
            clsid: 2,
            x: 0.0,
            y: 0.0,
            perspx: 0.0,
            perspy,
            speed: None,
        }
    }

    #[test]
    fn test_detection_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");

        let rows = vec![detection(0, 1, 100, 200), detection(1, 1, 104, 206)];
        write_detections(&path, &rows).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("frame,objid,clsid,x,y"));

        let back = read_detections(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_analysis_csv_empty_speed_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.csv");

        let rows = vec![
            analysis(1, 0, 10.0),
            AnalysisRow {
                speed: Some(42.5),
                ..analysis(1, 1, 12.0)
            },
        ];
        write_analysis(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "objid,frame,clsid,x,y,perspx,perspy,speed"
        );
        assert!(lines.next().unwrap().ends_with(","));
        assert!(lines.next().unwrap().ends_with("42.5"));
    }

    #[test]
    fn test_project_drops_out_of_range_points() {
        // Identity-ish transform over a 100x100 plane.
        let quad = [(0.0, 0.0), (0.0, 100.0), (100.0, 0.0), (100.0, 100.0)];
        let transform = Homography::from_quad(&quad, &quad).unwrap();

        let rows = vec![
            detection(0, 1, 50, 50),
            detection(0, 2, 150, 50),
            detection(0, 3, 50, -10),
        ];
        let projected = project(&rows, &transform, 100, 100);

        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].objid, 1);
        assert!((projected[0].perspx - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_interpolate_fills_missing_frames() {
        let rows = vec![
            AnalysisRow {
                x: 0.0,
                perspy: 0.0,
                ..analysis(7, 10, 0.0)
            },
            AnalysisRow {
                x: 30.0,
                perspy: 30.0,
                ..analysis(7, 13, 30.0)
            },
        ];

        let filled = interpolate(rows);
        assert_eq!(filled.len(), 4);

        let frames: Vec<u64> = filled.iter().map(|r| r.frame).collect();
        assert_eq!(frames, vec![10, 11, 12, 13]);

        assert!((filled[1].x - 10.0).abs() < 1e-6);
        assert!((filled[2].perspy - 20.0).abs() < 1e-6);
        // Class carries across the gap.
        assert!(filled.iter().all(|r| r.clsid == 2));
    }

    #[test]
    fn test_interpolate_sorts_by_object_then_frame() {
        let rows = vec![analysis(9, 3, 0.0), analysis(1, 5, 0.0), analysis(9, 1, 0.0)];
        let filled = interpolate(rows);

        let keys: Vec<(u32, u64)> = filled.iter().map(|r| (r.objid, r.frame)).collect();
        assert_eq!(keys, vec![(1, 5), (9, 1), (9, 2), (9, 3)]);
    }

    #[test]
    fn test_speed_formula() {
        // Object moving 2 rectified pixels per frame along y; 1 px = 0.5 m,
        // 25 fps. Expected speed: 2 px * 0.5 m / (1/25 s) * 3.6 = 90 km/h.
        let mut rows: Vec<AnalysisRow> = (0..10)
            .map(|frame| analysis(1, frame, frame as f64 * 2.0))
            .collect();

        compute_speed(&mut rows, 0.5, 25.0);

        for row in &rows[..5] {
            assert!(row.speed.is_none());
        }
        for row in &rows[5..] {
            let speed = row.speed.unwrap();
            assert!((speed - 90.0).abs() < 1e-6, "speed was {speed}");
        }
    }

    #[test]
    fn test_speed_windows_do_not_cross_objects() {
        let mut rows: Vec<AnalysisRow> = (0..7)
            .map(|frame| analysis(1, frame, frame as f64))
            .chain((0..7).map(|frame| analysis(2, frame, 100.0 + frame as f64)))
            .collect();

        compute_speed(&mut rows, 1.0, 30.0);

        // Each object's first five frames carry no speed.
        assert!(rows[7].speed.is_none());
        assert!(rows[12].speed.is_some());
    }
}
