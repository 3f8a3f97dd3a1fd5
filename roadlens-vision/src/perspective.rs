use crate::{VisionError, VisionResult};
use image::{Rgb, RgbImage};

/// A 3x3 projective transform between image planes.
#[derive(Debug, Clone)]
pub struct Homography {
    m: [[f64; 3]; 3],
}

impl Homography {
    /// Solve the transform mapping four source points onto four
    /// destination points (direct linear transform on the 8 unknowns).
    pub fn from_quad(src: &[(f64, f64); 4], dst: &[(f64, f64); 4]) -> VisionResult<Self> {
        let mut a = [[0.0f64; 9]; 8];

        for (i, (&(x, y), &(u, v))) in src.iter().zip(dst.iter()).enumerate() {
            a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
            a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
        }

        let p = solve_linear_system(&mut a)?;
        Ok(Self {
            m: [
                [p[0], p[1], p[2]],
                [p[3], p[4], p[5]],
                [p[6], p[7], 1.0],
            ],
        })
    }

    /// Map one point through the transform.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let w = self.m[2][0] * x + self.m[2][1] * y + self.m[2][2];
        let u = (self.m[0][0] * x + self.m[0][1] * y + self.m[0][2]) / w;
        let v = (self.m[1][0] * x + self.m[1][1] * y + self.m[1][2]) / w;
        (u, v)
    }

    pub fn inverse(&self) -> VisionResult<Homography> {
        let m = &self.m;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);

        if det.abs() < 1e-12 {
            return Err(VisionError::DegenerateHomography);
        }

        let inv = [
            [
                (m[1][1] * m[2][2] - m[1][2] * m[2][1]) / det,
                (m[0][2] * m[2][1] - m[0][1] * m[2][2]) / det,
                (m[0][1] * m[1][2] - m[0][2] * m[1][1]) / det,
            ],
            [
                (m[1][2] * m[2][0] - m[1][0] * m[2][2]) / det,
                (m[0][0] * m[2][2] - m[0][2] * m[2][0]) / det,
                (m[0][2] * m[1][0] - m[0][0] * m[1][2]) / det,
            ],
            [
                (m[1][0] * m[2][1] - m[1][1] * m[2][0]) / det,
                (m[0][1] * m[2][0] - m[0][0] * m[2][1]) / det,
                (m[0][0] * m[1][1] - m[0][1] * m[1][0]) / det,
            ],
        ];
        Ok(Homography { m: inv })
    }

    /// Produce the top-down image: every destination pixel is sampled from
    /// the source through the inverse transform with bilinear filtering.
    pub fn warp_image(&self, src: &RgbImage, out_width: u32, out_height: u32) -> VisionResult<RgbImage> {
        let inverse = self.inverse()?;
        let mut out = RgbImage::new(out_width, out_height);

        for v in 0..out_height {
            for u in 0..out_width {
                let (x, y) = inverse.apply(u as f64, v as f64);
                out.put_pixel(u, v, sample_bilinear(src, x, y));
            }
        }
        Ok(out)
    }
}

fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;

    if x0 < 0 || y0 < 0 || x0 + 1 >= w || y0 + 1 >= h {
        return Rgb([0, 0, 0]);
    }

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = img.get_pixel(x0 as u32, y0 as u32);
    let p10 = img.get_pixel(x0 as u32 + 1, y0 as u32);
    let p01 = img.get_pixel(x0 as u32, y0 as u32 + 1);
    let p11 = img.get_pixel(x0 as u32 + 1, y0 as u32 + 1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        result[c] = (top * (1.0 - fy) + bottom * fy).round() as u8;
    }
    Rgb(result)
}

/// Gaussian elimination with partial pivoting over the augmented system.
fn solve_linear_system(a: &mut [[f64; 9]; 8]) -> VisionResult<[f64; 8]> {
    for col in 0..8 {
        let pivot_row = (col..8)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot_row][col].abs() < 1e-12 {
            return Err(VisionError::DegenerateHomography);
        }
        a.swap(col, pivot_row);

        for row in (col + 1)..8 {
            let factor = a[row][col] / a[col][col];
            for k in col..9 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let mut x = [0.0f64; 8];
    for row in (0..8).rev() {
        let mut sum = a[row][8];
        for k in (row + 1)..8 {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}
