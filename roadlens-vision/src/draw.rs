use image::{Rgb, RgbImage};

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

fn put_pixel_checked(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && x < img.width() as i64 && y < img.height() as i64 {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Axis-aligned rectangle outline, `thickness` pixels wide, clipped to the
/// image bounds.
pub fn draw_rect(img: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>, thickness: i64) {
    for t in 0..thickness {
        for x in x0..=x1 {
            put_pixel_checked(img, x, y0 + t, color);
            put_pixel_checked(img, x, y1 - t, color);
        }
        for y in y0..=y1 {
            put_pixel_checked(img, x0 + t, y, color);
            put_pixel_checked(img, x1 - t, y, color);
        }
    }
}

pub fn draw_circle_filled(img: &mut RgbImage, cx: i64, cy: i64, radius: i64, color: Rgb<u8>) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_checked(img, cx + dx, cy + dy, color);
            }
        }
    }
}

/// Bresenham line, clipped to the image bounds.
pub fn draw_line(img: &mut RgbImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };

    let (mut x, mut y) = (x0, y0);
    let mut err = dx + dy;
    loop {
        put_pixel_checked(img, x, y, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rect_outline_is_drawn() {
        let mut img = RgbImage::new(20, 20);
        draw_rect(&mut img, 2, 2, 10, 10, GREEN, 1);

        assert_eq!(*img.get_pixel(2, 2), GREEN);
        assert_eq!(*img.get_pixel(10, 2), GREEN);
        assert_eq!(*img.get_pixel(6, 10), GREEN);
        // Interior untouched.
        assert_eq!(*img.get_pixel(6, 6), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_drawing_clips_out_of_bounds() {
        let mut img = RgbImage::new(8, 8);
        draw_rect(&mut img, -5, -5, 20, 20, GREEN, 2);
        draw_line(&mut img, -10, 4, 30, 4, WHITE);
        draw_circle_filled(&mut img, 0, 0, 5, WHITE);
        // Reaching here without a panic is the assertion; spot-check one
        // in-bounds pixel.
        assert_eq!(*img.get_pixel(4, 4), WHITE);
    }

    #[test]
    fn test_line_endpoints() {
        let mut img = RgbImage::new(10, 10);
        draw_line(&mut img, 1, 1, 8, 5, WHITE);
        assert_eq!(*img.get_pixel(1, 1), WHITE);
        assert_eq!(*img.get_pixel(8, 5), WHITE);
    }

    #[test]
    fn test_circle_is_filled() {
        let mut img = RgbImage::new(10, 10);
        draw_circle_filled(&mut img, 5, 5, 2, GREEN);
        assert_eq!(*img.get_pixel(5, 5), GREEN);
        assert_eq!(*img.get_pixel(6, 5), GREEN);
        assert_eq!(*img.get_pixel(5, 3), GREEN);
        assert_eq!(*img.get_pixel(9, 9), Rgb([0, 0, 0]));
    }
}
