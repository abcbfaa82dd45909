//! RAW development for the stripper.
//!
//! Turns Canon RAW sensor data into an sRGB image with default settings:
//! black/white level normalization, as-shot white balance, bilinear
//! demosaic, camera to sRGB color matrix, sRGB gamma. Nothing from the RAW
//! container is carried into the result.

#[cfg(not(feature = "raw"))]
use crate::error::ProcessError;
#[cfg(not(feature = "raw"))]
use image::RgbImage;
#[cfg(not(feature = "raw"))]
use std::path::Path;

#[cfg(not(feature = "raw"))]
pub fn develop_file(path: &Path) -> Result<RgbImage, ProcessError> {
    Err(ProcessError::RawUnsupported(format!(
        "{}: built without the `raw` feature",
        path.display()
    )))
}

#[cfg(feature = "raw")]
pub use develop::develop_file;

#[cfg(feature = "raw")]
mod develop {
    use cgmath::{Matrix, Matrix3, SquareMatrix};
    use image::RgbImage;
    use std::path::Path;

    use crate::error::ProcessError;

    /// sRGB (D65) to CIE XYZ, row-major.
    const SRGB_TO_XYZ: [[f32; 3]; 3] = [
        [0.412_453, 0.357_580, 0.180_423],
        [0.212_671, 0.715_160, 0.072_169],
        [0.019_334, 0.119_193, 0.950_227],
    ];

    /// Decode and develop a RAW file.
    pub fn develop_file(path: &Path) -> Result<RgbImage, ProcessError> {
        let raw = rawloader::RawLoader::new()
            .decode_file(path)
            .map_err(|e| ProcessError::Codec(format!("failed to decode RAW: {e:?}")))?;

        log::debug!(
            "RAW {} {}: {}x{}, cpp={}, wb={:?}",
            raw.clean_make,
            raw.clean_model,
            raw.width,
            raw.height,
            raw.cpp,
            raw.wb_coeffs
        );

        let (width, height) = (raw.width, raw.height);
        if width == 0 || height == 0 {
            return Err(ProcessError::Codec("RAW image has no pixels".into()));
        }

        let samples: Vec<f32> = match &raw.data {
            rawloader::RawImageData::Integer(values) => values.iter().map(|v| *v as f32).collect(),
            rawloader::RawImageData::Float(values) => values.clone(),
        };
        if samples.len() != width * height * raw.cpp {
            return Err(ProcessError::Codec(format!(
                "RAW has {} samples, expected {}",
                samples.len(),
                width * height * raw.cpp
            )));
        }

        let rgb = if raw.cpp == 1 {
            let color_at = |row: usize, col: usize| channel(raw.cfa.color_at(row, col));
            let levels = Levels::new(raw.blacklevels, raw.whitelevels);
            let wb = white_balance(raw.wb_coeffs);
            let mosaic: Vec<f32> = samples
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let c = color_at(i / width, i % width);
                    levels.normalize(*v, c) * wb[c]
                })
                .collect();
            demosaic_bilinear(&mosaic, width, height, color_at)
        } else if raw.cpp == 3 {
            let levels = Levels::new(raw.blacklevels, raw.whitelevels);
            let wb = white_balance(raw.wb_coeffs);
            samples
                .chunks_exact(3)
                .map(|px| {
                    [
                        levels.normalize(px[0], 0) * wb[0],
                        levels.normalize(px[1], 1) * wb[1],
                        levels.normalize(px[2], 2) * wb[2],
                    ]
                })
                .collect()
        } else {
            return Err(ProcessError::Codec(format!(
                "unsupported RAW layout: {} components per pixel",
                raw.cpp
            )));
        };

        let matrix = cam_to_srgb(raw.xyz_to_cam);
        let img = to_srgb_image(&rgb, width, height, &matrix)?;
        Ok(crop(img, raw.crops))
    }

    /// Map a CFA color index to R/G/B. Index 3 is the second green.
    fn channel(color: usize) -> usize {
        if color >= 3 { 1 } else { color }
    }

    struct Levels {
        black: [f32; 3],
        range: [f32; 3],
    }

    impl Levels {
        fn new(black: [u16; 4], white: [u16; 4]) -> Self {
            let mut levels = Self {
                black: [0.0; 3],
                range: [1.0; 3],
            };
            for c in 0..3 {
                let b = black[c] as f32;
                let w = white[c] as f32;
                levels.black[c] = b;
                levels.range[c] = if w > b { w - b } else { 1.0 };
            }
            levels
        }

        fn normalize(&self, value: f32, c: usize) -> f32 {
            ((value - self.black[c]) / self.range[c]).clamp(0.0, 1.0)
        }
    }

    /// As-shot multipliers scaled so green is 1. Unusable values fall back
    /// to neutral.
    pub(super) fn white_balance(coeffs: [f32; 4]) -> [f32; 3] {
        let g = coeffs[1];
        if !g.is_finite() || g <= 0.0 {
            return [1.0; 3];
        }
        let scale = |v: f32| if v.is_finite() && v > 0.0 { v / g } else { 1.0 };
        [scale(coeffs[0]), 1.0, scale(coeffs[2])]
    }

    /// Bilinear demosaic: each output channel is the mean of the same-color
    /// samples in the 3x3 neighbourhood.
    pub(super) fn demosaic_bilinear(
        mosaic: &[f32],
        width: usize,
        height: usize,
        color_at: impl Fn(usize, usize) -> usize,
    ) -> Vec<[f32; 3]> {
        let mut out = Vec::with_capacity(width * height);
        for row in 0..height {
            for col in 0..width {
                let mut sum = [0.0f32; 3];
                let mut count = [0u32; 3];
                for r in row.saturating_sub(1)..=(row + 1).min(height - 1) {
                    for c in col.saturating_sub(1)..=(col + 1).min(width - 1) {
                        let ch = color_at(r, c);
                        sum[ch] += mosaic[r * width + c];
                        count[ch] += 1;
                    }
                }
                let own = color_at(row, col);
                let mut px = [0.0f32; 3];
                for ch in 0..3 {
                    px[ch] = if ch == own {
                        mosaic[row * width + col]
                    } else if count[ch] > 0 {
                        sum[ch] / count[ch] as f32
                    } else {
                        0.0
                    };
                }
                out.push(px);
            }
        }
        out
    }

    /// Camera RGB to linear sRGB.
    ///
    /// Builds `xyz_to_cam * srgb_to_xyz`, normalizes each row to sum to one
    /// so white stays white, and inverts. Falls back to identity when the
    /// camera matrix is missing or singular.
    pub(super) fn cam_to_srgb(xyz_to_cam: [[f32; 3]; 4]) -> Matrix3<f32> {
        // cgmath is column-major: Matrix3::new takes columns.
        let row_major = |m: [[f32; 3]; 3]| {
            Matrix3::new(
                m[0][0], m[1][0], m[2][0],
                m[0][1], m[1][1], m[2][1],
                m[0][2], m[1][2], m[2][2],
            )
        };

        let cam = row_major([xyz_to_cam[0], xyz_to_cam[1], xyz_to_cam[2]]);
        if cam.determinant().abs() < f32::EPSILON {
            log::debug!("No usable camera matrix, skipping color conversion");
            return Matrix3::identity();
        }

        let mut srgb_to_cam = cam * row_major(SRGB_TO_XYZ);
        for r in 0..3 {
            let sum = srgb_to_cam.row(r).x + srgb_to_cam.row(r).y + srgb_to_cam.row(r).z;
            if sum.abs() > f32::EPSILON {
                for c in 0..3 {
                    srgb_to_cam[c][r] /= sum;
                }
            }
        }

        srgb_to_cam.invert().unwrap_or_else(|| {
            log::debug!("Camera matrix is singular, skipping color conversion");
            Matrix3::identity()
        })
    }

    /// sRGB transfer curve.
    pub(super) fn gamma(linear: f32) -> f32 {
        let v = linear.clamp(0.0, 1.0);
        if v <= 0.003_130_8 {
            v * 12.92
        } else {
            1.055 * v.powf(1.0 / 2.4) - 0.055
        }
    }

    pub(super) fn to_srgb_image(
        rgb: &[[f32; 3]],
        width: usize,
        height: usize,
        matrix: &Matrix3<f32>,
    ) -> Result<RgbImage, ProcessError> {
        let mut bytes = Vec::with_capacity(width * height * 3);
        for px in rgb {
            let v = *matrix * cgmath::Vector3::new(px[0], px[1], px[2]);
            for linear in [v.x, v.y, v.z] {
                bytes.push((gamma(linear) * 255.0).round() as u8);
            }
        }
        RgbImage::from_raw(width as u32, height as u32, bytes)
            .ok_or_else(|| {
                ProcessError::Codec("RAW sample count does not match its dimensions".into())
            })
    }

    /// Apply rawloader's `[top, right, bottom, left]` crop.
    fn crop(img: RgbImage, crops: [usize; 4]) -> RgbImage {
        let [top, right, bottom, left] = crops.map(|v| v as u32);
        let (w, h) = img.dimensions();
        if left + right >= w || top + bottom >= h || crops == [0; 4] {
            return img;
        }
        image::imageops::crop_imm(&img, left, top, w - left - right, h - top - bottom).to_image()
    }

}
