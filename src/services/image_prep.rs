//! Pure raster preprocessing applied to rendered pages before OCR.
//!
//! Every function is deterministic: same input image, same output bytes.

use image::{GrayImage, Luma};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PreprocessOptions {
    pub(crate) denoise: bool,
    pub(crate) equalize: bool,
    pub(crate) binarize: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            denoise: true,
            equalize: true,
            binarize: false,
        }
    }
}

pub(crate) fn preprocess(image: GrayImage, options: PreprocessOptions) -> GrayImage {
    let mut image = image;
    if options.denoise {
        image = median_filter_3x3(&image);
    }
    if options.equalize {
        image = equalize_histogram(&image);
    }
    if options.binarize {
        let threshold = otsu_threshold(&histogram(&image));
        image = binarize(&image, threshold);
    }
    image
}

/// 3x3 median filter with clamped borders. Removes salt-and-pepper noise
/// from camera uploads without blurring stroke edges the way a box filter
/// would.
fn median_filter_3x3(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    GrayImage::from_fn(width, height, |x, y| {
        let mut window = [0u8; 9];
        let mut cursor = 0;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let nx = (x as i32 + dx).clamp(0, width as i32 - 1) as u32;
                let ny = (y as i32 + dy).clamp(0, height as i32 - 1) as u32;
                window[cursor] = image.get_pixel(nx, ny).0[0];
                cursor += 1;
            }
        }
        window.sort_unstable();
        Luma([window[4]])
    })
}

/// Global histogram equalization over 256 bins. Spreads faint pencil
/// strokes across the full value range so thresholding stays stable
/// across lighting conditions.
fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let total = width as u64 * height as u64;
    if total == 0 {
        return image.clone();
    }

    let hist = histogram(image);
    let mut cdf = [0u64; 256];
    let mut running = 0u64;
    for (value, count) in hist.iter().enumerate() {
        running += count;
        cdf[value] = running;
    }

    let cdf_min = match cdf.iter().copied().find(|&count| count > 0) {
        Some(count) => count,
        None => return image.clone(),
    };
    if cdf_min == total {
        // Single-valued image, nothing to stretch.
        return image.clone();
    }

    let denom = total - cdf_min;
    let mut lut = [0u8; 256];
    for value in 0..256 {
        if cdf[value] >= cdf_min {
            lut[value] = ((cdf[value] - cdf_min) * 255 / denom) as u8;
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        Luma([lut[image.get_pixel(x, y).0[0] as usize]])
    })
}

fn histogram(image: &GrayImage) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for pixel in image.pixels() {
        hist[pixel.0[0] as usize] += 1;
    }
    hist
}

/// Otsu's method: picks the threshold maximizing between-class variance.
fn otsu_threshold(hist: &[u64; 256]) -> u8 {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 127;
    }

    let sum_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(value, &count)| value as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0_f64;
    let mut weight_background = 0u64;
    let mut max_between = 0.0_f64;
    let mut threshold = 127u8;

    for value in 0..256usize {
        weight_background += hist[value];
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0 {
            break;
        }
        sum_background += value as f64 * hist[value] as f64;
        let mean_background = sum_background / weight_background as f64;
        let mean_foreground = (sum_total - sum_background) / weight_foreground as f64;
        let between = weight_background as f64
            * weight_foreground as f64
            * (mean_background - mean_foreground)
            * (mean_background - mean_foreground);
        if between > max_between {
            max_between = between;
            threshold = value as u8;
        }
    }

    threshold
}

fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y).0[0] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}
