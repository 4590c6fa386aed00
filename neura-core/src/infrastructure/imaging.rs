// neura-core/src/infrastructure/imaging.rs

// Photocopy comparison for the verify stage: grayscale global SSIM between
// the rasterized reference page and the rendered HTML. The render is resized
// to the reference dimensions first, mirroring how the two pages are
// compared visually.

use crate::error::NeuraError;
use crate::infrastructure::error::InfrastructureError;
use image::imageops::FilterType;
use std::path::Path;

const C1: f64 = 6.5025; // (0.01 * 255)^2
const C2: f64 = 58.5225; // (0.03 * 255)^2

/// Global SSIM over the luma channel, in [0, 1].
pub fn compare_images(reference: &Path, rendered: &Path) -> Result<f64, NeuraError> {
    let ref_img = image::open(reference)
        .map_err(|e| InfrastructureError::Image(format!("{}: {e}", reference.display())))?
        .to_luma8();
    let test_img = image::open(rendered)
        .map_err(|e| InfrastructureError::Image(format!("{}: {e}", rendered.display())))?;
    let test_img = test_img
        .resize_exact(ref_img.width(), ref_img.height(), FilterType::Triangle)
        .to_luma8();

    let a: Vec<f64> = ref_img.pixels().map(|p| p.0[0] as f64).collect();
    let b: Vec<f64> = test_img.pixels().map(|p| p.0[0] as f64).collect();
    Ok(ssim(&a, &b))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn ssim(a: &[f64], b: &[f64]) -> f64 {
    let mu_a = mean(a);
    let mu_b = mean(b);
    let n = a.len().min(b.len()) as f64;
    if n == 0.0 {
        return 0.0;
    }

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        var_a += (x - mu_a) * (x - mu_a);
        var_b += (y - mu_b) * (y - mu_b);
        cov += (x - mu_a) * (y - mu_b);
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
        / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2))
}
