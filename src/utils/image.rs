use std::path::Path;
use image::{DynamicImage, ImageReader};
use tracing::{debug, warn};
use crate::error::error::{FacemeshError, Result};

/// load_image reads and decodes an image file.
///
/// Unreadable files and undecodable data are both reported as invalid input,
/// since neither can be recovered from by the caller.
///
/// # Arguments
/// * `path` - image path
///
/// # Returns
/// * `DynamicImage`
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let reader = ImageReader::open(path)
        .map_err(|e| FacemeshError::InvalidInput(format!("could not read image {:?}: {}", path, e)))?
        .with_guessed_format()
        .map_err(|e| FacemeshError::InvalidInput(format!("could not read image {:?}: {}", path, e)))?;

    let img = reader
        .decode()
        .map_err(|e| FacemeshError::InvalidInput(format!("could not decode image {:?}: {}", path, e)))?;

    debug!("loaded image {:?} ({}x{}, {:?})", path, img.width(), img.height(), img.color());
    Ok(img)
}

/// has_alpha reports whether the image carries an alpha channel.
pub fn has_alpha(img: &DynamicImage) -> bool {
    img.color().has_alpha()
}

/// strip_alpha drops the alpha channel, returning an 8-bit RGB image.
pub fn strip_alpha(img: &DynamicImage) -> DynamicImage {
    DynamicImage::ImageRgb8(img.to_rgb8())
}

/// save_image writes an image, retrying once without the alpha channel when
/// the target encoder rejects it (JPEG has no alpha).
pub fn save_image(img: &DynamicImage, path: &Path) -> Result<()> {
    match img.save(path) {
        Ok(_) => Ok(()),
        Err(e) => {
            if !has_alpha(img) {
                return Err(FacemeshError::from(e))
            }
            warn!("saving {:?} failed ({}), retrying without alpha", path, e);
            strip_alpha(img).save(path)?;
            Ok(())
        }
    }
}
