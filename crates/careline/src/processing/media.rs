use std::io::Cursor;

use image::ImageReader;

/// What could be learned about an image without decoding its pixels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
}

/// Best effort: unreadable images produce an empty `ImageInfo`.
pub fn inspect_image(bytes: &[u8]) -> ImageInfo {
    let reader = match ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "Could not guess image format");
            return ImageInfo::default();
        }
    };
    let format = reader
        .format()
        .map(|f| format!("{:?}", f).to_lowercase());
    match reader.into_dimensions() {
        Ok((width, height)) => ImageInfo {
            width: Some(width),
            height: Some(height),
            format,
        },
        Err(e) => {
            tracing::debug!(error = %e, "Could not read image dimensions");
            ImageInfo {
                format,
                ..ImageInfo::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_png_dimensions() {
        let img = image::RgbImage::new(3, 2);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let info = inspect_image(buf.get_ref());
        assert_eq!(info.width, Some(3));
        assert_eq!(info.height, Some(2));
        assert_eq!(info.format.as_deref(), Some("png"));
    }

    #[test]
    fn garbage_is_tolerated() {
        assert_eq!(inspect_image(b"not an image"), ImageInfo::default());
    }
}
