//! Upload validation

use super::error::ApiError;

/// Accepted file name suffixes, compared case-insensitively
pub const ALLOWED_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".jpeg", ".webp"];

/// Whether a file name ends with one of the accepted suffixes
#[must_use]
pub fn allowed_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    ALLOWED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Check the file name of the `image` field
///
/// `None` means no file field was sent at all.
///
/// # Errors
/// - [`ApiError::NoFileUploaded`] without a file field
/// - [`ApiError::NoSelectedFile`] for an empty file name
/// - [`ApiError::InvalidFileType`] for any other suffix
pub fn validate_file_name(file_name: Option<&str>) -> Result<&str, ApiError> {
    match file_name {
        None => Err(ApiError::NoFileUploaded),
        Some("") => Err(ApiError::NoSelectedFile),
        Some(name) if allowed_file(name) => Ok(name),
        Some(_) => Err(ApiError::InvalidFileType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_file() {
        for name in ["a.png", "b.JPG", "c.jpeg", "d.WebP", "archive.tar.png", ".png"] {
            assert!(allowed_file(name), "{name} should be accepted");
        }
        for name in ["a.gif", "b.png.exe", "jpg", "photo", "x.jpe", "x.tiff"] {
            assert!(!allowed_file(name), "{name} should be rejected");
        }
    }

    #[test]
    fn test_validate_file_name() {
        assert!(matches!(validate_file_name(None), Err(ApiError::NoFileUploaded)));
        assert!(matches!(validate_file_name(Some("")), Err(ApiError::NoSelectedFile)));
        assert!(matches!(
            validate_file_name(Some("notes.txt")),
            Err(ApiError::InvalidFileType)
        ));
        assert_eq!(validate_file_name(Some("x.jpg")).unwrap(), "x.jpg");
    }
}
