//! Request validation ahead of any pool wait or process start

use crate::error::{EncoderError, Result};
use crate::image::ImageRequest;
use crate::interval::IntervalRequest;
use crate::probe::MediaInfoRequest;

/// At least one input, none of them blank
pub fn validate_inputs(inputs: &[String]) -> Result<()> {
    if inputs.is_empty() {
        return Err(EncoderError::InvalidArgument("no input files".to_string()));
    }

    if inputs.iter().any(|input| input.trim().is_empty()) {
        return Err(EncoderError::InvalidArgument(
            "input path must not be empty".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_media_info_request(request: &MediaInfoRequest) -> Result<()> {
    if request.input.path.trim().is_empty() {
        return Err(EncoderError::InvalidArgument(
            "media path must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_image_request(request: &ImageRequest) -> Result<()> {
    validate_inputs(&request.inputs)
}

pub fn validate_interval_request(request: &IntervalRequest) -> Result<()> {
    validate_inputs(&request.inputs)?;

    if request.interval.is_zero() {
        return Err(EncoderError::InvalidArgument(
            "interval must be greater than zero".to_string(),
        ));
    }

    if request.output_dir.as_os_str().is_empty() {
        return Err(EncoderError::InvalidArgument(
            "output directory must not be empty".to_string(),
        ));
    }

    if request.filename_prefix.contains(['/', '\\']) {
        return Err(EncoderError::InvalidArgument(format!(
            "filename prefix must not contain a path separator: {}",
            request.filename_prefix
        )));
    }

    if request.max_width == Some(0) {
        return Err(EncoderError::InvalidArgument(
            "max width must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{InputDescriptor, MediaProtocol};
    use std::time::Duration;

    fn interval_request() -> IntervalRequest {
        IntervalRequest::new(
            vec!["/media/movie.mkv".to_string()],
            "/cache/out",
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_validate_inputs() {
        assert!(validate_inputs(&["/media/a.mkv".to_string()]).is_ok());
        assert!(validate_inputs(&[]).unwrap_err().is_invalid_argument());
        assert!(validate_inputs(&["  ".to_string()]).is_err());
    }

    #[test]
    fn test_validate_interval_request() {
        assert!(validate_interval_request(&interval_request()).is_ok());

        let mut zero = interval_request();
        zero.interval = Duration::ZERO;
        assert!(validate_interval_request(&zero).is_err());

        let mut no_dir = interval_request();
        no_dir.output_dir = Default::default();
        assert!(validate_interval_request(&no_dir).is_err());

        let mut bad_prefix = interval_request();
        bad_prefix.filename_prefix = "../img_".to_string();
        assert!(validate_interval_request(&bad_prefix).is_err());

        let mut no_width = interval_request();
        no_width.max_width = Some(0);
        assert!(validate_interval_request(&no_width).is_err());
    }

    #[test]
    fn test_validate_media_info_request() {
        let ok = MediaInfoRequest::video(InputDescriptor::file("/media/a.mkv"));
        assert!(validate_media_info_request(&ok).is_ok());

        let blank = MediaInfoRequest::audio(InputDescriptor::remote("", MediaProtocol::Http));
        assert!(validate_media_info_request(&blank).is_err());
    }

    #[test]
    fn test_validate_image_request() {
        let request = ImageRequest::audio("/music/track.flac");
        assert!(validate_image_request(&request).is_ok());
    }
}
