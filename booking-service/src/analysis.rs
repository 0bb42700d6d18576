//! Server-side photo analysis: decode the image, check it is usable and
//! derive issue hints from the file name or caption.

use async_trait::async_trait;
use image::GenericImageView;
use repair_flow::{AnalysisResult, FlowError, PhotoFile, ProblemClassifier, upload::PhotoAnalyzer};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Shorter side below which details such as hairline cracks get lost.
const MIN_USEFUL_SIDE: u32 = 640;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("photo could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("photo is empty")]
    Empty,
}

#[derive(Clone)]
pub struct PhotoAnalysisEngine {
    classifier: Arc<ProblemClassifier>,
}

impl PhotoAnalysisEngine {
    pub fn new(classifier: Arc<ProblemClassifier>) -> Self {
        Self { classifier }
    }

    pub fn analyze_bytes(&self, file_name: &str, bytes: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        if bytes.is_empty() {
            return Err(AnalysisError::Empty);
        }
        let image = image::load_from_memory(bytes)?;
        let (width, height) = image.dimensions();

        let hint = file_name_hint(file_name);
        let detected_issues = self.classifier.suggest(&hint);

        let mut notes = Vec::new();
        let mut confidence: f32 = if detected_issues.is_empty() { 0.2 } else { 0.6 };
        if width.min(height) < MIN_USEFUL_SIDE {
            notes.push(format!(
                "low resolution ({}x{}), a closer photo would help the technician",
                width, height
            ));
            confidence -= 0.1;
        }
        if detected_issues.is_empty() {
            notes.push("no issue could be identified from the photo alone".to_string());
        }

        debug!(file = %file_name, width, height, issues = detected_issues.len(), "photo analyzed");
        Ok(AnalysisResult {
            detected_issues,
            confidence: confidence.max(0.1),
            width: Some(width),
            height: Some(height),
            notes,
        })
    }
}

/// In-process analysis for uploads that cannot go over the channel.
#[async_trait]
impl PhotoAnalyzer for PhotoAnalysisEngine {
    async fn analyze(&self, file: &PhotoFile) -> repair_flow::Result<AnalysisResult> {
        self.analyze_bytes(&file.name, &file.data)
            .map_err(|e| FlowError::Validation(e.to_string()))
    }
}

/// `cracked_screen-01.jpg` -> `cracked screen 01`
fn file_name_hint(file_name: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    stem.replace(['_', '-'], " ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use repair_flow::RepairCategory;
    use std::io::Cursor;

    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn engine() -> PhotoAnalysisEngine {
        PhotoAnalysisEngine::new(Arc::new(ProblemClassifier::new().unwrap()))
    }

    #[test]
    fn reads_dimensions_and_hints() {
        let result = engine()
            .analyze_bytes("cracked_screen-01.png", &png(1024, 768))
            .unwrap();
        assert_eq!(result.width, Some(1024));
        assert_eq!(result.detected_issues, vec![RepairCategory::ScreenRepair]);
        assert!(result.notes.is_empty());
    }

    #[test]
    fn flags_low_resolution() {
        let result = engine().analyze_bytes("IMG_0001.png", &png(320, 240)).unwrap();
        assert!(result.notes[0].contains("low resolution"));
        assert!(result.detected_issues.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            engine().analyze_bytes("x.jpg", b"not an image"),
            Err(AnalysisError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn serves_as_upload_fallback() {
        let analyzer: Arc<dyn PhotoAnalyzer> = Arc::new(engine());
        let result = analyzer
            .analyze(&PhotoFile {
                name: "battery_swelling.png".to_string(),
                content_type: "image/png".to_string(),
                data: png(800, 600),
            })
            .await
            .unwrap();
        assert_eq!(result.height, Some(600));

        let err = analyzer
            .analyze(&PhotoFile {
                name: "broken.png".to_string(),
                content_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)));
    }

    #[test]
    fn hint_strips_extension() {
        assert_eq!(file_name_hint("water_damage.jpeg"), "water damage");
        assert_eq!(file_name_hint("noext"), "noext");
    }
}
