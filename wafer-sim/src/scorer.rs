//! Defect scoring
//!
//! [`DefectScorer`] is the seam to the classifier and the defect-area
//! measurement. Implementations are synchronous and may be CPU-bound, so
//! [`analyze`] runs them on the blocking pool and turns every failure
//! (error, invalid output, panic, missing scorer) into a sentinel value. A
//! single bad wafer never stops a run.

use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use wafer_common::{DefectClass, DefectMeasurement, Prediction};

use crate::image_source::{class_folder, ImagePool};

/// Error text recorded when no scorer could be built
pub const SCORER_UNAVAILABLE: &str = "Scorer not initialized";

/// Error text for a classification outside the valid range
pub const INVALID_PREDICTION: &str = "Invalid prediction result";

/// Error text for a measurement outside [0, 100]
pub const INVALID_DEFECT_COUNT: &str = "Invalid defect count result";

/// Scorer failures
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image not in reference set: {0}")]
    UnknownImage(PathBuf),

    #[error("Model error: {0}")]
    Model(String),
}

/// Classifier plus defect-area measurement for one wafer image
pub trait DefectScorer: Send + Sync {
    /// Defect class and confidence in [0, 1]
    fn classify(&self, image: &Path) -> Result<Prediction, ScoringError>;

    /// Share of the wafer area covered by defects, in percent
    fn measure_defect_area(&self, image: &Path) -> Result<f64, ScoringError>;
}

/// Scorer backed by the dataset's ground-truth labels
///
/// Images are recognised by SHA-256 of their content, so byte-identical
/// copies made by machines resolve to the class folder of the original.
/// Confidence and defect area are drawn from class-dependent ranges.
#[derive(Debug, Default)]
pub struct SimulatedScorer {
    labels: HashMap<Vec<u8>, DefectClass>,
}

impl SimulatedScorer {
    /// Index every image of the pool whose folder names a defect class
    pub fn from_pool(pool: &ImagePool) -> Self {
        let mut labels = HashMap::new();
        for image in pool.images() {
            let class = class_folder(image).and_then(|folder| folder.parse::<DefectClass>().ok());
            let Some(class) = class else {
                warn!(path = %image.display(), "Folder is not a defect class, image not indexed");
                continue;
            };
            match fingerprint(image) {
                Ok(digest) => {
                    labels.insert(digest, class);
                }
                Err(e) => warn!(error = %e, "Failed to index dataset image"),
            }
        }
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn label_of(&self, image: &Path) -> Result<DefectClass, ScoringError> {
        let digest = fingerprint(image)?;
        self.labels
            .get(&digest)
            .copied()
            .ok_or_else(|| ScoringError::UnknownImage(image.to_path_buf()))
    }
}

impl DefectScorer for SimulatedScorer {
    fn classify(&self, image: &Path) -> Result<Prediction, ScoringError> {
        let class = self.label_of(image)?;
        let confidence = rand::thread_rng().gen_range(0.70..0.99);
        Ok(Prediction::new(class, round_to(confidence, 4)))
    }

    fn measure_defect_area(&self, image: &Path) -> Result<f64, ScoringError> {
        let class = self.label_of(image)?;
        let (low, high) = defect_area_range(class);
        let percentage = rand::thread_rng().gen_range(low..high);
        Ok(round_to(percentage, 2))
    }
}

/// Plausible defect-area band per class, in percent
fn defect_area_range(class: DefectClass) -> (f64, f64) {
    match class {
        DefectClass::Normal => (0.0, 25.0),
        DefectClass::Local | DefectClass::Scratch | DefectClass::EdgeLoc => (10.0, 55.0),
        DefectClass::Center | DefectClass::Donut | DefectClass::EdgeRing | DefectClass::Random => {
            (30.0, 80.0)
        }
        DefectClass::NearFull => (70.0, 98.0),
    }
}

fn fingerprint(image: &Path) -> Result<Vec<u8>, ScoringError> {
    let bytes = std::fs::read(image).map_err(|source| ScoringError::Read {
        path: image.to_path_buf(),
        source,
    })?;
    Ok(Sha256::digest(&bytes).to_vec())
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Build the simulated scorer, or `None` (degraded mode) when the dataset
/// yields no labeled images
pub fn build_scorer(pool: &ImagePool) -> Option<Arc<dyn DefectScorer>> {
    let scorer = SimulatedScorer::from_pool(pool);
    if scorer.is_empty() {
        error!("No labeled images indexed, running without scorer");
        return None;
    }
    info!(images = scorer.len(), "Simulated scorer initialized");
    Some(Arc::new(scorer))
}

/// Score one wafer image, mapping every failure to a sentinel
pub async fn analyze(
    scorer: Option<&Arc<dyn DefectScorer>>,
    wafer_id: &str,
    image: &Path,
) -> (Prediction, DefectMeasurement) {
    let Some(scorer) = scorer else {
        return (
            Prediction::unknown(SCORER_UNAVAILABLE),
            DefectMeasurement::failed(SCORER_UNAVAILABLE),
        );
    };

    let prediction = classify(scorer.clone(), wafer_id, image.to_path_buf()).await;
    let measurement = measure(scorer.clone(), wafer_id, image.to_path_buf()).await;
    (prediction, measurement)
}

async fn classify(scorer: Arc<dyn DefectScorer>, wafer_id: &str, image: PathBuf) -> Prediction {
    match tokio::task::spawn_blocking(move || scorer.classify(&image)).await {
        Ok(Ok(prediction)) if is_valid_prediction(&prediction) => prediction,
        Ok(Ok(prediction)) => {
            warn!(
                wafer_id,
                defect_class = %prediction.defect_class,
                confidence = prediction.confidence,
                "Invalid prediction result"
            );
            Prediction::unknown(INVALID_PREDICTION)
        }
        Ok(Err(e)) => {
            error!(wafer_id, error = %e, "Defect classification failed");
            Prediction::failed(e.to_string())
        }
        Err(e) => {
            error!(wafer_id, error = %e, "Defect classification task failed");
            Prediction::failed(format!("Classification task failed: {}", e))
        }
    }
}

async fn measure(
    scorer: Arc<dyn DefectScorer>,
    wafer_id: &str,
    image: PathBuf,
) -> DefectMeasurement {
    match tokio::task::spawn_blocking(move || scorer.measure_defect_area(&image)).await {
        Ok(Ok(percentage)) if percentage.is_finite() && (0.0..=100.0).contains(&percentage) => {
            DefectMeasurement::measured(percentage)
        }
        Ok(Ok(percentage)) => {
            warn!(wafer_id, percentage, "Invalid defect count result");
            DefectMeasurement::failed(INVALID_DEFECT_COUNT)
        }
        Ok(Err(e)) => {
            error!(wafer_id, error = %e, "Defect area measurement failed");
            DefectMeasurement::failed(e.to_string())
        }
        Err(e) => {
            error!(wafer_id, error = %e, "Defect area measurement task failed");
            DefectMeasurement::failed(format!("Measurement task failed: {}", e))
        }
    }
}

fn is_valid_prediction(prediction: &Prediction) -> bool {
    !prediction.defect_class.trim().is_empty()
        && prediction.confidence.is_finite()
        && (0.0..=1.0).contains(&prediction.confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct FixedScorer {
        prediction: Prediction,
        percentage: f64,
    }

    impl DefectScorer for FixedScorer {
        fn classify(&self, _image: &Path) -> Result<Prediction, ScoringError> {
            Ok(self.prediction.clone())
        }

        fn measure_defect_area(&self, _image: &Path) -> Result<f64, ScoringError> {
            Ok(self.percentage)
        }
    }

    struct PanickingScorer;

    impl DefectScorer for PanickingScorer {
        fn classify(&self, _image: &Path) -> Result<Prediction, ScoringError> {
            panic!("model exploded");
        }

        fn measure_defect_area(&self, _image: &Path) -> Result<f64, ScoringError> {
            Err(ScoringError::Model("no mask".to_string()))
        }
    }

    fn dataset() -> (tempfile::TempDir, ImagePool) {
        let temp = tempfile::tempdir().unwrap();
        for (class, content) in [("Normal", "n1"), ("Near-Full", "nf1"), ("misc", "m1")] {
            let folder = temp.path().join(class);
            fs::create_dir_all(&folder).unwrap();
            fs::write(folder.join(format!("{}.jpg", content)), content).unwrap();
        }
        let pool = ImagePool::scan(temp.path()).unwrap();
        (temp, pool)
    }

    #[test]
    fn test_simulated_scorer_recognises_copies() {
        let (temp, pool) = dataset();
        let scorer = SimulatedScorer::from_pool(&pool);
        assert_eq!(scorer.len(), 2);

        let copy = temp.path().join("Thermal_copy.jpg");
        fs::copy(temp.path().join("Near-Full").join("nf1.jpg"), &copy).unwrap();

        let prediction = scorer.classify(&copy).unwrap();
        assert_eq!(prediction.defect_class, "Near-Full");
        assert!((0.70..=0.99).contains(&prediction.confidence));

        let pct = scorer.measure_defect_area(&copy).unwrap();
        assert!((70.0..=98.0).contains(&pct));

        let normal_pct = scorer
            .measure_defect_area(&temp.path().join("Normal").join("n1.jpg"))
            .unwrap();
        assert!(normal_pct <= 25.0);
    }

    #[test]
    fn test_unknown_image_rejected() {
        let (temp, pool) = dataset();
        let scorer = SimulatedScorer::from_pool(&pool);
        let stranger = temp.path().join("stranger.jpg");
        fs::write(&stranger, "never seen").unwrap();

        assert!(matches!(
            scorer.classify(&stranger),
            Err(ScoringError::UnknownImage(_))
        ));
        assert!(matches!(
            scorer.classify(&temp.path().join("missing.jpg")),
            Err(ScoringError::Read { .. })
        ));
    }

    #[test]
    fn test_build_scorer_degraded_when_empty() {
        assert!(build_scorer(&ImagePool::default()).is_none());
    }

    #[tokio::test]
    async fn test_analyze_without_scorer() {
        let (prediction, measurement) = analyze(None, "W1", Path::new("x.jpg")).await;
        assert_eq!(prediction.defect_class, "Unknown");
        assert_eq!(prediction.confidence, 0.0);
        assert_eq!(prediction.error.as_deref(), Some(SCORER_UNAVAILABLE));
        assert_eq!(measurement.defect_percentage, 0.0);
        assert_eq!(measurement.error.as_deref(), Some(SCORER_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_analyze_rejects_invalid_output() {
        let scorer: Arc<dyn DefectScorer> = Arc::new(FixedScorer {
            prediction: Prediction {
                defect_class: "Donut".to_string(),
                confidence: 1.5,
                error: None,
            },
            percentage: f64::NAN,
        });

        let (prediction, measurement) = analyze(Some(&scorer), "W1", Path::new("x.jpg")).await;
        assert_eq!(prediction.defect_class, "Unknown");
        assert_eq!(prediction.error.as_deref(), Some(INVALID_PREDICTION));
        assert_eq!(measurement.defect_percentage, 0.0);
        assert_eq!(measurement.error.as_deref(), Some(INVALID_DEFECT_COUNT));
    }

    #[tokio::test]
    async fn test_analyze_survives_panic() {
        let scorer: Arc<dyn DefectScorer> = Arc::new(PanickingScorer);

        let (prediction, measurement) = analyze(Some(&scorer), "W1", Path::new("x.jpg")).await;
        assert_eq!(prediction.defect_class, "Error");
        assert_eq!(prediction.confidence, 0.0);
        assert!(prediction.error.is_some());
        assert_eq!(measurement.defect_percentage, 0.0);
        assert_eq!(measurement.error.as_deref(), Some("Model error: no mask"));
    }
}
