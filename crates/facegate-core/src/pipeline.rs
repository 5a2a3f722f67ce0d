//! The recognition context: everything needed to turn a frame into an
//! identity decision, built once at startup by [`Pipeline::initialize`].

use crate::detector::{CascadeError, FaceLocalizer};
use crate::imgproc::BufferError;
use crate::labels::{self, LabelError, LabelMap, LabelStore};
use crate::layout::DataLayout;
use crate::lbph::LbphModel;
use crate::normalize;
use crate::recognizer::{RecognizerError, RecognizerModel};
use crate::samples::{SampleError, SampleStore};
use crate::threshold::{ThresholdCalibrator, ThresholdError};
use crate::types::{accepts, CancelToken, FaceRoi, FrameOutcome, Identity, PreparedFace, RecognitionResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("data directory: {0}")]
    Layout(#[source] std::io::Error),
    #[error(transparent)]
    Cascade(#[from] CascadeError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Labels(#[from] LabelError),
    #[error(transparent)]
    Samples(#[from] SampleError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error("failed to read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("label table and model disagree: unlabeled ids {unlabeled:?}, untrained names {untrained:?}")]
    LabelMismatch {
        /// Ids the model can predict that have no name.
        unlabeled: Vec<i32>,
        /// Names whose id the model has never seen.
        untrained: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub cascade_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::default_data_dir(),
            cascade_path: PathBuf::from(crate::DEFAULT_CASCADE_PATH),
        }
    }
}

pub struct Pipeline {
    layout: DataLayout,
    localizer: FaceLocalizer,
    recognizer: RecognizerModel,
    calibrator: ThresholdCalibrator,
    label_store: LabelStore,
    samples: SampleStore,
    threshold: RwLock<f64>,
    labels: RwLock<LabelMap>,
    // Serialises enrollment and retraining.
    writer: Mutex<()>,
}

impl Pipeline {
    /// Prepare the data layout, load the cascade, threshold and label table.
    ///
    /// The recognizer model itself is read lazily on first use.
    pub fn initialize(config: PipelineConfig) -> Result<Self, PipelineError> {
        let layout = DataLayout::new(&config.data_dir);
        layout.ensure().map_err(PipelineError::Layout)?;

        let localizer = FaceLocalizer::load(&config.cascade_path)?;
        let calibrator = ThresholdCalibrator::new(layout.metadata_path());
        let threshold = calibrator.load_threshold();
        let label_store = LabelStore::new(layout.labels_path());
        let labels = label_store.load()?;

        let pipeline = Self {
            recognizer: RecognizerModel::new(layout.model_path()),
            samples: SampleStore::new(layout.faces_dir()),
            localizer,
            calibrator,
            label_store,
            threshold: RwLock::new(threshold),
            labels: RwLock::new(labels),
            writer: Mutex::new(()),
            layout,
        };

        tracing::info!(
            data_dir = %pipeline.layout.data_dir().display(),
            threshold,
            identities = pipeline.labels().len(),
            trained = pipeline.recognizer.is_trained(),
            "recognition pipeline initialised"
        );
        Ok(pipeline)
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn localizer(&self) -> &FaceLocalizer {
        &self.localizer
    }

    pub fn is_trained(&self) -> bool {
        self.recognizer.is_trained()
    }

    /// Localise and normalise the largest face in an RGB24 frame.
    pub fn prepare(&self, rgb: &[u8], width: u32, height: u32) -> Result<Option<PreparedFace>, PipelineError> {
        Ok(normalize::prepare_face_roi(&self.localizer, rgb, width, height)?)
    }

    /// Full per-frame path: localise, normalise, classify.
    pub fn recognize_frame(&self, rgb: &[u8], width: u32, height: u32) -> Result<FrameOutcome, PipelineError> {
        let Some(prepared) = self.prepare(rgb, width, height)? else {
            tracing::debug!(width, height, "no face in frame");
            return Ok(FrameOutcome::NoFace);
        };
        let result = self.classify(&prepared.roi)?;
        Ok(FrameOutcome::Classified {
            face_box: prepared.face_box,
            result,
        })
    }

    /// [`Pipeline::recognize_frame`] on a still image file.
    pub fn recognize_image(&self, path: &Path) -> Result<FrameOutcome, PipelineError> {
        let img = image::open(path)?.to_rgb8();
        let (width, height) = img.dimensions();
        self.recognize_frame(img.as_raw(), width, height)
    }

    /// Predict and apply the acceptance gate.
    ///
    /// The raw distance is reported whether or not the match is accepted.
    pub fn classify(&self, roi: &FaceRoi) -> Result<RecognitionResult, PipelineError> {
        let prediction = self.recognizer.predict(roi)?;
        let threshold = self.threshold();
        let accepted = accepts(prediction.distance, threshold);

        let name = if accepted {
            let labels = self.labels.read().unwrap_or_else(PoisonError::into_inner);
            match labels::name_of(&labels, prediction.label) {
                Some(name) => Some(name.to_owned()),
                None => {
                    tracing::warn!(id = prediction.label, "model predicted an id with no label");
                    return Err(PipelineError::LabelMismatch {
                        unlabeled: vec![prediction.label],
                        untrained: Vec::new(),
                    });
                }
            }
        } else {
            None
        };

        tracing::debug!(
            nearest_id = prediction.label,
            distance = prediction.distance,
            threshold,
            accepted,
            "classified face"
        );

        Ok(RecognitionResult {
            nearest_id: prediction.label,
            distance: prediction.distance,
            threshold,
            accepted,
            name,
        })
    }

    /// Enroll `rois` under `name`, reusing its id if already known.
    ///
    /// The model is refitted over every stored sample of a labelled
    /// identity plus the new ones. Nothing is written if `cancel` fires
    /// before the fit completes. Writes go samples, labels, model; a
    /// failure at any step removes the new samples and restores the
    /// previous label table.
    pub fn enroll(&self, name: &str, rois: &[FaceRoi], cancel: &CancelToken) -> Result<Identity, PipelineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::EmptyName);
        }
        if rois.is_empty() {
            return Err(RecognizerError::InsufficientData.into());
        }

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.labels();
        let id = match labels::id_for(&previous, name) {
            Some(id) => id,
            None => labels::next_id(&previous, &self.reserved_ids()?),
        };

        let mut training = self.labeled_samples(&previous)?;
        training.extend(rois.iter().cloned().map(|roi| (roi, id)));
        let model = LbphModel::fit(&training, cancel)?;
        if cancel.is_cancelled() {
            return Err(RecognizerError::Cancelled.into());
        }

        let written = self.samples.save(id, rois)?;
        let mut labels = previous.clone();
        labels.insert(id.to_string(), name.to_owned());
        if let Err(e) = self.commit(&labels, &previous, model) {
            tracing::warn!(id, name, error = %e, "enrollment failed, rolling back samples");
            self.samples.remove(&written);
            return Err(e);
        }
        *self.labels.write().unwrap_or_else(PoisonError::into_inner) = labels;

        tracing::info!(id, name, new_samples = rois.len(), total_samples = training.len(), "identity enrolled");
        Ok(Identity {
            id,
            name: name.to_owned(),
        })
    }

    /// Save the label table, then install the model. If the model cannot be
    /// installed the previous table is written back.
    fn commit(&self, labels: &LabelMap, previous: &LabelMap, model: LbphModel) -> Result<(), PipelineError> {
        self.label_store.save(labels)?;
        if let Err(e) = self.recognizer.install(model) {
            if let Err(restore) = self.label_store.save(previous) {
                tracing::warn!(error = %restore, "failed to restore label table");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Ids that a new identity must not take: stored sample directories and
    /// ids the current model predicts, labelled or not.
    fn reserved_ids(&self) -> Result<BTreeSet<i32>, PipelineError> {
        let mut reserved: BTreeSet<i32> = self.samples.ids()?.into_iter().collect();
        match self.recognizer.labels() {
            Ok(ids) => reserved.extend(ids),
            Err(RecognizerError::NotTrained(_)) => {}
            Err(e) => tracing::warn!(error = %e, "model unreadable while allocating an id"),
        }
        Ok(reserved)
    }

    /// Stored samples whose id has a label. Orphans are skipped with a warning.
    fn labeled_samples(&self, labels: &LabelMap) -> Result<Vec<(FaceRoi, i32)>, PipelineError> {
        let known = labels::numeric_ids(labels);
        let mut samples = self.samples.load_all()?;
        let before = samples.len();
        samples.retain(|(_, id)| known.contains(id));
        if samples.len() != before {
            tracing::warn!(skipped = before - samples.len(), "ignoring stored samples with no label");
        }
        Ok(samples)
    }

    /// Rebuild the model from the stored samples of labelled identities.
    pub fn retrain(&self, cancel: &CancelToken) -> Result<Arc<LbphModel>, PipelineError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = self.labeled_samples(&self.labels())?;
        let model = self.recognizer.train(&samples, cancel)?;
        tracing::info!(samples = samples.len(), "model retrained from sample store");
        Ok(model)
    }

    pub fn threshold(&self) -> f64 {
        *self.threshold.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a new acceptance threshold and apply it to later classifications.
    pub fn set_threshold(&self, threshold: f64) -> Result<(), PipelineError> {
        self.calibrator.save_threshold(threshold)?;
        *self.threshold.write().unwrap_or_else(PoisonError::into_inner) = threshold;
        Ok(())
    }

    /// Snapshot of the label table.
    pub fn labels(&self) -> LabelMap {
        self.labels.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Enrolled identities in id order.
    pub fn identities(&self) -> Vec<Identity> {
        let labels = self.labels();
        let mut out: Vec<Identity> = labels
            .iter()
            .filter_map(|(id, name)| {
                Some(Identity {
                    id: id.parse().ok()?,
                    name: name.clone(),
                })
            })
            .collect();
        out.sort_by_key(|i| i.id);
        out
    }

    /// Verify that every id the model knows has a label and vice versa.
    pub fn check_consistency(&self) -> Result<(), PipelineError> {
        let model_ids = match self.recognizer.labels() {
            Ok(ids) => ids,
            Err(RecognizerError::NotTrained(_)) => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        let labels = self.labels();
        let label_ids = labels::numeric_ids(&labels);

        let unlabeled: Vec<i32> = model_ids.difference(&label_ids).copied().collect();
        let untrained: Vec<String> = label_ids
            .difference(&model_ids)
            .filter_map(|id| labels::name_of(&labels, *id).map(str::to_owned))
            .collect();

        if unlabeled.is_empty() && untrained.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::LabelMismatch { unlabeled, untrained })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::threshold::DEFAULT_THRESHOLD;

    struct Harness {
        dir: tempfile::TempDir,
        cascade: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cascade = fixtures::write_cascade(dir.path());
            Self { dir, cascade }
        }

        fn config(&self) -> PipelineConfig {
            PipelineConfig {
                data_dir: self.dir.path().join("data"),
                cascade_path: self.cascade.clone(),
            }
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::initialize(self.config()).unwrap()
        }
    }

    fn face_frame() -> (Vec<u8>, u32, u32) {
        let (w, h) = (320, 240);
        let mut rgb = fixtures::blank_rgb(w, h);
        fixtures::paint_face(&mut rgb, w, 100, 60, 120);
        (rgb, w, h)
    }

    #[test]
    fn test_initialize_creates_layout() {
        let h = Harness::new();
        let p = h.pipeline();
        assert!(p.layout().faces_dir().is_dir());
        assert!(p.layout().models_dir().is_dir());
        assert_eq!(p.threshold(), DEFAULT_THRESHOLD);
        assert!(p.labels().is_empty());
        assert!(!p.is_trained());
    }

    #[test]
    fn test_initialize_missing_cascade() {
        let h = Harness::new();
        let config = PipelineConfig {
            cascade_path: h.dir.path().join("missing.xml"),
            ..h.config()
        };
        let err = Pipeline::initialize(config).err().unwrap();
        assert!(matches!(err, PipelineError::Cascade(CascadeError::NotFound(_))), "got {err:?}");
    }

    #[test]
    fn test_initialize_rejects_malformed_labels() {
        let h = Harness::new();
        let data = h.config().data_dir;
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("labels.json"), "[not, a, map").unwrap();
        let err = Pipeline::initialize(h.config()).err().unwrap();
        assert!(matches!(err, PipelineError::Labels(LabelError::Malformed { .. })), "got {err:?}");
    }

    #[test]
    fn test_classify_before_enroll_is_not_trained() {
        let p = Harness::new().pipeline();
        let err = p.classify(&fixtures::noise_roi(1)).unwrap_err();
        assert!(matches!(err, PipelineError::Recognizer(RecognizerError::NotTrained(_))), "got {err:?}");
    }

    #[test]
    fn test_enrolled_face_accepted_unknown_rejected() {
        let h = Harness::new();
        let p = h.pipeline();
        let identity = p
            .enroll("alice", &[fixtures::noise_roi(1), fixtures::noise_roi(2)], &CancelToken::new())
            .unwrap();
        assert_eq!(identity, Identity { id: 1, name: "alice".into() });

        let hit = p.classify(&fixtures::noise_roi(2)).unwrap();
        assert!(hit.accepted);
        assert_eq!(hit.identity(), Some(identity));

        let miss = p.classify(&fixtures::gradient_roi()).unwrap();
        assert!(!miss.accepted);
        assert_eq!(miss.name, None);
        assert_eq!(miss.nearest_id, 1);
        assert!(miss.distance > miss.threshold, "distance {} threshold {}", miss.distance, miss.threshold);
    }

    #[test]
    fn test_recognize_frame_end_to_end() {
        let p = Harness::new().pipeline();
        let (rgb, w, h) = face_frame();
        let prepared = p.prepare(&rgb, w, h).unwrap().expect("face in frame");
        p.enroll("alice", &[prepared.roi], &CancelToken::new()).unwrap();

        match p.recognize_frame(&rgb, w, h).unwrap() {
            FrameOutcome::Classified { face_box, result } => {
                assert!(face_box.fits_within(w, h));
                assert!(result.accepted);
                assert_eq!(result.name.as_deref(), Some("alice"));
            }
            FrameOutcome::NoFace => panic!("expected a classified face"),
        }

        let blank = fixtures::blank_rgb(w, h);
        assert_eq!(p.recognize_frame(&blank, w, h).unwrap(), FrameOutcome::NoFace);
    }

    #[test]
    fn test_recognize_image_file() {
        let h = Harness::new();
        let p = h.pipeline();
        let (rgb, w, hgt) = face_frame();
        let path = h.dir.path().join("visitor.png");
        image::RgbImage::from_raw(w, hgt, rgb.clone()).unwrap().save(&path).unwrap();

        let prepared = p.prepare(&rgb, w, hgt).unwrap().unwrap();
        p.enroll("alice", &[prepared.roi], &CancelToken::new()).unwrap();
        let outcome = p.recognize_image(&path).unwrap();
        assert!(matches!(outcome, FrameOutcome::Classified { ref result, .. } if result.accepted));
    }

    #[test]
    fn test_enroll_reuses_ids() {
        let p = Harness::new().pipeline();
        let cancel = CancelToken::new();
        assert_eq!(p.enroll("alice", &[fixtures::noise_roi(1)], &cancel).unwrap().id, 1);
        assert_eq!(p.enroll("bob", &[fixtures::gradient_roi()], &cancel).unwrap().id, 2);
        assert_eq!(p.enroll(" alice ", &[fixtures::noise_roi(5)], &cancel).unwrap().id, 1);

        assert_eq!(p.identities().len(), 2);
        assert_eq!(p.classify(&fixtures::gradient_roi()).unwrap().name.as_deref(), Some("bob"));
        p.check_consistency().unwrap();
    }

    #[test]
    fn test_enroll_rejects_empty_input() {
        let p = Harness::new().pipeline();
        let cancel = CancelToken::new();
        assert!(matches!(p.enroll("  ", &[fixtures::noise_roi(1)], &cancel), Err(PipelineError::EmptyName)));
        assert!(matches!(
            p.enroll("alice", &[], &cancel),
            Err(PipelineError::Recognizer(RecognizerError::InsufficientData))
        ));
    }

    #[test]
    fn test_cancelled_enroll_writes_nothing() {
        let p = Harness::new().pipeline();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = p.enroll("alice", &[fixtures::noise_roi(1)], &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Recognizer(RecognizerError::Cancelled)), "got {err:?}");

        assert!(!p.layout().labels_path().exists());
        assert!(!p.layout().model_path().exists());
        assert!(!p.layout().faces_dir().join("1").exists());
        assert!(p.labels().is_empty());
    }

    #[test]
    fn test_failed_label_write_rolls_back_enrollment() {
        let p = Harness::new().pipeline();
        let cancel = CancelToken::new();
        // A directory squatting on labels.json makes the table write fail.
        std::fs::create_dir(p.layout().labels_path()).unwrap();
        std::fs::write(p.layout().labels_path().join("keep"), b"x").unwrap();

        let err = p.enroll("alice", &[fixtures::noise_roi(1)], &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Labels(_)), "got {err:?}");
        assert!(SampleStore::new(p.layout().faces_dir()).ids().unwrap().is_empty());
        assert!(!p.layout().model_path().exists());
        assert!(p.labels().is_empty());

        std::fs::remove_dir_all(p.layout().labels_path()).unwrap();
        let bob = p.enroll("bob", &[fixtures::gradient_roi()], &cancel).unwrap();
        let alice_face = p.classify(&fixtures::noise_roi(1)).unwrap();
        assert!(!alice_face.accepted, "alice matched {bob:?} at {}", alice_face.distance);
        assert_eq!(alice_face.name, None);
        p.check_consistency().unwrap();
    }

    #[test]
    fn test_orphaned_samples_never_reach_a_new_identity() {
        let p = Harness::new().pipeline();
        // Leftovers from an interrupted enrollment: samples with no label.
        SampleStore::new(p.layout().faces_dir())
            .save(1, &[fixtures::noise_roi(1)])
            .unwrap();

        let bob = p.enroll("bob", &[fixtures::gradient_roi()], &CancelToken::new()).unwrap();
        assert_eq!(bob.id, 2);

        let result = p.classify(&fixtures::noise_roi(1)).unwrap();
        assert_eq!(result.nearest_id, 2);
        assert!(!result.accepted, "orphan face accepted at {}", result.distance);
        p.check_consistency().unwrap();
    }

    #[test]
    fn test_similar_unenrolled_face_rejected_at_calibrated_threshold() {
        let p = Harness::new().pipeline();
        let alice = fixtures::noise_roi(1);
        p.enroll("alice", &[alice.clone()], &CancelToken::new()).unwrap();
        p.set_threshold(10.0).unwrap();

        // Same face with a small local change.
        let again = p.classify(&fixtures::blotted(&alice, 90, 90, 6)).unwrap();
        assert!(again.accepted, "distance {}", again.distance);
        assert_eq!(again.name.as_deref(), Some("alice"));

        // Same kind of texture, different person.
        let stranger = p.classify(&fixtures::noise_roi(2)).unwrap();
        assert!(!stranger.accepted, "distance {}", stranger.distance);
        assert_eq!(stranger.nearest_id, 1);
        assert_eq!(stranger.name, None);
        assert!(stranger.distance > again.distance);
    }

    #[test]
    fn test_state_survives_reinitialize() {
        let h = Harness::new();
        {
            let p = h.pipeline();
            p.enroll("alice", &[fixtures::noise_roi(1)], &CancelToken::new()).unwrap();
            p.set_threshold(25.0).unwrap();
        }

        let p = h.pipeline();
        assert_eq!(p.threshold(), 25.0);
        let result = p.classify(&fixtures::noise_roi(1)).unwrap();
        assert_eq!(result.name.as_deref(), Some("alice"));
        assert_eq!(result.threshold, 25.0);
    }

    #[test]
    fn test_threshold_gates_acceptance() {
        let p = Harness::new().pipeline();
        p.enroll("alice", &[fixtures::noise_roi(1)], &CancelToken::new()).unwrap();
        let distance = p.classify(&fixtures::gradient_roi()).unwrap().distance;

        p.set_threshold(distance).unwrap();
        assert!(p.classify(&fixtures::gradient_roi()).unwrap().accepted);
        p.set_threshold(distance - 1.0).unwrap();
        assert!(!p.classify(&fixtures::gradient_roi()).unwrap().accepted);
    }

    #[test]
    fn test_missing_label_is_surfaced() {
        let h = Harness::new();
        h.pipeline()
            .enroll("alice", &[fixtures::noise_roi(1)], &CancelToken::new())
            .unwrap();
        std::fs::write(h.config().data_dir.join("labels.json"), "{}").unwrap();

        let p = h.pipeline();
        let err = p.classify(&fixtures::noise_roi(1)).unwrap_err();
        assert!(
            matches!(err, PipelineError::LabelMismatch { ref unlabeled, .. } if unlabeled == &vec![1]),
            "got {err:?}"
        );
        assert!(matches!(p.check_consistency(), Err(PipelineError::LabelMismatch { .. })));
    }

    #[test]
    fn test_untrained_label_reported() {
        let h = Harness::new();
        let data = h.config().data_dir;
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("labels.json"), "{\"3\": \"carol\"}").unwrap();

        let p = h.pipeline();
        match p.check_consistency() {
            Err(PipelineError::LabelMismatch { unlabeled, untrained }) => {
                assert!(unlabeled.is_empty());
                assert_eq!(untrained, vec!["carol".to_string()]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_retrain_from_samples() {
        let h = Harness::new();
        let p = h.pipeline();
        let cancel = CancelToken::new();
        p.enroll("alice", &[fixtures::noise_roi(1)], &cancel).unwrap();
        p.enroll("bob", &[fixtures::gradient_roi()], &cancel).unwrap();

        std::fs::remove_file(p.layout().model_path()).unwrap();
        let model = p.retrain(&cancel).unwrap();
        assert_eq!(model.labels(), BTreeSet::from([1, 2]));
        assert!(p.layout().model_path().exists());
    }
}
