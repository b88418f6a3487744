use image::{DynamicImage, GrayImage, RgbImage};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Whether the box is at least `min_width` × `min_height` pixels.
    pub fn meets_min_size(&self, (min_width, min_height): (u32, u32)) -> bool {
        self.width >= min_width as f32 && self.height >= min_height as f32
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A decoded photo handed to detection, emotion and verification backends.
#[derive(Debug, Clone)]
pub struct FaceImage {
    pixels: RgbImage,
}

impl FaceImage {
    /// Decode an encoded image (JPEG, PNG, ...) from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, image::ImageError> {
        Ok(image::load_from_memory(bytes)?.into())
    }

    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.pixels
    }

    /// Crop the region covered by `face`, clamped to the image bounds.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn crop(&self, face: &BoundingBox) -> Option<RgbImage> {
        let (width, height) = self.pixels.dimensions();
        let x0 = face.x.max(0.0).floor() as u32;
        let y0 = face.y.max(0.0).floor() as u32;
        let x1 = ((face.x + face.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((face.y + face.height).ceil().max(0.0) as u32).min(height);

        if x0 >= x1 || y0 >= y1 {
            return None;
        }

        Some(image::imageops::crop_imm(&self.pixels, x0, y0, x1 - x0, y1 - y0).to_image())
    }

    /// Grayscale crop of `face`, as consumed by expression classifiers.
    pub fn crop_luma(&self, face: &BoundingBox) -> Option<GrayImage> {
        self.crop(face).map(|rgb| image::imageops::grayscale(&rgb))
    }
}

impl From<DynamicImage> for FaceImage {
    fn from(image: DynamicImage) -> Self {
        Self {
            pixels: image.to_rgb8(),
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Zero-length vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self
            .values
            .iter()
            .zip(other.values.iter())
            .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (a, b)| {
                (dot + a * b, na + a * a, nb + b * b)
            });

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// The fixed emotion label set. Declaration order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Non-negative score per emotion label.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmotionVector {
    scores: [f32; 7],
}

impl EmotionVector {
    /// Build a vector from `(label, score)` pairs; unlisted labels score 0.
    pub fn from_scores(pairs: impl IntoIterator<Item = (Emotion, f32)>) -> Self {
        let mut vector = Self::default();
        for (emotion, score) in pairs {
            vector.set(emotion, score);
        }
        vector
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.scores[emotion.index()]
    }

    /// Negative and NaN scores are stored as 0.
    pub fn set(&mut self, emotion: Emotion, score: f32) {
        self.scores[emotion.index()] = score.max(0.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.iter().map(move |&e| (e, self.get(e)))
    }

    /// Arg-max label and its score. Ties go to the label declared first.
    pub fn dominant(&self) -> (Emotion, f32) {
        let mut best = (Emotion::ALL[0], self.scores[0]);
        for (emotion, score) in self.iter().skip(1) {
            if score > best.1 {
                best = (emotion, score);
            }
        }
        best
    }

    /// Non-dominant labels scoring at least `threshold`, in label order.
    pub fn secondary(&self, threshold: f32) -> Vec<Emotion> {
        let (dominant, _) = self.dominant();
        self.iter()
            .filter(|&(emotion, score)| emotion != dominant && score >= threshold)
            .map(|(emotion, _)| emotion)
            .collect()
    }

    /// Per-label arithmetic mean. `None` for an empty slice.
    pub fn mean(vectors: &[EmotionVector]) -> Option<EmotionVector> {
        if vectors.is_empty() {
            return None;
        }
        let count = vectors.len() as f32;
        let mut mean = EmotionVector::default();
        for emotion in Emotion::ALL {
            let total: f32 = vectors.iter().map(|v| v.get(emotion)).sum();
            mean.set(emotion, total / count);
        }
        Some(mean)
    }
}

impl Serialize for EmotionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Emotion::ALL.len()))?;
        for (emotion, score) in self.iter() {
            map.serialize_entry(emotion.label(), &score)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_meets_min_size() {
        assert!(bbox(0.0, 0.0, 120.0, 100.0).meets_min_size((100, 100)));
        assert!(!bbox(0.0, 0.0, 120.0, 99.0).meets_min_size((100, 100)));
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let image = FaceImage::from_rgb(RgbImage::new(50, 40));
        let crop = image.crop(&bbox(-10.0, 30.0, 30.0, 30.0)).unwrap();
        assert_eq!(crop.dimensions(), (20, 10));
    }

    #[test]
    fn test_crop_outside_is_none() {
        let image = FaceImage::from_rgb(RgbImage::new(50, 40));
        assert!(image.crop(&bbox(60.0, 0.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn test_similarity_identical_and_orthogonal() {
        let a = Embedding { values: vec![1.0, 0.0], model_version: None };
        let b = Embedding { values: vec![0.0, 1.0], model_version: None };
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![1.0, 0.0], model_version: None };
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_dominant_tie_prefers_earlier_label() {
        let v = EmotionVector::from_scores([(Emotion::Neutral, 0.5), (Emotion::Happy, 0.5)]);
        assert_eq!(v.dominant(), (Emotion::Happy, 0.5));
    }

    #[test]
    fn test_dominant_all_zero_is_angry() {
        assert_eq!(EmotionVector::default().dominant().0, Emotion::Angry);
    }

    #[test]
    fn test_secondary_excludes_dominant() {
        let v = EmotionVector::from_scores([
            (Emotion::Happy, 0.5),
            (Emotion::Surprise, 0.3),
            (Emotion::Neutral, 0.2),
        ]);
        assert_eq!(v.secondary(0.25), vec![Emotion::Surprise]);
    }

    #[test]
    fn test_set_clamps_negative_and_nan() {
        let mut v = EmotionVector::default();
        v.set(Emotion::Sad, -0.4);
        v.set(Emotion::Fear, f32::NAN);
        assert_eq!(v.get(Emotion::Sad), 0.0);
        assert_eq!(v.get(Emotion::Fear), 0.0);
    }

    #[test]
    fn test_mean_of_empty_is_none() {
        assert!(EmotionVector::mean(&[]).is_none());
    }

    #[test]
    fn test_serializes_as_label_map() {
        let v = EmotionVector::from_scores([(Emotion::Happy, 0.75)]);
        let json = serde_json::to_value(v).unwrap();
        assert_eq!(json["happy"], 0.75);
        assert_eq!(json["angry"], 0.0);
        assert_eq!(json.as_object().unwrap().len(), 7);
    }
}
