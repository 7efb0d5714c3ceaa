//! Built-in demonstration predictor

use super::Predictor;
use crate::models::{Fields, Payload, RecordMeta};
use anyhow::{bail, Context, Result};
use ndarray::{Axis, Ix3};
use serde_json::{json, Value};

/// Threshold on mean brightness separating `bright` from `dark`
const BRIGHTNESS_THRESHOLD: f64 = 0.5;

/// Per-channel image statistics
///
/// preprocess scales pixels to [0, 1], predict reports shape and channel
/// means, postprocess adds a `bright` / `dark` label.
#[derive(Debug, Default)]
pub struct ImageStatsPredictor;

impl ImageStatsPredictor {
    pub const NAME: &'static str = "image-stats";

    pub fn new() -> Self {
        Self
    }
}

impl Predictor for ImageStatsPredictor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn preprocess(&self, payload: Payload, _meta: &RecordMeta) -> Result<Payload> {
        match payload {
            Payload::Image(pixels) => Ok(Payload::Tensor(
                pixels.mapv(|v| f32::from(v) / 255.0).into_dyn(),
            )),
            tensor @ Payload::Tensor(_) => Ok(tensor),
            Payload::Document(_) => bail!("image-stats expects an image payload, got a document"),
        }
    }

    fn predict(&self, input: &Payload, _meta: &RecordMeta) -> Result<Fields> {
        let tensor = match input {
            Payload::Tensor(t) => t.view(),
            other => bail!("image-stats expects a tensor, got {}", other.kind()),
        };
        let image = tensor
            .into_dimensionality::<Ix3>()
            .context("expected a height x width x channel tensor")?;
        let (height, width, channels) = image.dim();
        if height == 0 || width == 0 || channels == 0 {
            bail!("empty image");
        }

        let mut means = Vec::with_capacity(channels);
        for channel in image.axis_iter(Axis(2)) {
            means.push(f64::from(channel.mean().unwrap_or(0.0)));
        }
        let brightness = means.iter().sum::<f64>() / means.len() as f64;

        let mut mean = Fields::new();
        for (name, value) in ["r", "g", "b"].iter().zip(&means) {
            mean.insert(name.to_string(), json!(value));
        }

        let mut fields = Fields::new();
        fields.insert("height".into(), json!(height));
        fields.insert("width".into(), json!(width));
        fields.insert("channels".into(), json!(channels));
        fields.insert("mean".into(), Value::Object(mean));
        fields.insert("brightness".into(), json!(brightness));
        Ok(fields)
    }

    fn postprocess(&self, mut prediction: Fields) -> Result<Fields> {
        let brightness = prediction
            .get("brightness")
            .and_then(Value::as_f64)
            .context("prediction has no brightness")?;
        let label = if brightness >= BRIGHTNESS_THRESHOLD {
            "bright"
        } else {
            "dark"
        };
        prediction.insert("label".into(), json!(label));
        Ok(prediction)
    }
}
