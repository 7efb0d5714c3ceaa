//! Payload decoding and result shaping helpers

use crate::models::{Fields, Payload};
use anyhow::{Context, Result};
use ndarray::Array3;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

/// Separator used when flattening nested prediction fields
pub const FLATTEN_SEPARATOR: &str = "__";

/// Decode an encoded image (PNG, JPEG) into a height x width x RGB array
pub fn decode_image(bytes: &[u8]) -> Result<Array3<u8>> {
    let decoded = image::load_from_memory(bytes).context("Failed to decode image")?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
        .context("Decoded image has an unexpected buffer length")
}

/// Decode a fetched object; `.json` keys become documents, everything else an image
pub fn decode_payload(key: &str, bytes: &[u8]) -> Result<Payload> {
    if key.to_ascii_lowercase().ends_with(".json") {
        let doc = serde_json::from_slice(bytes).context("Failed to parse JSON document")?;
        return Ok(Payload::Document(doc));
    }
    decode_image(bytes).map(Payload::Image)
}

/// Flatten nested objects and arrays into a single level
///
/// `{"mean": {"r": 0.5}, "boxes": [1, 2]}` becomes
/// `{"mean__r": 0.5, "boxes__0": 1, "boxes__1": 2}`.
pub fn flatten(fields: &Fields) -> Fields {
    let mut flat = Fields::new();
    for (key, value) in fields {
        flatten_into(&mut flat, key.clone(), value);
    }
    flat
}

fn flatten_into(out: &mut Fields, prefix: String, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                flatten_into(out, format!("{}{}{}", prefix, FLATTEN_SEPARATOR, key), nested);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(out, format!("{}{}{}", prefix, FLATTEN_SEPARATOR, index), nested);
            }
        }
        other => {
            out.insert(prefix, other.clone());
        }
    }
}

/// Round every non-integer number in `value` to `digits` decimal places
pub fn round_floats(value: &Value, digits: u32) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => {
            let factor = 10f64.powi(digits as i32);
            n.as_f64()
                .map(|f| (f * factor).round() / factor)
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| round_floats(v, digits)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), round_floats(v, digits)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Hex SHA-256 over the parts, unit-separated so ("ab","c") != ("a","bc")
pub fn stable_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\x1f");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Deterministic request id for a set of values (order independent)
pub fn derive_request_id<S: AsRef<str>>(values: &[S]) -> String {
    let mut sorted: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    let digest = stable_hash(&sorted);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, digest.as_bytes()).to_string()
}

/// Render a JSON value as a delimited-file cell
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn png(width: u32, height: u32, pixel: [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(pixel));
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, image::ImageOutputFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_decode_image_shape_is_height_width_channels() {
        let array = decode_image(&png(4, 2, [10, 20, 30])).unwrap();
        assert_eq!(array.shape(), &[2, 4, 3]);
        assert_eq!(array[[1, 3, 0]], 10);
        assert_eq!(array[[1, 3, 2]], 30);
    }

    #[test]
    fn test_decode_payload_dispatches_on_extension() {
        let doc = decode_payload("reports/r1.JSON", br#"{"a": 1}"#).unwrap();
        assert_eq!(doc, Payload::Document(json!({"a": 1})));

        assert!(decode_payload("broken.png", b"not an image").is_err());
        assert!(matches!(
            decode_payload("ok.png", &png(1, 1, [0, 0, 0])).unwrap(),
            Payload::Image(_)
        ));
    }

    #[test]
    fn test_flatten_nested_objects_and_arrays() {
        let flat = flatten(&fields(json!({
            "label": "cat",
            "mean": {"r": 0.5, "g": {"deep": 1}},
            "boxes": [10, 20],
            "empty": {}
        })));

        assert_eq!(flat["label"], "cat");
        assert_eq!(flat["mean__r"], 0.5);
        assert_eq!(flat["mean__g__deep"], 1);
        assert_eq!(flat["boxes__0"], 10);
        assert_eq!(flat["boxes__1"], 20);
        assert_eq!(flat["empty"], json!({}));
        assert_eq!(flat.len(), 6);
    }

    #[test]
    fn test_round_floats_leaves_integers_alone() {
        let rounded = round_floats(&json!({"p": 0.123456789, "n": 7, "xs": [1.00000049]}), 6);
        assert_eq!(rounded["p"], json!(0.123457));
        assert_eq!(rounded["n"], json!(7));
        assert_eq!(rounded["xs"][0], json!(1.0));
    }

    #[test]
    fn test_stable_hash_is_boundary_sensitive() {
        assert_eq!(stable_hash(&["a", "b"]), stable_hash(&["a", "b"]));
        assert_ne!(stable_hash(&["ab", "c"]), stable_hash(&["a", "bc"]));
        assert_eq!(stable_hash(&["x"]).len(), 64);
    }

    #[test]
    fn test_request_id_is_order_independent() {
        let a = derive_request_id(&["s3://b/1.png", "s3://b/2.png"]);
        let b = derive_request_id(&["s3://b/2.png", "s3://b/1.png"]);
        let c = derive_request_id(&["s3://b/3.png"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&Value::Null), "");
        assert_eq!(cell_text(&json!("text")), "text");
        assert_eq!(cell_text(&json!(1.5)), "1.5");
        assert_eq!(cell_text(&json!(true)), "true");
    }
}
