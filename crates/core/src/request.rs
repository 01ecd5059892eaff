//! Typed request payloads for each task kind
//!
//! Task input is stored as JSON. Processors turn it back into one of these
//! types with [`ImageRequest::parse`], which also validates it. A payload
//! that fails here can never succeed, so callers treat [`RequestError`] as a
//! non-retryable failure.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::kind::TaskKind;

const CM_PER_INCH: f64 = 2.54;

/// Error produced while decoding or validating a request payload
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// Payload does not match the expected shape
    #[error("malformed {kind} request: {message}")]
    Malformed { kind: TaskKind, message: String },

    /// Payload decoded but a field has an unacceptable value
    #[error("invalid field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl RequestError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Unit of a dimension value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    Cm,
    Inch,
}

/// One measured dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub value: f64,
    #[serde(default)]
    pub unit: Unit,
}

impl Dimension {
    /// Centimetre value
    pub fn cm(value: f64) -> Self {
        Self {
            value,
            unit: Unit::Cm,
        }
    }

    /// Value expressed in inches, rounded to two decimals for centimetre input
    pub fn inches(&self) -> f64 {
        match self.unit {
            Unit::Cm => (self.value / CM_PER_INCH * 100.0).round() / 100.0,
            Unit::Inch => self.value,
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), RequestError> {
        if !self.value.is_finite() || self.value <= 0.0 {
            return Err(RequestError::invalid(
                field,
                format!("must be a positive number, got {}", self.value),
            ));
        }
        Ok(())
    }
}

/// Length and height, with optional width
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSet {
    pub length: Dimension,
    pub height: Dimension,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<Dimension>,
}

impl DimensionSet {
    /// Validate every present dimension
    pub fn validate(&self) -> Result<(), RequestError> {
        self.length.validate("dimensions.length")?;
        self.height.validate("dimensions.height")?;
        if let Some(width) = &self.width {
            width.validate("dimensions.width")?;
        }
        Ok(())
    }

    /// Shape handed to the dimension renderer: each dimension with its
    /// original value/unit plus the inch conversion
    pub fn to_processor_format(&self) -> Value {
        let mut out = serde_json::Map::new();
        let entries = [
            ("length", Some(&self.length)),
            ("height", Some(&self.height)),
            ("width", self.width.as_ref()),
        ];
        for (name, dim) in entries {
            if let Some(dim) = dim {
                out.insert(
                    name.to_string(),
                    json!({ "value": dim.value, "unit": dim.unit, "inch": dim.inches() }),
                );
            }
        }
        Value::Object(out)
    }
}

/// Annotate a product photo with its dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionRequest {
    pub image_url: String,
    pub dimensions: DimensionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

/// Flat form: `{ image_url, length, height, width? }` in centimetres
#[derive(Debug, Clone, Deserialize)]
struct FlatDimensionRequest {
    image_url: String,
    length: f64,
    height: f64,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    task_name: Option<String>,
}

impl From<FlatDimensionRequest> for DimensionRequest {
    fn from(flat: FlatDimensionRequest) -> Self {
        Self {
            image_url: flat.image_url,
            dimensions: DimensionSet {
                length: Dimension::cm(flat.length),
                height: Dimension::cm(flat.height),
                width: flat.width.map(Dimension::cm),
            },
            task_name: flat.task_name,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DimensionPayload {
    Nested(DimensionRequest),
    Flat(FlatDimensionRequest),
}

/// Render the product-info card for a product photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInfoRequest {
    pub image_url: String,
    pub title: String,
    pub pcs: u32,
    pub height_cm: f64,
    pub length_cm: f64,
}

/// Build carousel assets from a zip of product media
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarouselRequest {
    pub zip_url: String,
    pub dimensions_text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_pcs")]
    pub pcs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

fn default_pcs() -> u32 {
    1
}

/// Render a compliance label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceLabelRequest {
    pub batch_code: String,
    pub barcode_url: String,
    /// Set for the building-bricks label variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A decoded, validated request for any task kind
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRequest {
    ProductInfo(ProductInfoRequest),
    Dimension(DimensionRequest),
    Carousel(CarouselRequest),
    ComplianceLabel(ComplianceLabelRequest),
}

impl ImageRequest {
    /// Decode `input` as the request type for `kind` and validate it
    pub fn parse(kind: TaskKind, input: &Value) -> Result<Self, RequestError> {
        let malformed = |e: serde_json::Error| RequestError::Malformed {
            kind,
            message: e.to_string(),
        };

        let request = match kind {
            TaskKind::ProductInfo => {
                Self::ProductInfo(serde_json::from_value(input.clone()).map_err(malformed)?)
            }
            TaskKind::Dimension => {
                let payload: DimensionPayload =
                    serde_json::from_value(input.clone()).map_err(malformed)?;
                Self::Dimension(match payload {
                    DimensionPayload::Nested(r) => r,
                    DimensionPayload::Flat(f) => f.into(),
                })
            }
            TaskKind::Carousel => {
                Self::Carousel(serde_json::from_value(input.clone()).map_err(malformed)?)
            }
            TaskKind::ComplianceLabel => {
                Self::ComplianceLabel(serde_json::from_value(input.clone()).map_err(malformed)?)
            }
        };

        request.validate()?;
        Ok(request)
    }

    /// Kind this request belongs to
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::ProductInfo(_) => TaskKind::ProductInfo,
            Self::Dimension(_) => TaskKind::Dimension,
            Self::Carousel(_) => TaskKind::Carousel,
            Self::ComplianceLabel(_) => TaskKind::ComplianceLabel,
        }
    }

    /// URL of the source object the renderer needs
    pub fn source_url(&self) -> &str {
        match self {
            Self::ProductInfo(r) => &r.image_url,
            Self::Dimension(r) => &r.image_url,
            Self::Carousel(r) => &r.zip_url,
            Self::ComplianceLabel(r) => &r.barcode_url,
        }
    }

    /// Parameters passed to the renderer alongside the source bytes
    pub fn render_params(&self) -> Value {
        match self {
            Self::ProductInfo(r) => json!({
                "title": r.title,
                "pcs": r.pcs,
                "height_cm": r.height_cm,
                "length_cm": r.length_cm,
            }),
            Self::Dimension(r) => json!({ "dimensions": r.dimensions.to_processor_format() }),
            Self::Carousel(r) => json!({
                "dimensions_text": r.dimensions_text,
                "title": r.title,
                "pcs": r.pcs,
            }),
            Self::ComplianceLabel(r) => json!({
                "batch_code": r.batch_code,
                "model": r.model,
            }),
        }
    }

    fn validate(&self) -> Result<(), RequestError> {
        match self {
            Self::ProductInfo(r) => {
                validate_url("image_url", &r.image_url)?;
                require_non_empty("title", &r.title)?;
                if r.pcs == 0 {
                    return Err(RequestError::invalid("pcs", "must be at least 1"));
                }
                Dimension::cm(r.height_cm).validate("height_cm")?;
                Dimension::cm(r.length_cm).validate("length_cm")
            }
            Self::Dimension(r) => {
                validate_url("image_url", &r.image_url)?;
                r.dimensions.validate()
            }
            Self::Carousel(r) => {
                validate_url("zip_url", &r.zip_url)?;
                require_non_empty("dimensions_text", &r.dimensions_text)?;
                if r.pcs == 0 {
                    return Err(RequestError::invalid("pcs", "must be at least 1"));
                }
                Ok(())
            }
            Self::ComplianceLabel(r) => {
                require_non_empty("batch_code", &r.batch_code)?;
                validate_url("barcode_url", &r.barcode_url)
            }
        }
    }
}

fn validate_url(field: &'static str, url: &str) -> Result<(), RequestError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(RequestError::invalid(
            field,
            format!("expected an http(s) URL, got {url:?}"),
        )),
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), RequestError> {
    if value.trim().is_empty() {
        return Err(RequestError::invalid(field, "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_dimension_payload() {
        let input = json!({
            "image_url": "https://cdn.example.com/p/1.png",
            "length": 10.5,
            "height": 15.2
        });

        let request = ImageRequest::parse(TaskKind::Dimension, &input).unwrap();
        let ImageRequest::Dimension(r) = &request else {
            panic!("expected dimension request");
        };
        assert_eq!(r.dimensions.length, Dimension::cm(10.5));
        assert_eq!(r.dimensions.height, Dimension::cm(15.2));
        assert!(r.dimensions.width.is_none());
        assert_eq!(request.source_url(), "https://cdn.example.com/p/1.png");
    }

    #[test]
    fn test_nested_dimension_payload_with_units() {
        let input = json!({
            "image_url": "https://cdn.example.com/p/1.png",
            "dimensions": {
                "length": {"value": 4.0, "unit": "inch"},
                "height": {"value": 25.4}
            }
        });

        let request = ImageRequest::parse(TaskKind::Dimension, &input).unwrap();
        let params = request.render_params();
        assert_eq!(params["dimensions"]["length"]["inch"], json!(4.0));
        assert_eq!(params["dimensions"]["height"]["inch"], json!(10.0));
        assert_eq!(params["dimensions"]["height"]["unit"], json!("cm"));
        assert!(params["dimensions"].get("width").is_none());
    }

    #[test]
    fn test_inch_conversion_rounds_to_two_decimals() {
        assert_eq!(Dimension::cm(10.5).inches(), 4.13);
        assert_eq!(Dimension::cm(15.2).inches(), 5.98);
    }

    #[test]
    fn test_non_positive_dimension_is_invalid() {
        let input = json!({
            "image_url": "https://cdn.example.com/p/1.png",
            "length": 0.0,
            "height": 15.2
        });

        let err = ImageRequest::parse(TaskKind::Dimension, &input).unwrap_err();
        assert!(matches!(
            err,
            RequestError::Invalid {
                field: "dimensions.length",
                ..
            }
        ));
    }

    #[test]
    fn test_non_http_url_is_invalid() {
        let input = json!({ "batch_code": "B-2024-01", "barcode_url": "ftp://files/x.png" });
        let err = ImageRequest::parse(TaskKind::ComplianceLabel, &input).unwrap_err();
        assert!(matches!(
            err,
            RequestError::Invalid {
                field: "barcode_url",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let err = ImageRequest::parse(TaskKind::Carousel, &json!({ "title": "x" })).unwrap_err();
        assert!(matches!(
            err,
            RequestError::Malformed {
                kind: TaskKind::Carousel,
                ..
            }
        ));
    }

    #[test]
    fn test_carousel_defaults() {
        let input = json!({
            "zip_url": "https://cdn.example.com/media.zip",
            "dimensions_text": "20x10x5 cm"
        });
        let request = ImageRequest::parse(TaskKind::Carousel, &input).unwrap();
        assert_eq!(request.kind(), TaskKind::Carousel);
        assert_eq!(request.render_params()["pcs"], json!(1));
    }

    #[test]
    fn test_product_info_requires_pieces() {
        let input = json!({
            "image_url": "https://cdn.example.com/p.png",
            "title": "Castle",
            "pcs": 0,
            "height_cm": 12.0,
            "length_cm": 30.0
        });
        let err = ImageRequest::parse(TaskKind::ProductInfo, &input).unwrap_err();
        assert!(matches!(err, RequestError::Invalid { field: "pcs", .. }));
    }
}
