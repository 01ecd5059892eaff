//! Task kinds

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The image operation a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Product photo annotated with title, piece count and size
    ProductInfo,

    /// Product photo annotated with length/height (and width) arrows
    Dimension,

    /// Carousel asset set generated from a zip of product media
    Carousel,

    /// Compliance label rendered from a batch code and barcode
    ComplianceLabel,
}

impl TaskKind {
    /// All kinds, in declaration order
    pub const ALL: [TaskKind; 4] = [
        TaskKind::ProductInfo,
        TaskKind::Dimension,
        TaskKind::Carousel,
        TaskKind::ComplianceLabel,
    ];

    /// Wire name (kebab-case)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductInfo => "product-info",
            Self::Dimension => "dimension",
            Self::Carousel => "carousel",
            Self::ComplianceLabel => "compliance-label",
        }
    }

    /// Prefix used when naming uploaded output objects
    pub fn object_prefix(&self) -> &'static str {
        match self {
            Self::ProductInfo => "product_info",
            Self::Dimension => "dimension",
            Self::Carousel => "carousel",
            Self::ComplianceLabel => "compliance_label",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown kind
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind: {0}")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}
