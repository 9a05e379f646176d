use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Output size requested from the image-editing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSize {
    Auto,
    Exact { width: u32, height: u32 },
}

impl OutputSize {
    pub const fn square(side: u32) -> Self {
        Self::Exact {
            width: side,
            height: side,
        }
    }

    /// Concrete pixel dimensions, using `fallback` for `Auto`.
    pub fn dimensions_or(self, fallback: (u32, u32)) -> (u32, u32) {
        match self {
            Self::Auto => fallback,
            Self::Exact { width, height } => (width, height),
        }
    }
}

impl Default for OutputSize {
    fn default() -> Self {
        Self::square(1024)
    }
}

impl fmt::Display for OutputSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Exact { width, height } => write!(f, "{width}x{height}"),
        }
    }
}

impl FromStr for OutputSize {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized == "auto" {
            return Ok(Self::Auto);
        }
        let invalid = || {
            PipelineError::Config(format!(
                "invalid output size '{raw}' (expected WIDTHxHEIGHT or auto)"
            ))
        };
        let (left, right) = normalized
            .split_once(['x', '×', '*'])
            .ok_or_else(invalid)?;
        let width = left.trim().parse::<u32>().map_err(|_| invalid())?;
        let height = right.trim().parse::<u32>().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::Exact { width, height })
    }
}
