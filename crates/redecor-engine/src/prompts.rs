use std::fmt;

use serde::{Deserialize, Serialize};

/// Stage-1 instruction: a task line, then what must survive, then what must not happen.
pub const DEFAULT_EMPTY_ROOM_PROMPT: &str = concat!(
    "# Task\n",
    "- Remove all furniture, decorations and loose objects from the photo, except the ",
    "elements listed under Keep.\n",
    "# Keep (do not change)\n",
    "- The full structure of the walls, including columns, corners, ceiling and floor shape.\n",
    "- The original design of the window frames and doors.\n",
    "- The original material and texture of the walls and floor.\n",
    "# Avoid (never do)\n",
    "- Do not demolish or create new walls.\n",
    "- Do not change the size or shape of the windows.\n",
    "- Do not alter the layout or structure of the room in any way.",
);

const STYLE_FALLBACK: &str = "Apply a realistic, lived-in furniture arrangement.";

/// Free-form redesign direction. Embedded verbatim into the compositing instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StyleDirective(String);

impl StyleDirective {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for StyleDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StyleDirective {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StyleDirective {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Structured redesign request, as collected by an intake form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleBrief {
    #[serde(default)]
    pub design_style: Option<String>,
    #[serde(default)]
    pub residence_type: Option<String>,
    #[serde(default)]
    pub space_type: Option<String>,
    #[serde(default)]
    pub family_type: Option<String>,
    #[serde(default)]
    pub budget_range: Option<String>,
}

impl StyleBrief {
    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }

    pub fn to_directive(&self) -> StyleDirective {
        let lines = self.lines();
        if lines.is_empty() {
            return StyleDirective::new(STYLE_FALLBACK);
        }
        StyleDirective::new(lines.join("\n"))
    }

    fn lines(&self) -> Vec<String> {
        [
            ("Design style", &self.design_style),
            ("Residence type", &self.residence_type),
            ("Space type", &self.space_type),
            ("Household", &self.family_type),
            ("Budget range", &self.budget_range),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(|text| format!("- {label}: {text}"))
        })
        .collect()
    }
}

/// Full stage-3 instruction. `furniture` lists the identifiers of the reference images that
/// follow the base image in the request, in order.
pub fn composite_instruction(directive: &StyleDirective, furniture: &[String]) -> String {
    let style = if directive.is_blank() {
        STYLE_FALLBACK
    } else {
        directive.as_str().trim()
    };
    let references = if furniture.is_empty() {
        "none".to_string()
    } else {
        furniture
            .iter()
            .enumerate()
            .map(|(idx, name)| format!("{}. {name}", idx + 1))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "The first image is a photo of an empty room. Furnish and decorate it according to the \
style direction below, keeping the room's architecture, windows, lighting and camera angle \
unchanged.\n\n\
Style direction:\n{style}\n\n\
Furniture reference images (attached after the room photo, in this order):\n{references}\n\n\
Placement rules:\n\
- Every piece stands on the floor or rests against a wall; nothing floats.\n\
- Pieces never overlap or intersect each other or the walls.\n\
- Keep realistic scale relative to doors and windows.\n\
- Reproduce referenced furniture faithfully in shape, colour and material.\n\n\
Output: return only a single composited image of the furnished room. Never answer with text."
    )
}
