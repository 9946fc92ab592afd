//! Instrument parameter catalogue
//!
//! Every parameter the standard instrument graph reads, with its default.
//! Lengths are millimeters, angles are degrees.

use super::ParamValue;
use crate::error::{ForgeError, ForgeResult};

/// Compile-time default for a catalogued parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Choice(&'static str),
    Text(&'static str),
    Floats(&'static [f64]),
}

/// Catalogue entry for one parameter
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    /// Dotted parameter name (e.g. `scale.bass`)
    pub name: &'static str,
    pub default: DefaultValue,
    pub description: &'static str,
    /// Allowed values for enumerated parameters (empty otherwise)
    pub choices: &'static [&'static str],
}

const NUT_SPACING: &[&str] = &["Equal Center", "Equal Gap"];
const NUT_POSITION: &[&str] = &["Parallel to fret zero", "Perpendicular to Mid Line"];
const NECK_JOINT: &[&str] = &["Bolt On", "Set In", "Through All"];
const TRANSITION_FUNCTION: &[&str] = &[
    "Catenary",
    "Quadratic",
    "Quadratic-Catenary",
    "Catenary-Quadratic",
];

const fn float(name: &'static str, value: f64, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        default: DefaultValue::Float(value),
        description,
        choices: &[],
    }
}

const fn int(name: &'static str, value: i64, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        default: DefaultValue::Int(value),
        description,
        choices: &[],
    }
}

const fn choice(
    name: &'static str,
    value: &'static str,
    choices: &'static [&'static str],
    description: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        default: DefaultValue::Choice(value),
        description,
        choices,
    }
}

/// All catalogued instrument parameters
pub const CATALOG: &[ParamSpec] = &[
    // Scale
    float("scale.bass", 647.7, "Bass scale length"),
    float("scale.treble", 647.7, "Treble scale length"),
    // Nut
    float("nut.thickness", 5.0, "Nut thickness"),
    choice("nut.spacing", "Equal Gap", NUT_SPACING, "String spacing"),
    choice("nut.position", "Perpendicular to Mid Line", NUT_POSITION, "Nut alignment"),
    float("nut.offset", 0.0, "Distance from fret zero to the nut"),
    float("nut.depth", 5.0, "Depth into the fretboard"),
    float("nut.stringDistanceProj", 34.5, "Distance between outer strings at the nut"),
    // Neck
    choice("neck.joint", "Set In", NECK_JOINT, "Neck joint type"),
    float("neck.startThickness", 15.0, "Thickness at the nut"),
    float("neck.endThickness", 15.0, "Thickness where the heel transition starts"),
    int("neck.jointFret", 16, "Fret where the heel transition starts"),
    float("neck.topOffset", 2.0, "Offset between body top and fretboard bottom"),
    float("neck.angle", 0.0, "Neck break angle"),
    float("neck.tenonThickness", 0.0, "Tenon thickness for set-in necks"),
    float("neck.tenonLength", 0.0, "Tenon length for set-in necks"),
    float("neck.tenonOffset", 0.0, "Tenon offset for set-in necks"),
    ParamSpec {
        name: "neck.profile",
        default: DefaultValue::Text("C Classic"),
        description: "Neck cross-section profile",
        choices: &[],
    },
    float("neck.transitionLength", 50.0, "Heel transition length"),
    float("neck.transitionTension", 35.0, "Heel transition tension"),
    choice(
        "neck.transitionFunction",
        "Catenary",
        TRANSITION_FUNCTION,
        "Heel transition curve",
    ),
    // Fretboard
    float("fretboard.thickness", 7.0, "Board thickness"),
    float("fretboard.startRadius", 254.0, "Radius at the nut"),
    float("fretboard.endRadius", 355.6, "Radius at the board end"),
    float("fretboard.startMargin", 5.0, "Margin before the nut"),
    float("fretboard.endMargin", 5.0, "Margin after the last fret"),
    float("fretboard.sideMargin", 3.0, "Side margin"),
    float("fretboard.fretNipping", 2.0, "Fret nipping distance"),
    int("fretboard.perpendicularFret", 7, "Fret perpendicular to the mid line"),
    int("fretboard.frets", 24, "Number of frets"),
    float("fretboard.inlayDepth", 1.0, "Inlay pocket depth"),
    // Bridge
    float("bridge.bassCompensation", 0.0, "Compensation on the bass scale"),
    float("bridge.trebleCompensation", 0.0, "Compensation on the treble scale"),
    float("bridge.stringDistanceProj", 63.0, "Distance between outer strings at the bridge"),
    float("bridge.height", 16.363, "Bridge height from body top to strings"),
    // Headstock
    float("headStock.width", 100.0, "Width without a custom contour"),
    float("headStock.length", 220.0, "Length without a custom contour"),
    float("headStock.thickness", 15.0, "Thickness"),
    float("headStock.depth", 5.0, "Depth for flat headstocks"),
    float("headStock.angle", 9.0, "Break angle"),
    float("headStock.transitionParamHorizontal", 0.5, "Transition stiffness"),
    float("headStock.voluteRadius", 50.0, "Volute radius, zero for none"),
    float("headStock.voluteOffset", 10.0, "Volute offset into the neck"),
    float("headStock.topTransitionLength", 20.0, "Nut to headstock top transition"),
    // Truss rod channel
    float("trussRod.length", 430.0, "Truss rod length"),
    float("trussRod.width", 6.0, "Channel width"),
    float("trussRod.depth", 9.0, "Channel depth"),
    float("trussRod.headLength", 20.0, "Head length"),
    float("trussRod.headWidth", 8.0, "Head width"),
    float("trussRod.headDepth", 11.0, "Head depth"),
    float("trussRod.tailLength", 0.0, "Tail length"),
    float("trussRod.tailWidth", 0.0, "Tail width"),
    float("trussRod.tailDepth", 0.0, "Tail depth"),
    float("trussRod.start", 0.0, "Distance from the nut"),
    // String set, gauges in inches
    ParamSpec {
        name: "stringSet.gauges",
        default: DefaultValue::Floats(&[0.010, 0.013, 0.017, 0.026, 0.036, 0.046]),
        description: "String gauges in inches",
        choices: &[],
    },
    // Fret wire
    float("fretWire.tangDepth", 1.397, "Fret slot depth"),
    float("fretWire.tangWidth", 0.508, "Fret slot width"),
    float("fretWire.crownHeight", 0.9906, "Crown height"),
    float("fretWire.crownWidth", 2.1336, "Crown width"),
    // Body
    float("body.topThickness", 5.0, "Top thickness"),
    float("body.backThickness", 40.0, "Back thickness"),
    float("body.length", 550.0, "Body blank length"),
    float("body.width", 350.0, "Body blank width"),
    float("body.neckPocketDepth", 20.0, "Neck pocket depth"),
    float("body.neckPocketLength", 55.0, "Neck pocket length"),
    // Revision counters of imported contours
    int("internal.bodyImport", 0, "Body contour import revision"),
    int("internal.headstockImport", 0, "Headstock contour import revision"),
    int("internal.inlayImport", 0, "Inlay import revision"),
];

/// Find the catalogue entry for a parameter
pub fn lookup(name: &str) -> Option<&'static ParamSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// Catalogue names under a dotted prefix (e.g. `"headStock."`)
pub fn names_with_prefix(prefix: &str) -> Vec<&'static str> {
    CATALOG
        .iter()
        .filter(|spec| spec.name.starts_with(prefix))
        .map(|spec| spec.name)
        .collect()
}

impl ParamSpec {
    /// Runtime value of the default
    pub fn default_value(&self) -> ParamValue {
        match self.default {
            DefaultValue::Float(v) => ParamValue::Float(v),
            DefaultValue::Int(v) => ParamValue::Int(v),
            DefaultValue::Bool(v) => ParamValue::Bool(v),
            DefaultValue::Choice(v) | DefaultValue::Text(v) => ParamValue::Text(v.to_string()),
            DefaultValue::Floats(v) => ParamValue::FloatList(v.to_vec()),
        }
    }

    /// Check a value against this entry, converting integers for float
    /// parameters
    pub fn coerce(&self, value: ParamValue) -> ForgeResult<ParamValue> {
        let mismatch = |value: &ParamValue| ForgeError::InvalidParameter {
            name: self.name.to_string(),
            reason: format!(
                "expected {}, got {}",
                self.default_value().type_name(),
                value.type_name()
            ),
        };

        match (self.default, value) {
            (DefaultValue::Float(_), ParamValue::Int(i)) => Ok(ParamValue::Float(i as f64)),
            (DefaultValue::Float(_), v @ ParamValue::Float(_)) => Ok(v),
            (DefaultValue::Int(_), v @ ParamValue::Int(_)) => Ok(v),
            (DefaultValue::Bool(_), v @ ParamValue::Bool(_)) => Ok(v),
            (DefaultValue::Text(_), v @ ParamValue::Text(_)) => Ok(v),
            (DefaultValue::Choice(_), ParamValue::Text(s)) => {
                if self.choices.contains(&s.as_str()) {
                    Ok(ParamValue::Text(s))
                } else {
                    Err(ForgeError::InvalidParameter {
                        name: self.name.to_string(),
                        reason: format!("'{}' is not one of: {}", s, self.choices.join(", ")),
                    })
                }
            }
            (DefaultValue::Floats(_), v @ ParamValue::FloatList(_)) => Ok(v),
            (DefaultValue::Floats(_), ParamValue::Float(f)) => Ok(ParamValue::FloatList(vec![f])),
            (_, v) => Err(mismatch(&v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let mut seen = HashSet::new();
        for spec in CATALOG {
            assert!(seen.insert(spec.name), "duplicate {}", spec.name);
        }
    }

    #[test]
    fn choice_defaults_are_valid() {
        for spec in CATALOG.iter().filter(|s| !s.choices.is_empty()) {
            assert!(spec.coerce(spec.default_value()).is_ok(), "{}", spec.name);
        }
    }

    #[test]
    fn prefix_lookup() {
        let names = names_with_prefix("scale.");
        assert_eq!(names, vec!["scale.bass", "scale.treble"]);
    }

    #[test]
    fn int_rejected_for_choice() {
        let spec = lookup("neck.joint").unwrap();
        assert!(spec.coerce(ParamValue::Int(1)).is_err());
    }
}
