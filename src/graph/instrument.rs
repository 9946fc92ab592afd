//! Standard instrument part graph
//!
//! `constructions` holds the reference geometry every part is laid out
//! against; the parts hang off it and `assembly` joins them.

use super::{BuildNode, DependencyGraph, NodeKind};
use crate::error::ForgeResult;
use crate::params::catalog::names_with_prefix;

/// Node id of the optional body neck-pocket part
pub const NECK_POCKET: &str = "neck_pocket";

/// Register the standard part graph
pub fn instrument_graph() -> ForgeResult<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for node in standard_nodes() {
        graph.register(node)?;
    }
    Ok(graph)
}

/// Nodes of the standard graph in declaration order
pub fn standard_nodes() -> Vec<BuildNode> {
    let constructions = BuildNode::new("constructions", NodeKind::Constructions)
        .params(names_with_prefix("scale."))
        .params([
            "nut.offset",
            "nut.position",
            "nut.spacing",
            "nut.stringDistanceProj",
            "bridge.bassCompensation",
            "bridge.trebleCompensation",
            "bridge.stringDistanceProj",
            "fretboard.startMargin",
            "fretboard.endMargin",
            "fretboard.sideMargin",
            "fretboard.perpendicularFret",
            "fretboard.frets",
            "stringSet.gauges",
        ]);

    let fretboard = BuildNode::new("fretboard", NodeKind::Fretboard)
        .params([
            "fretboard.thickness",
            "fretboard.startRadius",
            "fretboard.endRadius",
            "fretboard.fretNipping",
            "fretboard.inlayDepth",
            "internal.inlayImport",
        ])
        .params(names_with_prefix("fretWire."))
        .after(["constructions"]);

    let nut = BuildNode::new("nut", NodeKind::Nut)
        .params(["nut.thickness", "nut.depth", "fretboard.startRadius"])
        .after(["constructions"]);

    let neck = BuildNode::new("neck", NodeKind::Neck)
        .params(names_with_prefix("neck."))
        .params(names_with_prefix("trussRod."))
        .params(["fretboard.thickness"])
        .after(["constructions"]);

    let headstock = BuildNode::new("headstock", NodeKind::Headstock)
        .params(names_with_prefix("headStock."))
        .params(["internal.headstockImport"])
        .after(["neck"]);

    let body = BuildNode::new("body", NodeKind::Body)
        .params(names_with_prefix("body."))
        .params(["neck.joint", "neck.topOffset", "internal.bodyImport"])
        .after(["constructions"]);

    let bridge = BuildNode::new("bridge", NodeKind::Bridge)
        .params(["bridge.height"])
        .after(["constructions"]);

    let assembly = BuildNode::new("assembly", NodeKind::Assembly).after([
        "fretboard",
        "nut",
        "neck",
        "headstock",
        "body",
        "bridge",
    ]);

    vec![
        constructions,
        fretboard,
        nut,
        neck,
        headstock,
        body,
        bridge,
        assembly,
    ]
}

/// Optional neck pocket cut, built from the body and the neck outline.
///
/// Register it, then re-register `assembly` with it as an extra input, to
/// enable the pocket; reverse the order to disable it.
pub fn neck_pocket_node() -> BuildNode {
    BuildNode::new(NECK_POCKET, NodeKind::Custom("neck_pocket".to_string()))
        .params([
            "body.neckPocketDepth",
            "body.neckPocketLength",
            "neck.tenonThickness",
            "neck.tenonLength",
            "neck.tenonOffset",
        ])
        .after(["body", "neck"])
}
