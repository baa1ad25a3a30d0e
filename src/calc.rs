use serde::Serialize;

use crate::rubric::{RubricNode, RubricTree};
use crate::scores::{
    is_under_range, leaf_mark, resolve_leaf_value, stray_entries, EntryIssue, EntryWarning,
    LevelScale, Resolution, ScoreSheet,
};

/// Half-up 1-decimal rounding, `floor(10*x + 0.5) / 10`. Display only;
/// totals are never rounded.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregate {
    pub value: f64,
    pub is_complete: bool,
    pub over_limit: bool,
}

/// Bottom-up subtotal of `node`. A node with no leaves below it is
/// vacuously complete with value 0.
pub fn aggregate(node: &RubricNode, sheet: &ScoreSheet, scale: LevelScale) -> NodeAggregate {
    match node {
        RubricNode::Leaf(leaf) => {
            let resolution = resolve_leaf_value(leaf, sheet);
            let value = leaf_mark(leaf, resolution, scale);
            NodeAggregate {
                value,
                is_complete: resolution.is_scored(),
                over_limit: value > leaf.meta.max_marks,
            }
        }
        RubricNode::Internal(n) => {
            let mut value = 0.0;
            let mut is_complete = true;
            let mut child_over = false;
            for child in &n.children {
                let a = aggregate(child, sheet, scale);
                value += a.value;
                is_complete &= a.is_complete;
                child_over |= a.over_limit;
            }
            NodeAggregate {
                value,
                is_complete,
                over_limit: child_over || value > n.meta.max_marks,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafEntry {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub id: String,
    pub component: String,
    pub depth: usize,
    pub is_leaf: bool,
    pub value: f64,
    pub max_marks: f64,
    pub is_complete: bool,
    pub over_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<LeafEntry>,
}

/// Everything a marking form needs to render subtotals and inline
/// warnings for one sheet. Nodes are in preorder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub total: f64,
    pub max_total: f64,
    pub is_complete: bool,
    pub over_limit: bool,
    pub over_limit_node_ids: Vec<String>,
    /// Free-entry leaves holding a value below zero.
    pub under_range_node_ids: Vec<String>,
    pub unscored_leaf_ids: Vec<String>,
    pub nodes: Vec<NodeReport>,
    pub warnings: Vec<EntryWarning>,
}

pub fn evaluate(tree: &RubricTree, sheet: &ScoreSheet, scale: LevelScale) -> EvaluationReport {
    let mut nodes = Vec::new();
    let mut warnings = Vec::new();
    let root = evaluate_node(tree.root(), 0, sheet, scale, &mut nodes, &mut warnings);
    warnings.extend(stray_entries(tree, sheet));

    let over_limit_node_ids = nodes
        .iter()
        .filter(|n| n.value > n.max_marks)
        .map(|n| n.id.clone())
        .collect();
    let under_range_node_ids = warnings
        .iter()
        .filter(|w| w.kind == EntryIssue::NegativeValue)
        .map(|w| w.node_id.clone())
        .collect();
    let unscored_leaf_ids = nodes
        .iter()
        .filter(|n| n.is_leaf && !n.is_complete)
        .map(|n| n.id.clone())
        .collect();

    EvaluationReport {
        total: root.value,
        max_total: tree.max_total(),
        is_complete: root.is_complete,
        over_limit: root.over_limit,
        over_limit_node_ids,
        under_range_node_ids,
        unscored_leaf_ids,
        nodes,
        warnings,
    }
}

// Pushes the node's report before its children so `nodes` stays in preorder,
// then patches the subtotal in once the children are known.
fn evaluate_node(
    node: &RubricNode,
    depth: usize,
    sheet: &ScoreSheet,
    scale: LevelScale,
    nodes: &mut Vec<NodeReport>,
    warnings: &mut Vec<EntryWarning>,
) -> NodeAggregate {
    let slot = nodes.len();
    nodes.push(NodeReport {
        id: node.id().to_string(),
        component: node.component().to_string(),
        depth,
        is_leaf: node.is_leaf(),
        value: 0.0,
        max_marks: node.max_marks(),
        is_complete: false,
        over_limit: false,
        entry: None,
    });

    let (agg, entry) = match node {
        RubricNode::Leaf(leaf) => {
            let resolution = resolve_leaf_value(leaf, sheet);
            let entry = match resolution {
                Resolution::Unscored => LeafEntry {
                    state: resolution.state(),
                    raw: None,
                    level_label: None,
                },
                Resolution::Scored(raw) => {
                    if is_under_range(leaf, resolution) {
                        warnings.push(EntryWarning {
                            node_id: leaf.meta.id.clone(),
                            kind: EntryIssue::NegativeValue,
                            raw,
                        });
                    }
                    LeafEntry {
                        state: resolution.state(),
                        raw: Some(raw),
                        level_label: leaf.level_for(raw).map(|l| l.label.clone()),
                    }
                }
                Resolution::Invalid { raw, issue } => {
                    warnings.push(EntryWarning {
                        node_id: leaf.meta.id.clone(),
                        kind: issue,
                        raw,
                    });
                    LeafEntry {
                        state: resolution.state(),
                        raw: Some(raw),
                        level_label: None,
                    }
                }
            };
            (aggregate(node, sheet, scale), Some(entry))
        }
        RubricNode::Internal(n) => {
            let mut value = 0.0;
            let mut is_complete = true;
            let mut child_over = false;
            for child in &n.children {
                let a = evaluate_node(child, depth + 1, sheet, scale, nodes, warnings);
                value += a.value;
                is_complete &= a.is_complete;
                child_over |= a.over_limit;
            }
            let agg = NodeAggregate {
                value,
                is_complete,
                over_limit: child_over || value > n.meta.max_marks,
            };
            (agg, None)
        }
    };

    let report = &mut nodes[slot];
    report.value = agg.value;
    report.is_complete = agg.is_complete;
    report.over_limit = agg.over_limit;
    report.entry = entry;
    agg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::{InternalNode, NodeMeta, RubricNodeSpec};
    use serde_json::json;

    fn tree(v: serde_json::Value) -> RubricTree {
        let spec: RubricNodeSpec = serde_json::from_value(v).expect("spec");
        RubricTree::load(&spec, LevelScale::default()).expect("tree")
    }

    fn two_part() -> RubricTree {
        tree(json!({
            "id": "root", "maxMarks": 20,
            "children": [{ "id": "a", "maxMarks": 10 }, { "id": "b", "maxMarks": 10 }]
        }))
    }

    #[test]
    fn round_off_rounds_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(0.25), 0.3);
        assert_eq!(round_off_1_decimal(35.6818), 35.7);
    }

    #[test]
    fn partial_then_complete_sheet() {
        let t = two_part();
        let mut sheet: ScoreSheet = [("a", 7.0)].into_iter().collect();
        let a = aggregate(t.root(), &sheet, LevelScale::default());
        assert_eq!(
            a,
            NodeAggregate {
                value: 7.0,
                is_complete: false,
                over_limit: false
            }
        );

        sheet.set("b", 9.0);
        let a = aggregate(t.root(), &sheet, LevelScale::default());
        assert_eq!(
            a,
            NodeAggregate {
                value: 16.0,
                is_complete: true,
                over_limit: false
            }
        );
    }

    #[test]
    fn childless_section_is_vacuously_complete() {
        let root = RubricNode::Internal(InternalNode {
            meta: NodeMeta {
                id: "root".into(),
                component: "Empty".into(),
                max_marks: 0.0,
                description: None,
            },
            children: Vec::new(),
        });
        let t = RubricTree::from_root(root, LevelScale::default()).expect("tree");
        let a = aggregate(t.root(), &ScoreSheet::new(), LevelScale::default());
        assert_eq!(
            a,
            NodeAggregate {
                value: 0.0,
                is_complete: true,
                over_limit: false
            }
        );
        assert_eq!(t.leaf_count(), 0);
    }

    #[test]
    fn over_limit_propagates_to_ancestors() {
        let t = two_part();
        let sheet: ScoreSheet = [("a", 12.0), ("b", 1.0)].into_iter().collect();
        let a = aggregate(t.root(), &sheet, LevelScale::default());
        // 13 fits the root, but the child is over its own limit.
        assert_eq!(a.value, 13.0);
        assert!(a.over_limit);

        let report = evaluate(&t, &sheet, LevelScale::default());
        assert_eq!(report.over_limit_node_ids, vec!["a".to_string()]);
    }

    #[test]
    fn report_lists_nodes_in_preorder_with_warnings() {
        let t = tree(json!({
            "id": "root", "maxMarks": 20,
            "children": [
                { "id": "sec", "maxMarks": 10, "children": [
                    { "id": "x", "maxMarks": 10, "levels": [
                        { "score": 5, "label": "Excellent" },
                        { "score": 3, "label": "Fair" }
                    ]}
                ]},
                { "id": "y", "maxMarks": 10 }
            ]
        }));
        let sheet: ScoreSheet = [("x", 3.0), ("y", 2.0), ("ghost", 1.0)]
            .into_iter()
            .collect();
        let report = evaluate(&t, &sheet, LevelScale::default());
        let ids: Vec<&str> = report.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["root", "sec", "x", "y"]);
        assert_eq!(report.nodes[1].value, 6.0);
        assert_eq!(report.total, 8.0);
        assert!(report.is_complete);
        assert_eq!(
            report.nodes[2]
                .entry
                .as_ref()
                .and_then(|e| e.level_label.as_deref()),
            Some("Fair")
        );
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].node_id, "ghost");
    }

    #[test]
    fn negative_free_entry_counts_as_entered_and_is_flagged() {
        let t = two_part();
        let sheet: ScoreSheet = [("a", -2.0), ("b", 5.0)].into_iter().collect();
        let report = evaluate(&t, &sheet, LevelScale::default());
        assert_eq!(report.total, 3.0);
        assert!(report.is_complete);
        assert!(!report.over_limit);
        assert_eq!(report.under_range_node_ids, vec!["a".to_string()]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, EntryIssue::NegativeValue);
        assert_eq!(report.warnings[0].raw, -2.0);
        assert_eq!(report.nodes[1].entry.as_ref().map(|e| e.state), Some("scored"));
    }

    #[test]
    fn report_total_matches_aggregate() {
        let t = two_part();
        let sheet: ScoreSheet = [("a", 4.5)].into_iter().collect();
        let report = evaluate(&t, &sheet, LevelScale::default());
        let a = aggregate(t.root(), &sheet, LevelScale::default());
        assert_eq!(report.total, a.value);
        assert_eq!(report.is_complete, a.is_complete);
        assert_eq!(report.unscored_leaf_ids, vec!["b".to_string()]);
    }
}
