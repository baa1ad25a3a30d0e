use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::RubricError;
use crate::scores::LevelScale;

/// One selectable grade on a discrete-level leaf. `score` is on the level
/// scale (0..=5 by default), not in the node's mark range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub score: f64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Wire shape of a rubric node, as supplied by the rubric configuration
/// source. A node without children is a leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricNodeSpec {
    pub id: String,
    #[serde(default)]
    pub component: String,
    pub max_marks: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RubricNodeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<Level>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeMeta {
    pub id: String,
    pub component: String,
    pub max_marks: f64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    pub meta: NodeMeta,
    /// `None` means free numeric entry in `[0, max_marks]`.
    pub levels: Option<Vec<Level>>,
}

impl LeafNode {
    pub fn uses_levels(&self) -> bool {
        self.levels.is_some()
    }

    pub fn level_for(&self, score: f64) -> Option<&Level> {
        self.levels
            .as_ref()
            .and_then(|levels| levels.iter().find(|l| l.score == score))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode {
    pub meta: NodeMeta,
    pub children: Vec<RubricNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RubricNode {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl RubricNode {
    pub fn meta(&self) -> &NodeMeta {
        match self {
            Self::Leaf(l) => &l.meta,
            Self::Internal(n) => &n.meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn component(&self) -> &str {
        &self.meta().component
    }

    pub fn max_marks(&self) -> f64 {
        self.meta().max_marks
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn children(&self) -> &[RubricNode] {
        match self {
            Self::Leaf(_) => &[],
            Self::Internal(n) => &n.children,
        }
    }

    pub fn to_spec(&self) -> RubricNodeSpec {
        let meta = self.meta();
        let (children, levels) = match self {
            Self::Leaf(l) => (Vec::new(), l.levels.clone()),
            Self::Internal(n) => (n.children.iter().map(|c| c.to_spec()).collect(), None),
        };
        RubricNodeSpec {
            id: meta.id.clone(),
            component: meta.component.clone(),
            max_marks: meta.max_marks,
            description: meta.description.clone(),
            children,
            levels,
        }
    }
}

/// Preorder walk yielding `(depth, node)`, children in declared order.
pub struct Walk<'a> {
    stack: Vec<(usize, &'a RubricNode)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a RubricNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        for child in node.children().iter().rev() {
            self.stack.push((depth + 1, child));
        }
        Some((depth, node))
    }
}

pub fn walk(node: &RubricNode) -> Walk<'_> {
    Walk {
        stack: vec![(0, node)],
    }
}

/// Leaves under `node` in document order.
pub fn flatten_leaves(node: &RubricNode) -> Vec<&LeafNode> {
    walk(node)
        .filter_map(|(_, n)| match n {
            RubricNode::Leaf(l) => Some(l),
            RubricNode::Internal(_) => None,
        })
        .collect()
}

/// An entry field as a form renders it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafField {
    pub id: String,
    pub component: String,
    pub depth: usize,
    /// Components of the ancestors, root first.
    pub path: Vec<String>,
    pub max_marks: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<Level>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeLint {
    pub code: &'static str,
    pub node_id: String,
    pub message: String,
}

/// A validated rubric. Immutable once loaded; records borrow it.
#[derive(Debug, Clone, PartialEq)]
pub struct RubricTree {
    root: RubricNode,
}

impl RubricTree {
    pub fn load(spec: &RubricNodeSpec, scale: LevelScale) -> Result<Self, RubricError> {
        let mut seen = HashSet::new();
        let root = build_node(spec, "<root>", scale, &mut seen)?;
        Ok(Self { root })
    }

    /// Wraps an already-typed node after running the same shape checks as
    /// `load`. Allows childless sections, which the wire shape cannot express.
    pub fn from_root(mut root: RubricNode, scale: LevelScale) -> Result<Self, RubricError> {
        let mut seen = HashSet::new();
        check_typed_node(&mut root, "<root>", scale, &mut seen)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &RubricNode {
        &self.root
    }

    pub fn max_total(&self) -> f64 {
        self.root.max_marks()
    }

    pub fn walk(&self) -> Walk<'_> {
        walk(&self.root)
    }

    pub fn flatten_leaves(&self) -> Vec<&LeafNode> {
        flatten_leaves(&self.root)
    }

    pub fn leaf_count(&self) -> usize {
        self.walk().filter(|(_, n)| n.is_leaf()).count()
    }

    /// Number of levels below the root; a lone leaf has height 0.
    pub fn height(&self) -> usize {
        self.walk().map(|(d, _)| d).max().unwrap_or(0)
    }

    pub fn find(&self, id: &str) -> Option<&RubricNode> {
        self.walk().map(|(_, n)| n).find(|n| n.id() == id)
    }

    pub fn find_leaf(&self, id: &str) -> Option<&LeafNode> {
        match self.find(id) {
            Some(RubricNode::Leaf(l)) => Some(l),
            _ => None,
        }
    }

    pub fn depth_of(&self, id: &str) -> Option<usize> {
        self.walk().find(|(_, n)| n.id() == id).map(|(d, _)| d)
    }

    pub fn leaf_fields(&self) -> Vec<LeafField> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        collect_fields(&self.root, 0, &mut path, &mut out);
        out
    }

    /// Static configuration smells that do not block scoring.
    pub fn lints(&self) -> Vec<TreeLint> {
        let mut out = Vec::new();
        for (_, node) in self.walk() {
            let RubricNode::Internal(n) = node else {
                continue;
            };
            let child_sum: f64 = n.children.iter().map(|c| c.max_marks()).sum();
            if child_sum > n.meta.max_marks {
                out.push(TreeLint {
                    code: "children_exceed_parent",
                    node_id: n.meta.id.clone(),
                    message: format!(
                        "children of {} can total {} but the node allows {}",
                        n.meta.id, child_sum, n.meta.max_marks
                    ),
                });
            }
        }
        out
    }

    pub fn to_spec(&self) -> RubricNodeSpec {
        self.root.to_spec()
    }
}

fn collect_fields(
    node: &RubricNode,
    depth: usize,
    path: &mut Vec<String>,
    out: &mut Vec<LeafField>,
) {
    match node {
        RubricNode::Leaf(l) => out.push(LeafField {
            id: l.meta.id.clone(),
            component: l.meta.component.clone(),
            depth,
            path: path.clone(),
            max_marks: l.meta.max_marks,
            levels: l.levels.clone(),
        }),
        RubricNode::Internal(n) => {
            path.push(n.meta.component.clone());
            for child in &n.children {
                collect_fields(child, depth + 1, path, out);
            }
            path.pop();
        }
    }
}

fn check_meta(
    meta: &NodeMeta,
    parent_id: &str,
    seen: &mut HashSet<String>,
) -> Result<(), RubricError> {
    if meta.id.trim().is_empty() {
        return Err(RubricError::EmptyId {
            parent_id: parent_id.to_string(),
        });
    }
    if !meta.max_marks.is_finite() {
        return Err(RubricError::NonFiniteMaxMarks {
            node_id: meta.id.clone(),
        });
    }
    if meta.max_marks < 0.0 {
        return Err(RubricError::NegativeMaxMarks {
            node_id: meta.id.clone(),
            max_marks: meta.max_marks,
        });
    }
    if !seen.insert(meta.id.clone()) {
        return Err(RubricError::DuplicateId {
            node_id: meta.id.clone(),
        });
    }
    Ok(())
}

fn check_levels(node_id: &str, levels: &[Level], scale: LevelScale) -> Result<(), RubricError> {
    for (i, level) in levels.iter().enumerate() {
        if !level.score.is_finite() || level.score < 0.0 || level.score > scale.max() {
            return Err(RubricError::LevelOutOfScale {
                node_id: node_id.to_string(),
                score: level.score,
                scale_max: scale.max(),
            });
        }
        if levels[..i].iter().any(|prev| prev.score == level.score) {
            return Err(RubricError::DuplicateLevelScore {
                node_id: node_id.to_string(),
                score: level.score,
            });
        }
    }
    Ok(())
}

fn check_typed_node(
    node: &mut RubricNode,
    parent_id: &str,
    scale: LevelScale,
    seen: &mut HashSet<String>,
) -> Result<(), RubricError> {
    check_meta(node.meta(), parent_id, seen)?;
    match node {
        RubricNode::Leaf(leaf) => {
            if leaf.levels.as_ref().is_some_and(|l| l.is_empty()) {
                leaf.levels = None;
            }
            if let Some(levels) = &leaf.levels {
                check_levels(&leaf.meta.id, levels, scale)?;
            }
        }
        RubricNode::Internal(n) => {
            for child in &mut n.children {
                check_typed_node(child, &n.meta.id, scale, seen)?;
            }
        }
    }
    Ok(())
}

fn build_node(
    spec: &RubricNodeSpec,
    parent_id: &str,
    scale: LevelScale,
    seen: &mut HashSet<String>,
) -> Result<RubricNode, RubricError> {
    let meta = NodeMeta {
        id: spec.id.clone(),
        component: spec.component.clone(),
        max_marks: spec.max_marks,
        description: spec.description.clone(),
    };
    check_meta(&meta, parent_id, seen)?;

    if spec.children.is_empty() {
        // An empty `levels` list carries no grades; the leaf takes free entry.
        let levels = spec.levels.clone().filter(|l| !l.is_empty());
        if let Some(levels) = &levels {
            check_levels(&meta.id, levels, scale)?;
        }
        return Ok(RubricNode::Leaf(LeafNode { meta, levels }));
    }

    if spec.levels.is_some() {
        return Err(RubricError::LevelsOnInternal { node_id: meta.id });
    }
    let children = spec
        .children
        .iter()
        .map(|c| build_node(c, &spec.id, scale, seen))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RubricNode::Internal(InternalNode { meta, children }))
}
