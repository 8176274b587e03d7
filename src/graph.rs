use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::nodes::NodeKind;

/// エディタ側から渡されるノード記述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub kind: NodeKind,
}

impl GraphNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }
}

/// エディタ側から渡される接続記述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: Uuid,
    pub target: Uuid,
}

impl GraphEdge {
    pub fn new(source: Uuid, target: Uuid) -> Self {
        Self { source, target }
    }
}

/// キャンバス全体のスナップショット
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDescription {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: Uuid) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn add_node(&mut self, kind: NodeKind) -> Uuid {
        let node = GraphNode::new(kind);
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn add_edge(&mut self, source: Uuid, target: Uuid) {
        self.edges.push(GraphEdge::new(source, target));
    }

    /// 出力マーカーを宣言順に列挙
    pub fn output_markers(&self) -> Vec<Uuid> {
        self.nodes
            .iter()
            .filter(|n| n.kind.is_output())
            .map(|n| n.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{FilterParams, GeneratorParams};

    #[test]
    fn test_graph_description_json_round_trip() {
        let mut graph = GraphDescription::new();
        let osc = graph.add_node(NodeKind::Generator(GeneratorParams::default()));
        let filt = graph.add_node(NodeKind::Filter(FilterParams::default()));
        let out = graph.add_node(NodeKind::Output);
        graph.add_edge(osc, filt);
        graph.add_edge(filt, out);

        let json = serde_json::to_string(&graph).unwrap();
        let back: GraphDescription = serde_json::from_str(&json).unwrap();

        assert_eq!(back.nodes.len(), 3);
        assert_eq!(back.edges.len(), 2);
        assert_eq!(back.node(osc).unwrap().id, osc);
        assert_eq!(back.output_markers(), vec![out]);
    }
}
