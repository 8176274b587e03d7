/*
 * OrbitalVoice - Polyphonic Voice Engine
 * Copyright (c) 2025 MACHIKO LAB
 *
 * Voice Template Extractor - backward reachability + topological ordering
 */

//! 終端マーカーからの後方到達で信号チェーンを切り出し、接続順に並んだ
//! シリアライズ可能なボイステンプレートを作る。コントローラー起点の
//! エッジはボイスの信号経路に入らないため走査から除外する。
//!
//! 抽出はエディタ所有の構造を一切変更しない。ID ベースの隣接ビューを
//! 毎回作り直してから歩く。

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{VoiceEngineError, VoiceEngineResult};
use crate::graph::{GraphEdge, GraphNode};
use crate::nodes::NodeKind;

/// テンプレート内の 1 ノード。パラメーターは抽出時点の値スナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// 由来するキャンバスノードの ID
    pub node_id: Uuid,
    pub kind: NodeKind,
    /// キャンバス常駐インスタンスを共有参照する場合はその ID
    pub shared_node: Option<Uuid>,
}

/// ソート後の位置インデックスで表したエッジ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub from: usize,
    pub to: usize,
}

/// 1 本の信号チェーンの設計図。終端マーカー ID をキーとし、
/// 構造編集のたびに作り直されて丸ごと置き換わる。生成後は不変。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceTemplate {
    /// 終端マーカーのノード ID
    pub id: Uuid,
    pub nodes: Vec<NodeDescriptor>,
    pub edges: Vec<EdgeDescriptor>,
}

impl VoiceTemplate {
    /// テンプレート中のエンベロープの最長リリース（秒）
    pub fn max_release_secs(&self) -> f32 {
        self.nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Envelope(p) => Some(p.release),
                _ => None,
            })
            .fold(0.0, f32::max)
    }

    pub fn has_envelope(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Envelope(_)))
    }
}

/// 終端マーカーから後方到達可能なサブグラフを抽出する
///
/// 1. ターゲット一致で後方 BFS。終端マーカー自体は結果に含めない
/// 2. ソースがコントローラーのエッジは除外
/// 3. 到達集合内部のエッジで Kahn 法（ゼロ入次数フロンティア、FIFO 展開）
/// 4. エッジをソート後の位置インデックスに引き直す
///
/// 到達サブグラフに循環があると並べ切れないノードが残る。その場合は
/// 黙って落とさず `CyclicGraph` で抽出ごと拒否する。
pub fn extract_template(
    end_marker: Uuid,
    nodes: &[GraphNode],
    edges: &[GraphEdge],
) -> VoiceEngineResult<VoiceTemplate> {
    let by_id: HashMap<Uuid, &GraphNode> = nodes.iter().map(|n| (n.id, n)).collect();
    if !by_id.contains_key(&end_marker) {
        return Err(VoiceEngineError::node_not_found(end_marker));
    }

    let mut incoming: HashMap<Uuid, Vec<&GraphEdge>> = HashMap::new();
    for edge in edges {
        incoming.entry(edge.target).or_default().push(edge);
    }

    // Backward BFS, controller-sourced edges excluded.
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut reached: Vec<Uuid> = Vec::new();
    let mut queue: VecDeque<Uuid> = VecDeque::new();
    visited.insert(end_marker);
    queue.push_back(end_marker);

    while let Some(current) = queue.pop_front() {
        let Some(edges_in) = incoming.get(&current) else {
            continue;
        };
        for edge in edges_in {
            let Some(source) = by_id.get(&edge.source) else {
                continue;
            };
            if source.kind.is_controller() {
                continue;
            }
            if visited.insert(edge.source) {
                reached.push(edge.source);
                queue.push_back(edge.source);
            }
        }
    }

    // Edges fully inside the reached set (the end marker is not part of it).
    let member: HashSet<Uuid> = reached.iter().copied().collect();
    let internal: Vec<(Uuid, Uuid)> = edges
        .iter()
        .filter(|e| member.contains(&e.source) && member.contains(&e.target))
        .filter(|e| !by_id[&e.source].kind.is_controller())
        .map(|e| (e.source, e.target))
        .collect();

    // Kahn's algorithm, seeded in discovery order for determinism.
    let mut in_degree: HashMap<Uuid, usize> = reached.iter().map(|id| (*id, 0)).collect();
    for (_, target) in &internal {
        if let Some(d) = in_degree.get_mut(target) {
            *d += 1;
        }
    }

    let mut frontier: VecDeque<Uuid> = reached
        .iter()
        .filter(|id| in_degree[id] == 0)
        .copied()
        .collect();
    let mut sorted: Vec<Uuid> = Vec::with_capacity(reached.len());
    while let Some(id) = frontier.pop_front() {
        sorted.push(id);
        for (source, target) in &internal {
            if *source != id {
                continue;
            }
            if let Some(d) = in_degree.get_mut(target) {
                *d -= 1;
                if *d == 0 {
                    frontier.push_back(*target);
                }
            }
        }
    }

    if sorted.len() < reached.len() {
        let leftover: Vec<Uuid> = reached
            .iter()
            .filter(|id| !sorted.contains(id))
            .copied()
            .collect();
        return Err(VoiceEngineError::CyclicGraph { nodes: leftover });
    }

    let position: HashMap<Uuid, usize> = sorted.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let descriptors = sorted
        .iter()
        .map(|id| {
            let kind = by_id[id].kind.clone();
            let shared_node = match kind {
                // Canvas-resident processors are shared across voices.
                NodeKind::Filter(_) | NodeKind::Monitor => Some(*id),
                _ => None,
            };
            NodeDescriptor {
                node_id: *id,
                kind,
                shared_node,
            }
        })
        .collect();

    let edge_descriptors = internal
        .iter()
        .map(|(s, t)| EdgeDescriptor {
            from: position[s],
            to: position[t],
        })
        .collect();

    Ok(VoiceTemplate {
        id: end_marker,
        nodes: descriptors,
        edges: edge_descriptors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphDescription;
    use crate::nodes::{
        EnvelopeParams, FilterParams, GeneratorParams, ModulationTarget, NodeClass,
    };

    /// osc -> filt -> env -> OUTPUT, piano (controller) -> osc
    fn scenario() -> (GraphDescription, Uuid, Uuid, Uuid, Uuid, Uuid) {
        let mut g = GraphDescription::new();
        let osc = g.add_node(NodeKind::Generator(GeneratorParams::default()));
        let filt = g.add_node(NodeKind::Filter(FilterParams::default()));
        let env = g.add_node(NodeKind::Envelope(EnvelopeParams::default()));
        let out = g.add_node(NodeKind::Output);
        let piano = g.add_node(NodeKind::Controller);
        g.add_edge(osc, filt);
        g.add_edge(filt, env);
        g.add_edge(env, out);
        g.add_edge(piano, osc);
        (g, osc, filt, env, out, piano)
    }

    #[test]
    fn test_extraction_scenario() {
        let (g, osc, filt, env, out, piano) = scenario();
        let template = extract_template(out, &g.nodes, &g.edges).unwrap();

        let ids: Vec<Uuid> = template.nodes.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![osc, filt, env]);
        assert!(!ids.contains(&out));
        assert!(!ids.contains(&piano));

        let classes: Vec<NodeClass> = template
            .nodes
            .iter()
            .map(|n| n.kind.class().unwrap())
            .collect();
        assert_eq!(
            classes,
            vec![NodeClass::Generator, NodeClass::Filter, NodeClass::Envelope]
        );

        assert_eq!(
            template.edges,
            vec![
                EdgeDescriptor { from: 0, to: 1 },
                EdgeDescriptor { from: 1, to: 2 }
            ]
        );
    }

    #[test]
    fn test_filter_marked_shared_generator_not() {
        let (g, _, filt, _, out, _) = scenario();
        let template = extract_template(out, &g.nodes, &g.edges).unwrap();

        assert_eq!(template.nodes[0].shared_node, None);
        assert_eq!(template.nodes[1].shared_node, Some(filt));
        assert_eq!(template.nodes[2].shared_node, None);
    }

    #[test]
    fn test_unreachable_branch_excluded() {
        let (mut g, _, _, _, out, _) = scenario();
        // A second generator wired to nothing must not appear.
        let stray = g.add_node(NodeKind::Generator(GeneratorParams::default()));
        let template = extract_template(out, &g.nodes, &g.edges).unwrap();
        assert!(template.nodes.iter().all(|n| n.node_id != stray));
    }

    #[test]
    fn test_unknown_end_marker() {
        let (g, ..) = scenario();
        let err = extract_template(Uuid::new_v4(), &g.nodes, &g.edges).unwrap_err();
        assert!(matches!(err, VoiceEngineError::NodeNotFound { .. }));
    }

    #[test]
    fn test_cycle_is_rejected_with_diagnostic() {
        let mut g = GraphDescription::new();
        let a = g.add_node(NodeKind::Filter(FilterParams::default()));
        let b = g.add_node(NodeKind::Filter(FilterParams::default()));
        let out = g.add_node(NodeKind::Output);
        g.add_edge(a, b);
        g.add_edge(b, a);
        g.add_edge(b, out);

        let err = extract_template(out, &g.nodes, &g.edges).unwrap_err();
        match err {
            VoiceEngineError::CyclicGraph { nodes } => {
                assert!(nodes.contains(&a));
                assert!(nodes.contains(&b));
            }
            other => panic!("expected CyclicGraph, got {}", other),
        }
    }

    #[test]
    fn test_snapshot_is_by_value() {
        let (mut g, osc, _, _, out, _) = scenario();
        let template = extract_template(out, &g.nodes, &g.edges).unwrap();

        // A later live edit must not mutate the issued template.
        if let Some(node) = g.nodes.iter_mut().find(|n| n.id == osc) {
            node.kind = NodeKind::Generator(GeneratorParams {
                octave_offset: 2,
                ..GeneratorParams::default()
            });
        }
        match &template.nodes[0].kind {
            NodeKind::Generator(p) => assert_eq!(p.octave_offset, 0),
            _ => panic!("expected generator first"),
        }
    }

    #[test]
    fn test_max_release() {
        let mut g = GraphDescription::new();
        let env_a = g.add_node(NodeKind::Envelope(EnvelopeParams {
            release: 0.4,
            ..EnvelopeParams::default()
        }));
        let env_b = g.add_node(NodeKind::Envelope(EnvelopeParams {
            release: 1.2,
            target: ModulationTarget::Filter,
            ..EnvelopeParams::default()
        }));
        let out = g.add_node(NodeKind::Output);
        g.add_edge(env_a, env_b);
        g.add_edge(env_b, out);

        let template = extract_template(out, &g.nodes, &g.edges).unwrap();
        assert!(template.has_envelope());
        assert!((template.max_release_secs() - 1.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_template_json_round_trip() {
        let (g, _, _, _, out, _) = scenario();
        let template = extract_template(out, &g.nodes, &g.edges).unwrap();

        let json = serde_json::to_string(&template).unwrap();
        let back: VoiceTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(template, back);
    }
}
