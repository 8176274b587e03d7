/*
 * OrbitalVoice - Polyphonic Voice Engine
 * Copyright (c) 2025 MACHIKO LAB
 *
 * Voice Engine - editor-facing facade
 */

//! キャンバス編集と演奏入力をひとつの窓口にまとめる。エディタは
//! グラフが変わるたびに `graph_changed` を呼び、出力マーカーごとの
//! テンプレートが丸ごと作り直される。ノート入力は最初の出力マーカーの
//! テンプレートへ向かう。

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::errors::Logger;
use crate::graph::{GraphEdge, GraphNode};
use crate::manager::VoiceManager;
use crate::registry::{RoutingRegistry, SharedBackend};
use crate::template::extract_template;
use crate::voice::VoiceId;
use crate::log_warn;

/// シグナルルーティングとボイス管理の統合コンテキスト
///
/// グローバル状態は持たない。エンジンを複数作ればそれぞれ独立に動く。
pub struct VoiceEngine {
    registry: Arc<Mutex<RoutingRegistry>>,
    manager: VoiceManager,
    logger: Arc<dyn Logger>,
    /// ノート入力の向かう先。最初の出力マーカーのテンプレート
    primary_template: Option<Uuid>,
}

impl VoiceEngine {
    pub fn new(backend: SharedBackend, logger: Arc<dyn Logger>) -> Self {
        Self::with_clock(backend, logger, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        backend: SharedBackend,
        logger: Arc<dyn Logger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(Mutex::new(RoutingRegistry::new(
            backend.clone(),
            logger.clone(),
        )));
        let manager = VoiceManager::new(backend, registry.clone(), clock, logger.clone());
        Self {
            registry,
            manager,
            logger,
            primary_template: None,
        }
    }

    /// キャンバス常駐ノードを扱うレジストリへのハンドル
    pub fn registry(&self) -> Arc<Mutex<RoutingRegistry>> {
        self.registry.clone()
    }

    pub fn manager(&self) -> &VoiceManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut VoiceManager {
        &mut self.manager
    }

    /// 構造編集のたびに呼ぶ。出力マーカーごとにテンプレートを抽出し
    /// 直して丸ごと置き換える。抽出に失敗したチェーンはログだけ出して
    /// スキップし、他のチェーンは生かしたままにする。
    pub fn graph_changed(&mut self, nodes: &[GraphNode], edges: &[GraphEdge]) {
        let mut fresh: Vec<Uuid> = Vec::new();
        for node in nodes {
            if !node.kind.is_output() {
                continue;
            }
            match extract_template(node.id, nodes, edges) {
                Ok(template) => {
                    fresh.push(template.id);
                    self.manager.register_template(template);
                }
                Err(e) => {
                    log_warn!(self.logger, "graph_changed: extraction failed: {}", e);
                }
            }
        }

        for stale in self.manager.template_ids() {
            if !fresh.contains(&stale) {
                self.manager.unregister_template(stale);
            }
        }

        self.primary_template = fresh.first().copied();
    }

    /// ノートオン。テンプレートが無ければログだけ出して None
    pub fn note_on(&mut self, frequency: f32, intensity: f32) -> Option<VoiceId> {
        let Some(template_id) = self.primary_template else {
            log_warn!(self.logger, "note_on: no playable chain on the canvas");
            return None;
        };
        self.manager.start_voice(template_id, frequency, intensity)
    }

    /// ノートオフ。未知のボイスはマネージャ側で警告 no-op になる
    pub fn note_off(&mut self, voice_id: VoiceId) {
        self.manager.stop_voice(voice_id);
    }

    /// 締め切りの来たティアダウンを進める。定期的に呼ぶこと
    pub fn tick(&mut self) {
        self.manager.process_due_tasks();
    }

    /// コントローラー直結ノードの発音（テンプレート経路とは独立）
    pub fn trigger_controlled(&mut self, controller: Uuid, frequency: f32) {
        let Ok(mut registry) = self.registry.lock() else {
            self.logger.error("trigger_controlled: registry mutex poisoned");
            return;
        };
        registry.trigger_controlled_nodes(controller, frequency);
    }

    /// コントローラー直結ノードの解放
    pub fn release_controlled(&mut self, controller: Uuid) {
        let Ok(mut registry) = self.registry.lock() else {
            self.logger.error("release_controlled: registry mutex poisoned");
            return;
        };
        registry.release_controlled_nodes(controller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AudioBackend, MockBackend, NodeSpec};
    use crate::clock::ManualClock;
    use crate::errors::{LogLevel, MemoryLogger};
    use crate::graph::GraphDescription;
    use crate::nodes::{EnvelopeParams, FilterParams, GeneratorParams, NodeKind};
    use crate::registry::NodeMetadata;

    struct Fixture {
        mock: Arc<Mutex<MockBackend>>,
        logger: Arc<MemoryLogger>,
        clock: Arc<ManualClock>,
        engine: VoiceEngine,
    }

    fn fixture() -> Fixture {
        let mock: Arc<Mutex<MockBackend>> = Arc::new(Mutex::new(MockBackend::new()));
        let logger = Arc::new(MemoryLogger::new());
        let clock = Arc::new(ManualClock::new());
        let engine = VoiceEngine::with_clock(mock.clone(), logger.clone(), clock.clone());
        Fixture {
            mock,
            logger,
            clock,
            engine,
        }
    }

    /// osc -> env -> OUTPUT
    fn playable_graph() -> GraphDescription {
        let mut g = GraphDescription::new();
        let osc = g.add_node(NodeKind::Generator(GeneratorParams::default()));
        let env = g.add_node(NodeKind::Envelope(EnvelopeParams {
            release: 0.3,
            ..EnvelopeParams::default()
        }));
        let out = g.add_node(NodeKind::Output);
        g.add_edge(osc, env);
        g.add_edge(env, out);
        g
    }

    #[test]
    fn test_graph_changed_registers_template_per_output() {
        let mut fx = fixture();
        let mut g = playable_graph();
        let osc2 = g.add_node(NodeKind::Generator(GeneratorParams::default()));
        let out2 = g.add_node(NodeKind::Output);
        g.add_edge(osc2, out2);

        fx.engine.graph_changed(&g.nodes, &g.edges);
        assert_eq!(fx.engine.manager().template_ids().len(), 2);
        for out in g.output_markers() {
            assert!(fx.engine.manager().has_template(out));
        }
    }

    #[test]
    fn test_graph_changed_drops_stale_templates() {
        let mut fx = fixture();
        let g = playable_graph();
        let out = g.output_markers()[0];
        fx.engine.graph_changed(&g.nodes, &g.edges);
        assert!(fx.engine.manager().has_template(out));

        // The output marker got deleted from the canvas.
        let mut trimmed = g.clone();
        trimmed.nodes.retain(|n| !n.kind.is_output());
        trimmed.edges.retain(|e| e.target != out);
        fx.engine.graph_changed(&trimmed.nodes, &trimmed.edges);

        assert!(!fx.engine.manager().has_template(out));
        assert!(fx.engine.note_on(440.0, 1.0).is_none());
    }

    #[test]
    fn test_note_on_without_chain_is_logged_none() {
        let mut fx = fixture();
        assert!(fx.engine.note_on(440.0, 1.0).is_none());
        assert!(fx
            .logger
            .contains(LogLevel::Warn, "no playable chain"));
    }

    #[test]
    fn test_note_lifecycle_end_to_end() {
        let mut fx = fixture();
        let g = playable_graph();
        fx.engine.graph_changed(&g.nodes, &g.edges);

        let voice = fx.engine.note_on(440.0, 0.8).unwrap();
        assert_eq!(fx.engine.manager().active_voice_count(), 1);
        assert!(fx.mock.lock().unwrap().live_count() > 0);

        fx.engine.note_off(voice);
        assert_eq!(fx.engine.manager().active_voice_count(), 0);

        // Generator stop, then disposal after the release tail.
        fx.clock.set(45);
        fx.engine.tick();
        fx.clock.set(400);
        fx.engine.tick();

        assert_eq!(fx.engine.manager().pending_task_count(), 0);
        assert_eq!(fx.mock.lock().unwrap().live_count(), 0);
    }

    #[test]
    fn test_cyclic_chain_is_skipped_with_log() {
        let mut fx = fixture();
        let mut g = GraphDescription::new();
        let a = g.add_node(NodeKind::Filter(FilterParams::default()));
        let b = g.add_node(NodeKind::Filter(FilterParams::default()));
        let out = g.add_node(NodeKind::Output);
        g.add_edge(a, b);
        g.add_edge(b, a);
        g.add_edge(b, out);

        fx.engine.graph_changed(&g.nodes, &g.edges);
        assert!(fx
            .logger
            .contains(LogLevel::Warn, "extraction failed"));
        assert!(fx.engine.manager().template_ids().is_empty());
        assert!(fx.engine.note_on(440.0, 1.0).is_none());
    }

    #[test]
    fn test_instantiated_voice_mirrors_extracted_chain() {
        let mut fx = fixture();
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

        fx.engine.graph_changed(&g.nodes, &g.edges);
        let voice = fx.engine.note_on(440.0, 1.0).unwrap();

        // Handles come back in template order: generator, filter, envelope.
        let handles: Vec<_> = fx
            .engine
            .manager()
            .voice(voice)
            .unwrap()
            .handles
            .iter()
            .map(|h| h.handle)
            .collect();
        assert_eq!(handles.len(), 3);

        // The built wiring is the original chain minus the end marker and
        // the controller edge, closed off onto the default sink.
        let mock = fx.mock.lock().unwrap();
        assert!(mock.is_connected(handles[0], handles[1]));
        assert!(mock.is_connected(handles[1], handles[2]));
        assert!(mock.is_connected(handles[2], mock.destination()));
        assert_eq!(mock.outgoing(handles[0]), vec![handles[1]]);
        assert_eq!(mock.outgoing(handles[1]), vec![handles[2]]);
    }

    #[test]
    fn test_controller_passthrough() {
        let mut fx = fixture();
        let piano = uuid::Uuid::new_v4();
        let osc = uuid::Uuid::new_v4();
        let (piano_h, osc_h) = {
            let mut mock = fx.mock.lock().unwrap();
            let piano_h = mock.construct(&NodeSpec::Monitor).unwrap();
            let osc_h = mock
                .construct(&NodeSpec::Generator(GeneratorParams::default()))
                .unwrap();
            (piano_h, osc_h)
        };

        {
            let registry = fx.engine.registry();
            let mut registry = registry.lock().unwrap();
            registry.register(piano, piano_h, NodeMetadata::for_kind(&NodeKind::Controller));
            registry.register(
                osc,
                osc_h,
                NodeMetadata::for_kind(&NodeKind::Generator(GeneratorParams::default())),
            );
            registry.connect(piano, osc);
        }

        fx.engine.trigger_controlled(piano, 220.0);
        {
            let mock = fx.mock.lock().unwrap();
            assert_eq!(mock.node(osc_h).unwrap().params.get("frequency"), Some(&220.0));
            assert_eq!(mock.node(osc_h).unwrap().params.get("gain"), Some(&1.0));
        }

        fx.engine.release_controlled(piano);
        assert_eq!(
            fx.mock.lock().unwrap().node(osc_h).unwrap().params.get("gain"),
            Some(&0.0)
        );
    }
}
