//! ボイス: テンプレート 1 枚を特定の周波数・強度で実体化したもの
//!
//! ジェネレーターとエンベロープは常にボイス専有。フィルター系は
//! キャンバス常駐の共有インスタンスを参照し、参照できない場合だけ
//! 専有インスタンスへフォールバックする。構築・接続の失敗はノード単位で
//! ログして握りつぶし、残りのチェーン構築は続行する。

use std::fmt;

use uuid::Uuid;

use crate::backend::{AudioBackend, BackendId, NodeSpec};
use crate::errors::Logger;
use crate::nodes::{ModulationTarget, NodeClass, NodeKind};
use crate::registry::RoutingRegistry;
use crate::template::VoiceTemplate;
use crate::log_warn;

/// 全ジェネレーター共通のベースデチューン（セント）
const BASE_DETUNE_CENTS: f32 = 3.0;
/// ユニゾン系ジェネレーターのボイス番号ごとの広がり（セント）
const UNISON_SPREAD_CENTS: f32 = 6.0;
/// 強度 0.0 -> -30dB, 1.0 -> 0dB の線形マッピング
const INTENSITY_DB_RANGE: f32 = 30.0;
/// フィルター変調エンベロープのスケール（Hz）
const FILTER_ENV_SCALE_HZ: f32 = 4800.0;
/// ピッチ変調エンベロープのスケール（セント）
const PITCH_ENV_SCALE_CENTS: f32 = 1200.0;

/// ボイスの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(Uuid);

impl VoiceId {
    pub fn new() -> Self {
        VoiceId(Uuid::new_v4())
    }
}

impl Default for VoiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice-{}", self.0)
    }
}

/// Triggered -> Releasing -> (破棄はボイスの消滅で表す)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Triggered,
    Releasing,
}

/// ボイスが保持する 1 ハンドル分のタグ
#[derive(Debug, Clone, Copy)]
pub struct VoiceHandle {
    pub handle: BackendId,
    pub class: NodeClass,
    /// 共有ハンドルはボイス側から絶対に破棄しない
    pub shared: bool,
}

#[derive(Debug)]
pub struct Voice {
    pub template_id: Uuid,
    pub frequency: f32,
    pub intensity: f32,
    pub started_ms: u64,
    pub state: VoiceState,
    pub handles: Vec<VoiceHandle>,
    /// ボイス専有エンベロープ（ゲート操作の対象）
    pub envelopes: Vec<BackendId>,
    /// ボイス専有ジェネレーター（無音ランプと停止の対象）
    pub generators: Vec<BackendId>,
    /// モジュレーション経路の補助スケーラー
    pub scalers: Vec<BackendId>,
    /// テンプレート中の最長リリース（秒）
    pub max_release_secs: f32,
}

struct BuiltNode {
    handle: BackendId,
    modulator: Option<ModulationTarget>,
    scaler: Option<BackendId>,
}

fn intensity_to_gain(intensity: f32) -> f32 {
    let db = INTENSITY_DB_RANGE * (intensity.clamp(0.0, 1.0) - 1.0);
    10f32.powf(db / 20.0)
}

impl Voice {
    /// 破棄対象となる非共有ハンドル（スケーラー込み）
    pub fn private_handles(&self) -> Vec<BackendId> {
        let mut handles: Vec<BackendId> = self
            .handles
            .iter()
            .filter(|h| !h.shared)
            .map(|h| h.handle)
            .collect();
        handles.extend(self.scalers.iter().copied());
        handles
    }

    /// テンプレートをノード順に歩いて実体化する。依存ノードが先に
    /// 存在するよう、配線は必ずテンプレート順に従う。
    #[allow(clippy::too_many_arguments)]
    pub fn instantiate(
        template: &VoiceTemplate,
        frequency: f32,
        intensity: f32,
        voice_index: usize,
        started_ms: u64,
        backend: &mut dyn AudioBackend,
        registry: &RoutingRegistry,
        logger: &dyn Logger,
    ) -> Self {
        let mut voice = Voice {
            template_id: template.id,
            frequency,
            intensity,
            started_ms,
            state: VoiceState::Triggered,
            handles: Vec::new(),
            envelopes: Vec::new(),
            generators: Vec::new(),
            scalers: Vec::new(),
            max_release_secs: 0.0,
        };

        let mut built: Vec<Option<BuiltNode>> = Vec::with_capacity(template.nodes.len());
        for descriptor in &template.nodes {
            let node = match &descriptor.kind {
                NodeKind::Generator(p) => {
                    match backend.construct(&NodeSpec::Generator(p.clone())) {
                        Ok(handle) => {
                            let note = frequency * 2f32.powi(p.octave_offset);
                            let mut detune = BASE_DETUNE_CENTS;
                            if p.unison {
                                detune += UNISON_SPREAD_CENTS * voice_index as f32;
                            }
                            let gain = intensity_to_gain(intensity) * p.gain;
                            let _ = backend.set_param(handle, "frequency", note);
                            let _ = backend.set_param(handle, "detune", detune);
                            let _ = backend.set_param(handle, "gain", gain);
                            if let Err(e) = backend.start(handle) {
                                log_warn!(logger, "voice: generator start failed: {}", e);
                            }
                            voice.generators.push(handle);
                            voice.handles.push(VoiceHandle {
                                handle,
                                class: NodeClass::Generator,
                                shared: false,
                            });
                            Some(BuiltNode {
                                handle,
                                modulator: None,
                                scaler: None,
                            })
                        }
                        Err(e) => {
                            log_warn!(logger, "voice: generator construct failed: {}", e);
                            None
                        }
                    }
                }
                NodeKind::Filter(_) | NodeKind::Monitor => {
                    let class = descriptor.kind.class().unwrap_or(NodeClass::Filter);
                    let shared_handle = descriptor
                        .shared_node
                        .and_then(|id| registry.handle_of(id));
                    let (handle, shared) = match shared_handle {
                        Some(handle) => (Some(handle), true),
                        None => {
                            // Canvas instance unavailable, fall back to a
                            // private copy built from the snapshot.
                            match descriptor.kind.to_spec() {
                                Some(spec) => match backend.construct(&spec) {
                                    Ok(handle) => (Some(handle), false),
                                    Err(e) => {
                                        log_warn!(logger, "voice: construct failed: {}", e);
                                        (None, false)
                                    }
                                },
                                None => (None, false),
                            }
                        }
                    };
                    handle.map(|handle| {
                        voice.handles.push(VoiceHandle {
                            handle,
                            class,
                            shared,
                        });
                        BuiltNode {
                            handle,
                            modulator: None,
                            scaler: None,
                        }
                    })
                }
                NodeKind::Envelope(p) => {
                    match backend.construct(&NodeSpec::Envelope(p.clone())) {
                        Ok(handle) => {
                            voice.envelopes.push(handle);
                            voice.max_release_secs = voice.max_release_secs.max(p.release);
                            voice.handles.push(VoiceHandle {
                                handle,
                                class: NodeClass::Envelope,
                                shared: false,
                            });
                            let (modulator, scaler) = match p.target {
                                ModulationTarget::Volume => (None, None),
                                target => {
                                    let gain = p.amount
                                        * match target {
                                            ModulationTarget::Filter => FILTER_ENV_SCALE_HZ,
                                            _ => PITCH_ENV_SCALE_CENTS,
                                        };
                                    match backend.construct(&NodeSpec::Scaler { gain }) {
                                        Ok(scaler) => {
                                            if let Err(e) = backend.connect(handle, scaler) {
                                                log_warn!(
                                                    logger,
                                                    "voice: envelope -> scaler failed: {}",
                                                    e
                                                );
                                            }
                                            voice.scalers.push(scaler);
                                            (Some(target), Some(scaler))
                                        }
                                        Err(e) => {
                                            log_warn!(
                                                logger,
                                                "voice: scaler construct failed: {}",
                                                e
                                            );
                                            (Some(target), None)
                                        }
                                    }
                                }
                            };
                            Some(BuiltNode {
                                handle,
                                modulator,
                                scaler,
                            })
                        }
                        Err(e) => {
                            log_warn!(logger, "voice: envelope construct failed: {}", e);
                            None
                        }
                    }
                }
                NodeKind::Controller | NodeKind::Output => {
                    // The extractor never emits these; skip defensively.
                    None
                }
            };
            built.push(node);
        }

        // Realize template edges. Modulator envelopes route through their
        // scaler into the target parameter instead of the audio path.
        for edge in &template.edges {
            let from = built.get(edge.from).and_then(|n| n.as_ref());
            let to = built.get(edge.to).and_then(|n| n.as_ref());
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };
            match from.modulator {
                Some(target) => {
                    let param = match target {
                        ModulationTarget::Filter => "cutoff",
                        _ => "detune",
                    };
                    if let Some(scaler) = from.scaler {
                        if let Err(e) = backend.connect_param(scaler, to.handle, param) {
                            log_warn!(logger, "voice: modulation connect failed: {}", e);
                        }
                    }
                }
                None => {
                    if let Err(e) = backend.connect(from.handle, to.handle) {
                        log_warn!(logger, "voice: connect failed: {}", e);
                    }
                }
            }
        }

        // Every private envelope gets its attack trigger.
        for &envelope in &voice.envelopes {
            let _ = backend.set_param(envelope, "gate", 1.0);
        }

        // Terminal connection, unless the chain ends in a modulator
        // envelope that produces no audio.
        if let Some(last) = built.iter().rev().flatten().next() {
            if last.modulator.is_none() {
                let sink = backend.destination();
                if let Err(e) = backend.connect(last.handle, sink) {
                    log_warn!(logger, "voice: output connect failed: {}", e);
                }
            }
        }

        voice
    }
}
