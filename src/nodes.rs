//! ノード種別モデル
//!
//! エディタ上のブロックを閉じたタグ付きユニオンで表す。種類ごとの
//! パラメーター構造体は抽出時に値でスナップショットされ、テンプレートに
//! そのまま埋め込まれる。

use serde::{Deserialize, Serialize};

use crate::backend::NodeSpec;

/// ジェネレーターの波形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
    Pulse,
}

/// フィルターの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
}

/// エンベロープの変調先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulationTarget {
    /// ボイスのオーディオ経路に直接入る
    Volume,
    /// フィルターのカットオフを変調する
    Filter,
    /// ピッチ（デチューン）を変調する
    Pitch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorParams {
    pub waveform: Waveform,
    /// 発音周波数に 2^octave_offset を掛ける
    pub octave_offset: i32,
    /// ユニゾン系ジェネレーターはボイスごとにデチューンを広げる
    pub unison: bool,
    pub gain: f32,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sawtooth,
            octave_offset: 0,
            unison: false,
            gain: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub filter_type: FilterType,
    pub cutoff: f32,
    pub resonance: f32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            filter_type: FilterType::Lowpass,
            cutoff: 2000.0,
            resonance: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
    /// モジュレーター用の深さ（Volume ターゲットでは未使用）
    pub amount: f32,
    pub target: ModulationTarget,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.3,
            amount: 1.0,
            target: ModulationTarget::Volume,
        }
    }
}

/// グラフ上のノード種別
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Generator(GeneratorParams),
    Filter(FilterParams),
    Envelope(EnvelopeParams),
    /// キャンバス常駐のパススルーモニター（スコープ等）
    Monitor,
    /// トリガー専用ノード。オーディオ経路には入らない
    Controller,
    /// ボイステンプレート抽出の終端マーカー
    Output,
}

/// ライブパラメーター伝搬で使う粗い分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeClass {
    Generator,
    Filter,
    Envelope,
    Monitor,
}

impl NodeKind {
    pub fn class(&self) -> Option<NodeClass> {
        match self {
            NodeKind::Generator(_) => Some(NodeClass::Generator),
            NodeKind::Filter(_) => Some(NodeClass::Filter),
            NodeKind::Envelope(_) => Some(NodeClass::Envelope),
            NodeKind::Monitor => Some(NodeClass::Monitor),
            NodeKind::Controller | NodeKind::Output => None,
        }
    }

    pub fn is_controller(&self) -> bool {
        matches!(self, NodeKind::Controller)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, NodeKind::Output)
    }

    /// ボイスごとに構築可能な種別はバックエンド仕様に変換できる
    pub fn to_spec(&self) -> Option<NodeSpec> {
        match self {
            NodeKind::Generator(p) => Some(NodeSpec::Generator(p.clone())),
            NodeKind::Filter(p) => Some(NodeSpec::Filter(p.clone())),
            NodeKind::Envelope(p) => Some(NodeSpec::Envelope(p.clone())),
            NodeKind::Monitor => Some(NodeSpec::Monitor),
            NodeKind::Controller | NodeKind::Output => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            NodeKind::Generator(GeneratorParams::default()).class(),
            Some(NodeClass::Generator)
        );
        assert_eq!(NodeKind::Controller.class(), None);
        assert_eq!(NodeKind::Output.class(), None);
        assert!(NodeKind::Controller.is_controller());
        assert!(NodeKind::Output.is_output());
    }

    #[test]
    fn test_non_instantiable_kinds() {
        assert!(NodeKind::Controller.to_spec().is_none());
        assert!(NodeKind::Output.to_spec().is_none());
        assert!(NodeKind::Monitor.to_spec().is_some());
    }

    #[test]
    fn test_kind_serde_round_trip() {
        let kind = NodeKind::Envelope(EnvelopeParams {
            attack: 0.02,
            decay: 0.2,
            sustain: 0.5,
            release: 1.5,
            amount: 0.8,
            target: ModulationTarget::Filter,
        });

        let json = serde_json::to_string(&kind).unwrap();
        let back: NodeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, back);
    }
}
