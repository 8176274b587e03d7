/*
 * OrbitalVoice - Polyphonic Voice Engine
 * Copyright (c) 2025 MACHIKO LAB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! External audio library seam
//!
//! The engine never talks to a concrete DSP library directly. Everything
//! goes through the `AudioBackend` trait: construct / connect / start /
//! stop / dispose plus parameter assignment and timed ramps. The backend
//! runs its own real-time context; every call here is fire-and-forget.

use std::collections::HashMap;
use std::fmt;

use crate::nodes::{EnvelopeParams, FilterParams, FilterType, GeneratorParams};

/// バックエンドが割り当てる不透明なノードハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(u64);

impl BackendId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        BackendId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// バックエンドに構築を依頼するノードの仕様
#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    Generator(GeneratorParams),
    Filter(FilterParams),
    Envelope(EnvelopeParams),
    Monitor,
    /// モジュレーション経路用の補助スケーリング段
    Scaler { gain: f32 },
}

/// 外部オーディオライブラリのエラー
#[derive(Debug, Clone)]
pub enum BackendError {
    /// ハンドルが存在しない
    UnknownHandle { id: BackendId },
    /// 既に破棄されたハンドルへの操作
    Disposed { id: BackendId },
    /// 存在しない接続の切断
    NotConnected { source: BackendId, target: BackendId },
    /// ライブラリ内部のエラー
    Library { message: String },
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::UnknownHandle { id } => {
                write!(f, "Unknown backend handle: {}", id)
            }
            BackendError::Disposed { id } => {
                write!(f, "Backend handle already disposed: {}", id)
            }
            BackendError::NotConnected { source, target } => {
                write!(f, "No connection from {} to {}", source, target)
            }
            BackendError::Library { message } => {
                write!(f, "Audio library error: {}", message)
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// 外部オーディオ処理ライブラリの抽象
///
/// `destination()` は常に有効なデフォルトシンク（スピーカー相当）を返す。
pub trait AudioBackend: Send {
    /// ノードを構築し、新しいハンドルを返す
    fn construct(&mut self, spec: &NodeSpec) -> Result<BackendId, BackendError>;

    /// オーディオ接続 source -> target
    fn connect(&mut self, source: BackendId, target: BackendId) -> Result<(), BackendError>;

    /// モジュレーション接続 source -> target の指定パラメーター入力
    fn connect_param(
        &mut self,
        source: BackendId,
        target: BackendId,
        param: &str,
    ) -> Result<(), BackendError>;

    /// 切断。target が None なら全出力を切断
    fn disconnect(
        &mut self,
        source: BackendId,
        target: Option<BackendId>,
    ) -> Result<(), BackendError>;

    /// ソースノードの発音開始
    fn start(&mut self, id: BackendId) -> Result<(), BackendError>;

    /// ソースノードの発音停止
    fn stop(&mut self, id: BackendId) -> Result<(), BackendError>;

    /// ノードの破棄。以後このハンドルは無効
    fn dispose(&mut self, id: BackendId) -> Result<(), BackendError>;

    /// パラメーターへの即時代入
    fn set_param(&mut self, id: BackendId, name: &str, value: f32) -> Result<(), BackendError>;

    /// フィルター種別の切り替え。数値パラメーターとは別経路
    fn set_filter_type(
        &mut self,
        id: BackendId,
        filter_type: FilterType,
    ) -> Result<(), BackendError>;

    /// パラメーターの時間指定ランプ
    fn ramp_param(
        &mut self,
        id: BackendId,
        name: &str,
        target: f32,
        seconds: f32,
    ) -> Result<(), BackendError>;

    /// デフォルトシンク
    fn destination(&self) -> BackendId;
}

/// MockBackend が記録する操作ログのエントリ
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOp {
    Construct(BackendId),
    Connect(BackendId, BackendId),
    ConnectParam(BackendId, BackendId, String),
    Disconnect(BackendId, Option<BackendId>),
    Start(BackendId),
    Stop(BackendId),
    Dispose(BackendId),
    SetParam(BackendId, String, f32),
    SetFilterType(BackendId, FilterType),
    RampParam(BackendId, String, f32, f32),
}

/// モックノードの状態
#[derive(Debug, Clone)]
pub struct MockNode {
    pub spec: NodeSpec,
    pub started: bool,
    pub stopped: bool,
    pub disposed: bool,
    pub params: HashMap<String, f32>,
    /// (param, target, seconds) - 発行されたランプの履歴
    pub ramps: Vec<(String, f32, f32)>,
}

impl MockNode {
    fn new(spec: NodeSpec) -> Self {
        let mut params = HashMap::new();
        match &spec {
            NodeSpec::Filter(p) => {
                params.insert("cutoff".to_string(), p.cutoff);
                params.insert("resonance".to_string(), p.resonance);
            }
            NodeSpec::Scaler { gain } => {
                params.insert("gain".to_string(), *gain);
            }
            _ => {}
        }
        Self {
            spec,
            started: false,
            stopped: false,
            disposed: false,
            params,
            ramps: Vec::new(),
        }
    }
}

/// 記録専用のモックバックエンド
///
/// 実機を鳴らさずに接続グラフとライフサイクルを検証するためのもの。
/// ハンドル 0 は常にデフォルトシンク。ハンドルは再利用されない。
pub struct MockBackend {
    next_id: u64,
    nodes: HashMap<BackendId, MockNode>,
    audio_edges: Vec<(BackendId, BackendId)>,
    param_edges: Vec<(BackendId, BackendId, String)>,
    pub ops: Vec<BackendOp>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            nodes: HashMap::new(),
            audio_edges: Vec::new(),
            param_edges: Vec::new(),
            ops: Vec::new(),
        }
    }

    fn live(&self, id: BackendId) -> Result<(), BackendError> {
        if id == self.destination() {
            return Ok(());
        }
        match self.nodes.get(&id) {
            None => Err(BackendError::UnknownHandle { id }),
            Some(node) if node.disposed => Err(BackendError::Disposed { id }),
            Some(_) => Ok(()),
        }
    }

    pub fn node(&self, id: BackendId) -> Option<&MockNode> {
        self.nodes.get(&id)
    }

    pub fn is_connected(&self, source: BackendId, target: BackendId) -> bool {
        self.audio_edges.contains(&(source, target))
    }

    pub fn is_param_connected(&self, source: BackendId, target: BackendId, param: &str) -> bool {
        self.param_edges
            .iter()
            .any(|(s, t, p)| *s == source && *t == target && p == param)
    }

    /// 破棄されていないノードの数（シンクは数えない）
    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| !n.disposed).count()
    }

    pub fn is_disposed(&self, id: BackendId) -> bool {
        self.nodes.get(&id).map(|n| n.disposed).unwrap_or(false)
    }

    pub fn outgoing(&self, source: BackendId) -> Vec<BackendId> {
        self.audio_edges
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn filter_type_of(&self, id: BackendId) -> Option<FilterType> {
        match self.nodes.get(&id).map(|n| &n.spec) {
            Some(NodeSpec::Filter(p)) => Some(p.filter_type),
            _ => None,
        }
    }

    pub fn op_count(&self, matcher: impl Fn(&BackendOp) -> bool) -> usize {
        self.ops.iter().filter(|op| matcher(op)).count()
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockBackend {
    fn construct(&mut self, spec: &NodeSpec) -> Result<BackendId, BackendError> {
        let id = BackendId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, MockNode::new(spec.clone()));
        self.ops.push(BackendOp::Construct(id));
        Ok(id)
    }

    fn connect(&mut self, source: BackendId, target: BackendId) -> Result<(), BackendError> {
        self.live(source)?;
        self.live(target)?;
        self.ops.push(BackendOp::Connect(source, target));
        if !self.audio_edges.contains(&(source, target)) {
            self.audio_edges.push((source, target));
        }
        Ok(())
    }

    fn connect_param(
        &mut self,
        source: BackendId,
        target: BackendId,
        param: &str,
    ) -> Result<(), BackendError> {
        self.live(source)?;
        self.live(target)?;
        self.ops
            .push(BackendOp::ConnectParam(source, target, param.to_string()));
        self.param_edges.push((source, target, param.to_string()));
        Ok(())
    }

    fn disconnect(
        &mut self,
        source: BackendId,
        target: Option<BackendId>,
    ) -> Result<(), BackendError> {
        self.live(source)?;
        self.ops.push(BackendOp::Disconnect(source, target));
        match target {
            Some(t) => {
                let before = self.audio_edges.len();
                self.audio_edges.retain(|(s, tt)| !(*s == source && *tt == t));
                if self.audio_edges.len() == before {
                    return Err(BackendError::NotConnected { source, target: t });
                }
            }
            None => {
                self.audio_edges.retain(|(s, _)| *s != source);
                self.param_edges.retain(|(s, _, _)| *s != source);
            }
        }
        Ok(())
    }

    fn start(&mut self, id: BackendId) -> Result<(), BackendError> {
        self.live(id)?;
        self.ops.push(BackendOp::Start(id));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.started = true;
        }
        Ok(())
    }

    fn stop(&mut self, id: BackendId) -> Result<(), BackendError> {
        self.live(id)?;
        self.ops.push(BackendOp::Stop(id));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.stopped = true;
        }
        Ok(())
    }

    fn dispose(&mut self, id: BackendId) -> Result<(), BackendError> {
        self.live(id)?;
        self.ops.push(BackendOp::Dispose(id));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.disposed = true;
        }
        // A disposed node drops its remaining edges on both sides.
        self.audio_edges
            .retain(|(s, t)| *s != id && *t != id);
        self.param_edges
            .retain(|(s, t, _)| *s != id && *t != id);
        Ok(())
    }

    fn set_param(&mut self, id: BackendId, name: &str, value: f32) -> Result<(), BackendError> {
        self.live(id)?;
        self.ops
            .push(BackendOp::SetParam(id, name.to_string(), value));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.params.insert(name.to_string(), value);
        }
        Ok(())
    }

    fn set_filter_type(
        &mut self,
        id: BackendId,
        filter_type: FilterType,
    ) -> Result<(), BackendError> {
        self.live(id)?;
        self.ops.push(BackendOp::SetFilterType(id, filter_type));
        match self.nodes.get_mut(&id).map(|n| &mut n.spec) {
            Some(NodeSpec::Filter(p)) => {
                p.filter_type = filter_type;
                Ok(())
            }
            _ => Err(BackendError::Library {
                message: format!("node {} has no filter type", id),
            }),
        }
    }

    fn ramp_param(
        &mut self,
        id: BackendId,
        name: &str,
        target: f32,
        seconds: f32,
    ) -> Result<(), BackendError> {
        self.live(id)?;
        self.ops
            .push(BackendOp::RampParam(id, name.to_string(), target, seconds));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.ramps.push((name.to_string(), target, seconds));
            // The mock settles ramps instantly.
            node.params.insert(name.to_string(), target);
        }
        Ok(())
    }

    fn destination(&self) -> BackendId {
        BackendId(0)
    }
}
