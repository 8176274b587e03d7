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

//! Signal Routing Registry
//!
//! キャンバス常駐ノードとそのライブ接続を管理する。オーディオ接続とは
//! 別にコントローラー用のトリガー接続レイヤーを持つ。すべての操作は
//! ベストエフォート: 未知の ID は警告ログを出して何もしない。ライブ編集中
//! に UI とオーディオ状態が一時的にずれるのは仕様。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{AudioBackend, BackendId};
use crate::errors::Logger;
use crate::nodes::{FilterType, NodeKind};
use crate::{log_info, log_warn};

/// 直接コントロール経路のゲート立ち上がり時間
const CONTROL_ATTACK_SECS: f32 = 0.015;
/// 直接コントロール経路のゲート解放時間
const CONTROL_RELEASE_SECS: f32 = 0.25;

pub type SharedBackend = Arc<Mutex<dyn AudioBackend>>;

/// 登録時に固定されるロールフラグ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub is_controller: bool,
    pub is_output_marker: bool,
    pub is_monitor: bool,
    /// unregister 時に stop が必要か
    pub is_source: bool,
}

impl NodeMetadata {
    pub fn for_kind(kind: &NodeKind) -> Self {
        Self {
            is_controller: kind.is_controller(),
            is_output_marker: kind.is_output(),
            is_monitor: matches!(kind, NodeKind::Monitor),
            is_source: matches!(kind, NodeKind::Generator(_)),
        }
    }
}

/// ノード ID -> バックエンドハンドルの対応と接続状態を持つレジストリ
pub struct RoutingRegistry {
    backend: SharedBackend,
    logger: Arc<dyn Logger>,
    handles: HashMap<Uuid, BackendId>,
    metadata: HashMap<Uuid, NodeMetadata>,
    /// ソースごとのオーディオ接続先（順序なし）
    connections: HashMap<Uuid, HashSet<Uuid>>,
    /// コントローラーごとのトリガー接続先（順序あり）
    control: HashMap<Uuid, Vec<Uuid>>,
}

impl RoutingRegistry {
    pub fn new(backend: SharedBackend, logger: Arc<dyn Logger>) -> Self {
        Self {
            backend,
            logger,
            handles: HashMap::new(),
            metadata: HashMap::new(),
            connections: HashMap::new(),
            control: HashMap::new(),
        }
    }

    /// ノードを登録する。再登録は何もしない（冪等）。
    ///
    /// コントローラー以外は空の ConnectionSet がデフォルトシンクに
    /// 接続されている、という不変条件をここで成立させる。
    pub fn register(&mut self, id: Uuid, handle: BackendId, metadata: NodeMetadata) {
        if self.handles.contains_key(&id) {
            return;
        }

        self.handles.insert(id, handle);
        self.metadata.insert(id, metadata);
        self.connections.insert(id, HashSet::new());
        if metadata.is_controller {
            self.control.insert(id, Vec::new());
        } else {
            let Ok(mut backend) = self.backend.lock() else {
                self.logger.error("register: backend mutex poisoned");
                return;
            };
            let sink = backend.destination();
            if let Err(e) = backend.connect(handle, sink) {
                log_warn!(self.logger, "register: default sink connect failed: {}", e);
            }
        }
    }

    /// ノードを登録解除する。切断 -> ソースなら停止 -> 破棄の順で
    /// 片付け、他ノードの ConnectionSet / ControlConnectionList からも
    /// 参照を一掃する。二重呼び出しは安全な no-op。
    pub fn unregister(&mut self, id: Uuid) {
        let Some(handle) = self.handles.remove(&id) else {
            log_warn!(self.logger, "unregister: unknown node {}", id);
            return;
        };
        let metadata = self.metadata.remove(&id).unwrap_or_default();

        // Purge this node from every other node's audio connections first.
        let owners: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|(owner, set)| **owner != id && set.contains(&id))
            .map(|(owner, _)| *owner)
            .collect();

        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("unregister: backend mutex poisoned");
            return;
        };
        let sink = backend.destination();
        for owner in owners {
            let Some(&owner_handle) = self.handles.get(&owner) else {
                continue;
            };
            let _ = backend.disconnect(owner_handle, Some(handle));
            if let Some(set) = self.connections.get_mut(&owner) {
                set.remove(&id);
                if set.is_empty() {
                    if let Err(e) = backend.connect(owner_handle, sink) {
                        log_warn!(self.logger, "unregister: sink restore failed: {}", e);
                    }
                }
            }
        }

        // And from every controller's trigger list.
        for list in self.control.values_mut() {
            list.retain(|t| *t != id);
        }

        let _ = backend.disconnect(handle, None);
        if metadata.is_source {
            let _ = backend.stop(handle);
        }
        if let Err(e) = backend.dispose(handle) {
            log_warn!(self.logger, "unregister: dispose failed for {}: {}", id, e);
        }
        drop(backend);

        self.connections.remove(&id);
        self.control.remove(&id);
        log_info!(self.logger, "unregistered node {}", id);
    }

    /// 接続を張る。コントローラーがソースの場合はトリガー接続として
    /// 記録するだけで、オーディオ配線は行わない。
    pub fn connect(&mut self, source: Uuid, target: Uuid) {
        let (Some(&source_handle), Some(&target_handle)) =
            (self.handles.get(&source), self.handles.get(&target))
        else {
            log_warn!(self.logger, "connect: unknown node {} -> {}", source, target);
            return;
        };

        if self.metadata.get(&source).is_some_and(|m| m.is_controller) {
            if let Some(list) = self.control.get_mut(&source) {
                if !list.contains(&target) {
                    list.push(target);
                }
            }
            return;
        }

        let Some(set) = self.connections.get_mut(&source) else {
            return;
        };
        if set.contains(&target) {
            return;
        }

        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("connect: backend mutex poisoned");
            return;
        };
        let sink = backend.destination();
        if set.is_empty() {
            // Leaving the default sink; a failure here is harmless.
            let _ = backend.disconnect(source_handle, Some(sink));
        }
        match backend.connect(source_handle, target_handle) {
            Ok(()) => {
                set.insert(target);
            }
            Err(e) => {
                log_warn!(self.logger, "connect {} -> {} failed: {}", source, target, e);
                if set.is_empty() {
                    let _ = backend.connect(source_handle, sink);
                }
            }
        }
    }

    /// 接続を外す。target を省略すると全切断。ConnectionSet が空に
    /// なったらデフォルトシンクへの接続を復元する。
    pub fn disconnect(&mut self, source: Uuid, target: Option<Uuid>) {
        let Some(&source_handle) = self.handles.get(&source) else {
            log_warn!(self.logger, "disconnect: unknown node {}", source);
            return;
        };

        if self.metadata.get(&source).is_some_and(|m| m.is_controller) {
            if let Some(list) = self.control.get_mut(&source) {
                match target {
                    Some(t) => list.retain(|x| *x != t),
                    None => list.clear(),
                }
            }
            return;
        }

        let Some(set) = self.connections.get_mut(&source) else {
            return;
        };
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("disconnect: backend mutex poisoned");
            return;
        };

        let sink = backend.destination();
        match target {
            Some(t) => {
                if !set.remove(&t) {
                    log_warn!(self.logger, "disconnect: {} not connected to {}", source, t);
                    return;
                }
                if let Some(&target_handle) = self.handles.get(&t) {
                    let _ = backend.disconnect(source_handle, Some(target_handle));
                }
                if set.is_empty() {
                    if let Err(e) = backend.connect(source_handle, sink) {
                        log_warn!(self.logger, "disconnect: sink restore failed: {}", e);
                    }
                }
            }
            None => {
                set.clear();
                let _ = backend.disconnect(source_handle, None);
                if let Err(e) = backend.connect(source_handle, sink) {
                    log_warn!(self.logger, "disconnect: sink restore failed: {}", e);
                }
            }
        }
    }

    /// 望ましいエッジ集合との差分だけ connect / disconnect を発行する
    pub fn sync_connections(&mut self, desired: &[(Uuid, Uuid)]) {
        let mut desired_audio: HashSet<(Uuid, Uuid)> = HashSet::new();
        let mut desired_control: HashSet<(Uuid, Uuid)> = HashSet::new();
        for &(s, t) in desired {
            if self.metadata.get(&s).is_some_and(|m| m.is_controller) {
                desired_control.insert((s, t));
            } else {
                desired_audio.insert((s, t));
            }
        }

        let current_audio: Vec<(Uuid, Uuid)> = self
            .connections
            .iter()
            .flat_map(|(s, set)| set.iter().map(|t| (*s, *t)))
            .collect();
        let current_control: Vec<(Uuid, Uuid)> = self
            .control
            .iter()
            .flat_map(|(s, list)| list.iter().map(|t| (*s, *t)))
            .collect();

        for (s, t) in &current_audio {
            if !desired_audio.contains(&(*s, *t)) {
                self.disconnect(*s, Some(*t));
            }
        }
        for (s, t) in &current_control {
            if !desired_control.contains(&(*s, *t)) {
                self.disconnect(*s, Some(*t));
            }
        }

        let current_audio: HashSet<(Uuid, Uuid)> = current_audio.into_iter().collect();
        let current_control: HashSet<(Uuid, Uuid)> = current_control.into_iter().collect();
        for (s, t) in desired_audio {
            if !current_audio.contains(&(s, t)) {
                self.connect(s, t);
            }
        }
        for (s, t) in desired_control {
            if !current_control.contains(&(s, t)) {
                self.connect(s, t);
            }
        }
    }

    /// コントローラーのトリガー接続先を宣言順に返す
    pub fn get_controlled_nodes(&self, controller: Uuid) -> Vec<Uuid> {
        self.control.get(&controller).cloned().unwrap_or_default()
    }

    /// 直接コントロール経路: 周波数を設定し、レベルを立ち上げる。
    /// テンプレート経由のボイスとは独立した、常時キャンバス演奏用。
    pub fn trigger_controlled_nodes(&mut self, controller: Uuid, frequency: f32) {
        let targets = self.get_controlled_nodes(controller);
        if targets.is_empty() && !self.control.contains_key(&controller) {
            log_warn!(self.logger, "trigger: unknown controller {}", controller);
            return;
        }
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("trigger: backend mutex poisoned");
            return;
        };
        for target in targets {
            let Some(&handle) = self.handles.get(&target) else {
                continue;
            };
            if let Err(e) = backend.set_param(handle, "frequency", frequency) {
                log_warn!(self.logger, "trigger: set frequency on {} failed: {}", target, e);
            }
            let _ = backend.ramp_param(handle, "gain", 1.0, CONTROL_ATTACK_SECS);
        }
    }

    /// 直接コントロール経路の解放: レベルをゼロへ戻す
    pub fn release_controlled_nodes(&mut self, controller: Uuid) {
        let targets = self.get_controlled_nodes(controller);
        if targets.is_empty() && !self.control.contains_key(&controller) {
            log_warn!(self.logger, "release: unknown controller {}", controller);
            return;
        }
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("release: backend mutex poisoned");
            return;
        };
        for target in targets {
            if let Some(&handle) = self.handles.get(&target) {
                let _ = backend.ramp_param(handle, "gain", 0.0, CONTROL_RELEASE_SECS);
            }
        }
    }

    /// 共有キャンバスノードへのライブパラメーター反映
    pub fn set_node_param(&mut self, id: Uuid, name: &str, value: f32) {
        let Some(&handle) = self.handles.get(&id) else {
            log_warn!(self.logger, "set_node_param: unknown node {}", id);
            return;
        };
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("set_node_param: backend mutex poisoned");
            return;
        };
        if let Err(e) = backend.set_param(handle, name, value) {
            log_warn!(self.logger, "set_node_param {} on {} failed: {}", name, id, e);
        }
    }

    /// 共有キャンバスフィルターの種別切り替え
    pub fn set_node_filter_type(&mut self, id: Uuid, filter_type: FilterType) {
        let Some(&handle) = self.handles.get(&id) else {
            log_warn!(self.logger, "set_node_filter_type: unknown node {}", id);
            return;
        };
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("set_node_filter_type: backend mutex poisoned");
            return;
        };
        if let Err(e) = backend.set_filter_type(handle, filter_type) {
            log_warn!(self.logger, "set_node_filter_type on {} failed: {}", id, e);
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn handle_of(&self, id: Uuid) -> Option<BackendId> {
        self.handles.get(&id).copied()
    }

    pub fn metadata_of(&self, id: Uuid) -> Option<NodeMetadata> {
        self.metadata.get(&id).copied()
    }

    pub fn connections_of(&self, id: Uuid) -> Option<&HashSet<Uuid>> {
        self.connections.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.handles.len()
    }
}
