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

//! Voice Manager - polyphony ceiling and deferred teardown
//!
//! 同時発音はボイス上限で抑え、上限到達時は最も古いボイスを奪う。
//! リリースはブロックしない: ボイスは即座にアクティブ集合から外れ、
//! 実際のノード停止・破棄は減衰の長さに合わせた締め切りタスクとして
//! スケジューラに積まれる。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::clock::{Clock, TaskScheduler, TeardownStage};
use crate::errors::Logger;
use crate::nodes::{FilterType, NodeClass};
use crate::registry::{RoutingRegistry, SharedBackend};
use crate::template::VoiceTemplate;
use crate::voice::{Voice, VoiceId, VoiceState};
use crate::log_warn;

/// デフォルトの同時発音上限
pub const DEFAULT_MAX_VOICES: usize = 16;
/// リリース時にジェネレーターを無音へ落とすランプ（秒）
const GENERATOR_FADE_SECS: f32 = 0.020;
/// 無音ランプ完了後、ジェネレーターを停止するまでの猶予（ミリ秒）
const GENERATOR_STOP_MS: u64 = 45;
/// 最長リリースに上乗せする破棄マージン（ミリ秒）
const CLEANUP_MARGIN_MS: u64 = 100;
/// 破棄締め切りの下限。停止段より必ず後に来る（ミリ秒）
const CLEANUP_FLOOR_MS: u64 = 50;

/// テンプレートからボイスを起こし、寿命を管理する
pub struct VoiceManager {
    backend: SharedBackend,
    registry: Arc<Mutex<RoutingRegistry>>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    templates: HashMap<Uuid, VoiceTemplate>,
    voices: HashMap<VoiceId, Voice>,
    /// 解放済みでまだ破棄タスクが残っているボイス
    releasing: HashMap<VoiceId, Voice>,
    scheduler: TaskScheduler,
    max_voices: usize,
}

impl VoiceManager {
    pub fn new(
        backend: SharedBackend,
        registry: Arc<Mutex<RoutingRegistry>>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self::with_max_voices(backend, registry, clock, logger, DEFAULT_MAX_VOICES)
    }

    pub fn with_max_voices(
        backend: SharedBackend,
        registry: Arc<Mutex<RoutingRegistry>>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
        max_voices: usize,
    ) -> Self {
        Self {
            backend,
            registry,
            clock,
            logger,
            templates: HashMap::new(),
            voices: HashMap::new(),
            releasing: HashMap::new(),
            scheduler: TaskScheduler::new(),
            max_voices: max_voices.max(1),
        }
    }

    /// テンプレートを登録する。同じ終端マーカーのものは丸ごと置き換え。
    /// 既に鳴っているボイスは古い設計図のまま寿命を全うする。
    pub fn register_template(&mut self, template: VoiceTemplate) {
        self.templates.insert(template.id, template);
    }

    /// テンプレートを破棄し、それに紐づくボイスを即時停止する
    pub fn unregister_template(&mut self, id: Uuid) {
        if self.templates.remove(&id).is_none() {
            return;
        }
        let bound: Vec<VoiceId> = self
            .voices
            .iter()
            .filter(|(_, v)| v.template_id == id)
            .map(|(vid, _)| *vid)
            .collect();
        for voice_id in bound {
            self.force_stop_voice(voice_id);
        }
    }

    pub fn has_template(&self, id: Uuid) -> bool {
        self.templates.contains_key(&id)
    }

    pub fn template_ids(&self) -> Vec<Uuid> {
        self.templates.keys().copied().collect()
    }

    /// ボイスを起こす。上限に達している間は最も古いボイスを奪う。
    pub fn start_voice(
        &mut self,
        template_id: Uuid,
        frequency: f32,
        intensity: f32,
    ) -> Option<VoiceId> {
        if !self.templates.contains_key(&template_id) {
            log_warn!(self.logger, "start_voice: unknown template {}", template_id);
            return None;
        }

        while self.voices.len() >= self.max_voices {
            if !self.steal_oldest_voice() {
                break;
            }
        }

        let template = self.templates.get(&template_id)?;
        let voice_index = self.voices.len();
        let started_ms = self.clock.now_ms();

        let Ok(registry) = self.registry.lock() else {
            self.logger.error("start_voice: registry mutex poisoned");
            return None;
        };
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("start_voice: backend mutex poisoned");
            return None;
        };
        let voice = Voice::instantiate(
            template,
            frequency,
            intensity,
            voice_index,
            started_ms,
            &mut *backend,
            &registry,
            self.logger.as_ref(),
        );
        drop(backend);
        drop(registry);

        let voice_id = VoiceId::new();
        self.voices.insert(voice_id, voice);
        Some(voice_id)
    }

    /// ボイスを解放する。アクティブ集合からは即座に外れてリリース中
    /// 集合へ移り、停止と破棄は締め切りタスクとして後から実行される。
    /// 破棄タスクが走った時点でリリース中集合からも消える。
    pub fn stop_voice(&mut self, voice_id: VoiceId) {
        let Some(mut voice) = self.voices.remove(&voice_id) else {
            log_warn!(self.logger, "stop_voice: unknown voice {}", voice_id);
            return;
        };
        voice.state = VoiceState::Releasing;

        {
            let Ok(mut backend) = self.backend.lock() else {
                self.logger.error("stop_voice: backend mutex poisoned");
                return;
            };
            for &envelope in &voice.envelopes {
                let _ = backend.set_param(envelope, "gate", 0.0);
            }
            for &generator in &voice.generators {
                let _ = backend.ramp_param(generator, "gain", 0.0, GENERATOR_FADE_SECS);
            }
        }

        let now = self.clock.now_ms();
        self.scheduler.schedule(
            now + GENERATOR_STOP_MS,
            voice_id,
            TeardownStage::StopGenerators,
            voice.generators.clone(),
        );

        // エンベロープがあれば最長リリースが鳴り終わるまで破棄を遅らせる。
        // 下限は停止段より後ろに固定し、順序が入れ替わらないようにする。
        let cleanup_ms = if voice.envelopes.is_empty() {
            0
        } else {
            (voice.max_release_secs * 1000.0) as u64 + CLEANUP_MARGIN_MS
        }
        .max(CLEANUP_FLOOR_MS);
        self.scheduler.schedule(
            now + cleanup_ms,
            voice_id,
            TeardownStage::Dispose,
            voice.private_handles(),
        );
        self.releasing.insert(voice_id, voice);
    }

    /// 即時ティアダウン。スケジューラを経由せず停止・破棄まで行う
    fn force_stop_voice(&mut self, voice_id: VoiceId) {
        let Some(voice) = self.voices.remove(&voice_id) else {
            return;
        };
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("force_stop_voice: backend mutex poisoned");
            return;
        };
        for &generator in &voice.generators {
            let _ = backend.stop(generator);
        }
        for handle in voice.private_handles() {
            let _ = backend.disconnect(handle, None);
            let _ = backend.dispose(handle);
        }
    }

    /// 最も古いボイス（started_ms 最小）を通常の解放経路で奪う
    fn steal_oldest_voice(&mut self) -> bool {
        let Some(oldest) = self
            .voices
            .iter()
            .min_by_key(|(_, v)| v.started_ms)
            .map(|(id, _)| *id)
        else {
            return false;
        };
        log_warn!(self.logger, "voice ceiling reached, stealing {}", oldest);
        self.stop_voice(oldest);
        true
    }

    pub fn stop_all_voices(&mut self) {
        let ids: Vec<VoiceId> = self.voices.keys().copied().collect();
        for id in ids {
            self.stop_voice(id);
        }
    }

    /// あるテンプレートのアクティブボイス全てに、ボイス専有ノードへの
    /// ライブパラメーター反映を行う。共有ハンドルはキャンバス側の反映で
    /// 済んでいるため触らない。
    pub fn update_active_voice_parameter(
        &mut self,
        template_id: Uuid,
        class: NodeClass,
        name: &str,
        value: f32,
    ) {
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("update_active_voice_parameter: backend mutex poisoned");
            return;
        };
        for voice in self.voices.values() {
            if voice.template_id != template_id {
                continue;
            }
            for handle in &voice.handles {
                if handle.shared || handle.class != class {
                    continue;
                }
                if let Err(e) = backend.set_param(handle.handle, name, value) {
                    log_warn!(
                        self.logger,
                        "update_active_voice_parameter: {} on {} failed: {}",
                        name,
                        handle.handle,
                        e
                    );
                }
            }
        }
    }

    /// アクティブボイスの専有フィルターに種別変更を反映する。共有
    /// フィルターはレジストリの `set_node_filter_type` 経由で切り替わる。
    pub fn update_active_voice_filter_type(&mut self, template_id: Uuid, filter_type: FilterType) {
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("update_active_voice_filter_type: backend mutex poisoned");
            return;
        };
        for voice in self.voices.values() {
            if voice.template_id != template_id {
                continue;
            }
            for handle in &voice.handles {
                if handle.shared || handle.class != NodeClass::Filter {
                    continue;
                }
                if let Err(e) = backend.set_filter_type(handle.handle, filter_type) {
                    log_warn!(
                        self.logger,
                        "update_active_voice_filter_type on {} failed: {}",
                        handle.handle,
                        e
                    );
                }
            }
        }
    }

    /// 締め切りが来たティアダウンタスクを実行する。呼び出し側が定期的に
    /// 回すこと。ハンドルはタスク発行時のスナップショットなので、既に
    /// 消えたノードへの操作は黙って失敗する。
    pub fn process_due_tasks(&mut self) {
        let now = self.clock.now_ms();
        let due = self.scheduler.pop_due(now);
        if due.is_empty() {
            return;
        }
        let Ok(mut backend) = self.backend.lock() else {
            self.logger.error("process_due_tasks: backend mutex poisoned");
            return;
        };
        for task in due {
            match task.stage {
                TeardownStage::StopGenerators => {
                    for &handle in &task.handles {
                        let _ = backend.stop(handle);
                    }
                }
                TeardownStage::Dispose => {
                    for &handle in &task.handles {
                        let _ = backend.disconnect(handle, None);
                        let _ = backend.dispose(handle);
                    }
                    self.releasing.remove(&task.voice);
                }
            }
        }
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn releasing_voice_count(&self) -> usize {
        self.releasing.len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.scheduler.len()
    }

    pub fn voice(&self, id: VoiceId) -> Option<&Voice> {
        self.voices.get(&id)
    }

    /// 減衰中でまだ破棄されていないボイス
    pub fn releasing_voice(&self, id: VoiceId) -> Option<&Voice> {
        self.releasing.get(&id)
    }
}
