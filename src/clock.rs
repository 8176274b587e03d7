//! 注入可能なクロックと遅延タスクのスケジューラ
//!
//! ボイスの減衰待ちはブロッキングスリープではなく、(締め切り, 処理) の
//! 優先度キューで表す。クロックを差し替えることで実時間を使わずに
//! リリースタイミングを検証できる。

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::backend::BackendId;
use crate::voice::VoiceId;

/// ミリ秒単位の単調クロック
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// 実時間クロック
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// 手動で進めるテスト用クロック
#[derive(Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}

/// 遅延ティアダウンの段階
///
/// タスクは発行時点のハンドル一覧を保持する。ボイス本体が先に消えても
/// 再利用されないハンドルに対して安全に実行できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    /// ジェネレーターの停止（無音ランプ完了後）
    StopGenerators,
    /// 非共有ハンドルの切断と破棄
    Dispose,
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub deadline_ms: u64,
    pub voice: VoiceId,
    pub stage: TeardownStage,
    pub handles: Vec<BackendId>,
    seq: u64,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline_ms, self.seq).cmp(&(other.deadline_ms, other.seq))
    }
}

/// (締め切り, 処理) の最小ヒープ。同じ締め切りは発行順
#[derive(Default)]
pub struct TaskScheduler {
    heap: BinaryHeap<Reverse<ScheduledTask>>,
    next_seq: u64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        deadline_ms: u64,
        voice: VoiceId,
        stage: TeardownStage,
        handles: Vec<BackendId>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledTask {
            deadline_ms,
            voice,
            stage,
            handles,
            seq,
        }));
    }

    /// now までに締め切りが来たタスクを締め切り順に取り出す
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(task)| task.deadline_ms <= now_ms)
        {
            if let Some(Reverse(task)) = self.heap.pop() {
                due.push(task);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(task)| task.deadline_ms)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(45);
        assert_eq!(clock.now_ms(), 45);
        clock.set(1000);
        assert_eq!(clock.now_ms(), 1000);
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut scheduler = TaskScheduler::new();
        let v = VoiceId::new();
        scheduler.schedule(300, v, TeardownStage::Dispose, vec![]);
        scheduler.schedule(45, v, TeardownStage::StopGenerators, vec![]);

        assert_eq!(scheduler.next_deadline(), Some(45));
        assert!(scheduler.pop_due(10).is_empty());

        let due = scheduler.pop_due(100);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stage, TeardownStage::StopGenerators);

        let due = scheduler.pop_due(300);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stage, TeardownStage::Dispose);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_equal_deadlines_fire_in_issue_order() {
        let mut scheduler = TaskScheduler::new();
        let a = VoiceId::new();
        let b = VoiceId::new();
        scheduler.schedule(50, a, TeardownStage::Dispose, vec![]);
        scheduler.schedule(50, b, TeardownStage::Dispose, vec![]);

        let due = scheduler.pop_due(50);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].voice, a);
        assert_eq!(due[1].voice, b);
    }
}
