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

use std::fmt;
use std::sync::Mutex;

use uuid::Uuid;

use crate::backend::BackendError;

/// OrbitalVoice全体のエラー型
#[derive(Debug, Clone)]
pub enum VoiceEngineError {
    /// ノードが見つからない
    NodeNotFound { id: Uuid },

    /// テンプレートが見つからない
    TemplateNotFound { id: Uuid },

    /// ボイスが見つからない
    VoiceNotFound { id: Uuid },

    /// 外部オーディオライブラリのエラー
    Backend { operation: String, error: BackendError },

    /// 抽出対象のサブグラフに循環がある
    CyclicGraph { nodes: Vec<Uuid> },

    /// 内部エラー（予期しない状況）
    Internal { message: String },
}

impl fmt::Display for VoiceEngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceEngineError::NodeNotFound { id } => {
                write!(f, "Node not found: {}", id)
            }
            VoiceEngineError::TemplateNotFound { id } => {
                write!(f, "Voice template not found: {}", id)
            }
            VoiceEngineError::VoiceNotFound { id } => {
                write!(f, "Voice not found: {}", id)
            }
            VoiceEngineError::Backend { operation, error } => {
                write!(f, "Audio backend error during {}: {}", operation, error)
            }
            VoiceEngineError::CyclicGraph { nodes } => {
                write!(f, "Cyclic signal graph, unorderable nodes: {:?}", nodes)
            }
            VoiceEngineError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for VoiceEngineError {}

impl From<BackendError> for VoiceEngineError {
    fn from(error: BackendError) -> Self {
        VoiceEngineError::Backend {
            operation: "unknown".to_string(),
            error,
        }
    }
}

/// 結果型のエイリアス
pub type VoiceEngineResult<T> = Result<T, VoiceEngineError>;

/// カスタムエラー作成のヘルパー
impl VoiceEngineError {
    pub fn node_not_found(id: Uuid) -> Self {
        VoiceEngineError::NodeNotFound { id }
    }

    pub fn template_not_found(id: Uuid) -> Self {
        VoiceEngineError::TemplateNotFound { id }
    }

    pub fn backend(operation: &str, error: BackendError) -> Self {
        VoiceEngineError::Backend {
            operation: operation.to_string(),
            error,
        }
    }

    pub fn internal(message: &str) -> Self {
        VoiceEngineError::Internal {
            message: message.to_string(),
        }
    }
}

/// エラーログのレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// ロギングトレイト
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// シンプルなコンソールロガー
pub struct ConsoleLogger {
    min_level: LogLevel,
}

impl ConsoleLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if level >= self.min_level {
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();

            println!(
                "[{:.3}] [{}] {}",
                timestamp.as_secs_f64(),
                level,
                message
            );
        }
    }
}

/// メッセージを蓄積するロガー - テストでログ出力を検証するために使用
#[derive(Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn contains(&self, level: LogLevel, fragment: &str) -> bool {
        self.entries()
            .iter()
            .any(|(l, m)| *l == level && m.contains(fragment))
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, message.to_string()));
        }
    }
}

/// エラーハンドリングのヘルパーマクロ
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $error:expr) => {
        $logger.error(&format!("Error: {}", $error));
    };
    ($logger:expr, $error:expr, $context:expr) => {
        $logger.error(&format!("Error in {}: {}", $context, $error));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $message:expr) => {
        $logger.warn($message);
    };
    ($logger:expr, $format:expr, $($args:expr),*) => {
        $logger.warn(&format!($format, $($args),*));
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $message:expr) => {
        $logger.info($message);
    };
    ($logger:expr, $format:expr, $($args:expr),*) => {
        $logger.info(&format!($format, $($args),*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::new_v4();
        let error = VoiceEngineError::node_not_found(id);
        assert!(error.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_backend_error_conversion() {
        let backend_error = BackendError::UnknownHandle {
            id: crate::backend::BackendId::from_raw(42),
        };
        let engine_error: VoiceEngineError = backend_error.into();

        match engine_error {
            VoiceEngineError::Backend { .. } => (),
            _ => panic!("Expected Backend error variant"),
        }
    }

    #[test]
    fn test_memory_logger() {
        let logger = MemoryLogger::new();
        logger.warn("node missing");
        logger.info("voice started");

        assert!(logger.contains(LogLevel::Warn, "node missing"));
        assert!(logger.contains(LogLevel::Info, "voice started"));
        assert!(!logger.contains(LogLevel::Error, "node missing"));

        logger.clear();
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn test_console_logger_level_filter() {
        let logger = ConsoleLogger::new(LogLevel::Warn);

        // These should not output (below min level)
        logger.debug("debug message");
        logger.info("info message");

        // These should output
        logger.warn("warn message");
        logger.error("error message");
    }
}
