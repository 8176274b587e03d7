pub mod backend;
pub mod clock;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod manager;
pub mod nodes;
pub mod registry;
pub mod template;
pub mod voice;

pub use backend::{AudioBackend, BackendError, BackendId, MockBackend, NodeSpec};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::VoiceEngine;
pub use errors::{ConsoleLogger, LogLevel, Logger, VoiceEngineError, VoiceEngineResult};
pub use graph::{GraphDescription, GraphEdge, GraphNode};
pub use manager::{VoiceManager, DEFAULT_MAX_VOICES};
pub use nodes::{
    EnvelopeParams, FilterParams, FilterType, GeneratorParams, ModulationTarget, NodeClass,
    NodeKind, Waveform,
};
pub use registry::{NodeMetadata, RoutingRegistry, SharedBackend};
pub use template::{extract_template, EdgeDescriptor, NodeDescriptor, VoiceTemplate};
pub use voice::{Voice, VoiceHandle, VoiceId, VoiceState};
