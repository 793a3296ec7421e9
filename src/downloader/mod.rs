pub mod aggregator;
pub mod chunk;
pub mod context;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod manager;
pub mod orchestrator;
pub mod placement;
pub mod task;

pub use aggregator::{AggregatedProgress, ProgressAggregator};
pub use chunk::{Chunk, ChunkPlan};
pub use context::{FetchHandle, FetchOutcome};
pub use control::TaskControl;
pub use engine::{DownloadEngine, DEFAULT_CONCURRENCY};
pub use error::DownloadError;
pub use events::{DownloadEvent, EventListener};
pub use http::{HttpFetcher, ProbeInfo, ReqwestFetcher};
pub use manager::{TaskRegistry, TaskSnapshot};
pub use orchestrator::TaskOrchestrator;
pub use placement::available_path;
pub use task::{DownloaderState, StreamDescriptor, StreamRole, Task, TaskKind};
