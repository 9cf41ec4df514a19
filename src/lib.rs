pub mod error;
pub mod retry;
pub mod video_processor;
pub mod scene_detector;
pub mod frame_sampler;
pub mod scorer;
pub mod vision_client;
pub mod ranking;
pub mod clip_exporter;
pub mod metadata;
pub mod processor;
pub mod config;

pub use error::{DiagnosticKind, HighlightError, HighlightResult};
pub use video_processor::{get_cut_timestamps, CutDetection, CutTimestamps, FfmpegTool, MediaTool, VideoInfo};
pub use scene_detector::{SceneDetector, SceneWindow};
pub use frame_sampler::{FrameSampler, SampledFrame};
pub use scorer::{ScoreResult, Scorer, ScoringContext};
pub use vision_client::{VisionClient, VisionClientConfig};
pub use ranking::{select, ScoredCandidate};
pub use clip_exporter::{clip_filename, ClipExporter};
pub use metadata::{Diagnostic, ExportedClip, RunMetadata, RunStatus};
pub use processor::{process_video, Pipeline, ProcessConfig, ProcessOutput};
pub use config::{ConfigLoader, ExtendedConfig};
