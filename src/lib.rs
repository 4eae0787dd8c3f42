pub mod config;
pub mod error;
pub mod fanout;
pub mod http;
pub mod processor;
pub mod recovery;
pub mod session;
pub mod stitch;
pub mod store;
pub mod summarize;
pub mod transcribe;

pub use config::Config;
pub use error::{ProcessorError, Result};
pub use fanout::{Fanout, SessionEvent};
pub use http::{create_router, AppState};
pub use processor::Processor;
pub use session::{ContainerHint, FragmentMeta, SessionRegistry, SessionStatus};
pub use stitch::{FfmpegStitcher, StitchRequest, StitchedAudio, Stitcher};
pub use store::{Database, FragmentStore};
pub use summarize::Summarizer;
pub use transcribe::{TranscribeError, Transcriber, TranscriptionGateway};
