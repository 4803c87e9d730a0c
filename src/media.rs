//! Video plumbing around a rover session: the frame source feeding the
//! capture pump, and the external transcoder producing the viewer stream.

mod capture;
mod transcode;

pub use capture::{CapturePump, FfmpegSource, FrameSource};
pub use transcode::TranscodePipeline;

use std::path::Path;
use std::sync::Arc;

use crate::config::ProcessConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl StreamFormat {
    pub fn placeholders(&self) -> Vec<(&'static str, String)> {
        vec![
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            ("framerate", self.framerate.to_string()),
        ]
    }
}

pub trait MediaFactory: Send + Sync {
    fn open_source(&self, format: StreamFormat, conf: &Path) -> Result<Arc<dyn FrameSource>>;
    fn open_transcoder(&self, format: StreamFormat) -> Result<TranscodePipeline>;
}

#[derive(Debug, Clone)]
pub struct ProcessMedia {
    pub capture: ProcessConfig,
    pub transcoder: ProcessConfig,
}

impl MediaFactory for ProcessMedia {
    fn open_source(&self, format: StreamFormat, conf: &Path) -> Result<Arc<dyn FrameSource>> {
        Ok(Arc::new(FfmpegSource::new(self.capture.clone(), format, conf)))
    }

    fn open_transcoder(&self, format: StreamFormat) -> Result<TranscodePipeline> {
        TranscodePipeline::spawn(&self.transcoder, format)
    }
}
