use thiserror::Error;
use tracing::debug;

use crate::domain::{MetaInfo, SubTask, SubTaskState, SubTaskStats, Task};
use crate::storage::MediaStorage;

/// Why a processing sub-task did not succeed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ProcessingError {
    pub fn state(&self) -> SubTaskState {
        match self {
            ProcessingError::Unsupported(_) => SubTaskState::NeverExecuted,
            ProcessingError::InvalidContent(_) => SubTaskState::Failed,
            ProcessingError::Storage(_) => SubTaskState::Error,
        }
    }
}

/// Analysis backend run on retrieved content
pub trait MediaProcessor: Send + Sync {
    fn extract_color(&self, content: &[u8]) -> Result<Vec<String>, ProcessingError>;

    fn extract_metadata(&self, content: &[u8], content_type: Option<&str>) -> Result<MetaInfo, ProcessingError>;

    fn generate_thumbnail(&self, content: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ProcessingError>;
}

/// Header-only processor: media type sniffing and image dimensions
#[derive(Debug, Default, Clone)]
pub struct BasicMediaProcessor;

impl MediaProcessor for BasicMediaProcessor {
    fn extract_color(&self, _content: &[u8]) -> Result<Vec<String>, ProcessingError> {
        Err(ProcessingError::Unsupported("color extraction needs an image backend".to_string()))
    }

    fn extract_metadata(&self, content: &[u8], content_type: Option<&str>) -> Result<MetaInfo, ProcessingError> {
        if content.is_empty() {
            return Err(ProcessingError::InvalidContent("empty body".to_string()));
        }

        let declared = content_type
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_lowercase())
            .filter(|value| !value.is_empty());

        let mime_type = match sniff_mime(content) {
            Some(mime) => mime.to_string(),
            None => declared.ok_or_else(|| ProcessingError::Unsupported("unknown media type".to_string()))?,
        };

        let (width, height) = match mime_type.as_str() {
            "image/png" => png_dimensions(content)?,
            "image/gif" => gif_dimensions(content)?,
            "image/jpeg" => jpeg_dimensions(content)?,
            _ => (None, None),
        };

        Ok(MetaInfo {
            mime_type: Some(mime_type),
            size_bytes: content.len() as u64,
            width,
            height,
        })
    }

    fn generate_thumbnail(&self, _content: &[u8], _width: u32, _height: u32) -> Result<Vec<u8>, ProcessingError> {
        Err(ProcessingError::Unsupported("thumbnail generation needs an image backend".to_string()))
    }
}

fn sniff_mime(content: &[u8]) -> Option<&'static str> {
    if content.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if content.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if content.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if content.len() >= 12 && &content[..4] == b"RIFF" && &content[8..12] == b"WEBP" {
        Some("image/webp")
    } else if content.starts_with(b"ID3") {
        Some("audio/mpeg")
    } else if content.len() >= 8 && &content[4..8] == b"ftyp" {
        Some("video/mp4")
    } else {
        None
    }
}

type Dimensions = (Option<u32>, Option<u32>);

fn be_u16(bytes: &[u8]) -> u32 {
    u32::from(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn png_dimensions(content: &[u8]) -> Result<Dimensions, ProcessingError> {
    if content.len() < 24 || &content[12..16] != b"IHDR" {
        return Err(ProcessingError::InvalidContent("truncated PNG header".to_string()));
    }
    let width = u32::from_be_bytes([content[16], content[17], content[18], content[19]]);
    let height = u32::from_be_bytes([content[20], content[21], content[22], content[23]]);
    Ok((Some(width), Some(height)))
}

fn gif_dimensions(content: &[u8]) -> Result<Dimensions, ProcessingError> {
    if content.len() < 10 {
        return Err(ProcessingError::InvalidContent("truncated GIF header".to_string()));
    }
    let width = u32::from(u16::from_le_bytes([content[6], content[7]]));
    let height = u32::from(u16::from_le_bytes([content[8], content[9]]));
    Ok((Some(width), Some(height)))
}

fn jpeg_dimensions(content: &[u8]) -> Result<Dimensions, ProcessingError> {
    let mut pos = 2;

    while pos + 4 <= content.len() {
        if content[pos] != 0xFF {
            return Err(ProcessingError::InvalidContent(format!("bad JPEG marker at {}", pos)));
        }
        let marker = content[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        // Standalone markers carry no length
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            pos += 2;
            continue;
        }

        let length = be_u16(&content[pos + 2..]) as usize;
        let is_frame = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_frame {
            if pos + 9 > content.len() {
                break;
            }
            let height = be_u16(&content[pos + 5..]);
            let width = be_u16(&content[pos + 7..]);
            return Ok((Some(width), Some(height)));
        }
        pos += 2 + length;
    }

    Err(ProcessingError::InvalidContent("no JPEG frame header".to_string()))
}

/// Everything the processing stage produced for one task
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMedia {
    pub stats: SubTaskStats,
    pub meta_info: Option<MetaInfo>,
    pub color_tags: Vec<String>,
    pub thumbnails: Vec<String>,
}

fn severity(state: SubTaskState) -> u8 {
    match state {
        SubTaskState::NeverExecuted => 0,
        SubTaskState::Success => 1,
        SubTaskState::Failed => 2,
        SubTaskState::Error => 3,
    }
}

/// Keeps the most severe outcome of repeated sub-tasks
#[derive(Debug)]
struct Worst {
    state: SubTaskState,
    log: Option<String>,
}

impl Worst {
    fn new() -> Self {
        Self { state: SubTaskState::NeverExecuted, log: None }
    }

    fn record(&mut self, state: SubTaskState, log: Option<String>) {
        if severity(state) >= severity(self.state) {
            self.state = state;
            if log.is_some() {
                self.log = log;
            }
        }
    }

    fn record_error(&mut self, error: &ProcessingError) {
        self.record(error.state(), Some(error.to_string()));
    }
}

/// Run the sub-tasks of `task` on its retrieved content
pub async fn process(
    task: &Task,
    stats: SubTaskStats,
    content: &[u8],
    content_type: Option<&str>,
    processor: &dyn MediaProcessor,
    media: &dyn MediaStorage,
) -> ProcessedMedia {
    let mut color = Worst::new();
    let mut meta = Worst::new();
    let mut generation = Worst::new();
    let mut storage = Worst::new();

    let mut result = ProcessedMedia { stats, meta_info: None, color_tags: Vec::new(), thumbnails: Vec::new() };

    for sub_task in &task.sub_tasks {
        match sub_task {
            SubTask::ColorExtraction => match processor.extract_color(content) {
                Ok(tags) => {
                    result.color_tags = tags;
                    color.record(SubTaskState::Success, None);
                }
                Err(e) => color.record_error(&e),
            },
            SubTask::MetaExtraction => match processor.extract_metadata(content, content_type) {
                Ok(info) => {
                    result.meta_info = Some(info);
                    meta.record(SubTaskState::Success, None);
                }
                Err(e) => meta.record_error(&e),
            },
            SubTask::GenerateThumbnail { width, height } => {
                let thumbnail = match processor.generate_thumbnail(content, *width, *height) {
                    Ok(bytes) => {
                        generation.record(SubTaskState::Success, None);
                        bytes
                    }
                    Err(e) => {
                        generation.record_error(&e);
                        continue;
                    }
                };

                let key = format!("{}-{}x{}", task.id, width, height);
                match media.store(&key, &thumbnail).await {
                    Ok(location) => {
                        result.thumbnails.push(location);
                        storage.record(SubTaskState::Success, None);
                    }
                    Err(e) => storage.record_error(&ProcessingError::Storage(format!("{:#}", e))),
                }
            }
        }
    }

    debug!(
        "Processed task {}: color {:?}, meta {:?}, thumbnail {:?}/{:?}",
        task.id, color.state, meta.state, generation.state, storage.state
    );

    result.stats = result
        .stats
        .with_color_extraction_state(color.state, color.log)
        .with_meta_extraction_state(meta.state, meta.log)
        .with_thumbnail_generation_state(generation.state, generation.log)
        .with_thumbnail_storage_state(storage.state, storage.log);
    result
}
