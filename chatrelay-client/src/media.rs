use std::{collections::VecDeque, fmt, future::Future, path::PathBuf};

use crate::image_pipeline::RawImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Gallery,
    Camera,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Gallery => write!(f, "gallery"),
            MediaKind::Camera => write!(f, "camera"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Clone)]
pub enum PickOutcome {
    Picked(RawImage),
    Cancelled,
}

/// Device media capability: permission prompts plus gallery and camera pickers.
pub trait MediaSource: Send {
    fn request_permission(&mut self, kind: MediaKind) -> impl Future<Output = Permission> + Send;

    fn pick_from_gallery(&mut self) -> impl Future<Output = PickOutcome> + Send;

    fn capture_from_camera(&mut self) -> impl Future<Output = PickOutcome> + Send;
}

/// Serves queued file paths as gallery picks. There is no camera.
#[derive(Debug, Default)]
pub struct PathMediaSource {
    queued: VecDeque<PathBuf>,
}

impl PathMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_path(&mut self, path: impl Into<PathBuf>) {
        self.queued.push_back(path.into());
    }
}

impl MediaSource for PathMediaSource {
    async fn request_permission(&mut self, kind: MediaKind) -> Permission {
        match kind {
            MediaKind::Gallery => Permission::Granted,
            MediaKind::Camera => Permission::Denied,
        }
    }

    async fn pick_from_gallery(&mut self) -> PickOutcome {
        match self.queued.pop_front() {
            Some(path) => PickOutcome::Picked(RawImage::Path(path)),
            None => PickOutcome::Cancelled,
        }
    }

    async fn capture_from_camera(&mut self) -> PickOutcome {
        PickOutcome::Cancelled
    }
}
