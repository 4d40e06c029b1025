use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::annotate;
use crate::errors::{Result, SamDemoError};
use crate::image_state::{ExampleId, ExampleRegistry, ImageSource, ImageState, TaggedImage};
use crate::inference::{self, InferenceSettings, SegmentationOutput};
use crate::point::{Point, PointLabel, PointStore};
use crate::traits::PromptSegmentationModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What the UI shows after a handler ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub display: Option<RgbImage>,
    pub points: PointStore,
}

/// Per-user state: clean image, prompt points and the image currently shown.
///
/// The clean image and the points share a lifecycle: loading a new image
/// always clears the points.
#[derive(Debug, Clone, Default)]
pub struct Session {
    image: ImageState,
    points: PointStore,
    display: Option<RgbImage>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn image(&self) -> &ImageState {
        &self.image
    }

    pub const fn points(&self) -> &PointStore {
        &self.points
    }

    pub const fn display(&self) -> Option<&RgbImage> {
        self.display.as_ref()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            display: self.display.clone(),
            points: self.points.clone(),
        }
    }

    /// 新しい画像をアップロード：ポイントはクリアされる
    pub fn upload(&mut self, image: TaggedImage) -> Snapshot {
        let (width, height) = image.dimensions();
        log::info!("image uploaded ({width}x{height})");

        self.display = Some(image.to_display());
        self.image = ImageState::Loaded(ImageSource::Decoded(image));
        self.points.clear();
        self.snapshot()
    }

    /// Switches to a registered example. An unknown id leaves the session as
    /// it was.
    pub fn select_example(&mut self, id: ExampleId, registry: &ExampleRegistry) -> Result<Snapshot> {
        let decoded = registry.resolve(id)?;
        log::info!("example {id} selected");

        self.display = Some(decoded.to_display());
        self.image = ImageState::Loaded(ImageSource::Example(id));
        self.points.clear();
        Ok(self.snapshot())
    }

    /// Records a point and draws its marker on top of what is shown now.
    /// Coordinates outside the shown image are rejected and not recorded.
    pub fn click(&mut self, coordinate: [i32; 2], selector: &str) -> Result<Snapshot> {
        let display = self.display.as_mut().ok_or(SamDemoError::NoImage)?;
        let [x, y] = coordinate;
        let inside = |v: i32, extent: u32| u32::try_from(v).is_ok_and(|v| v < extent);
        if !inside(x, display.width()) || !inside(y, display.height()) {
            return Err(SamDemoError::validation(
                "coordinate",
                format!("({x}, {y}) is outside the {}x{} image", display.width(), display.height()),
            ));
        }
        let label = PointLabel::from_selector(selector);
        let point = self.points.add(coordinate, label);
        annotate::draw_marker(display, &point);

        log::debug!(
            "point {:?} at ({}, {}), {} point(s) total",
            point.label,
            point.x,
            point.y,
            self.points.len()
        );
        Ok(self.snapshot())
    }

    /// Drops the last point and replays the rest onto a fresh clean copy.
    pub fn undo(&mut self, registry: &ExampleRegistry) -> Result<Snapshot> {
        let Some(source) = self.image.source() else {
            self.points.undo();
            return Ok(self.snapshot());
        };

        // 例画像の場合はここで登録パスから読み直す
        let clean = source.clean_image(registry)?;
        let removed: Option<Point> = self.points.undo();
        if removed.is_none() {
            log::debug!("undo on empty point list");
        }

        self.display = Some(annotate::render_display(clean, &self.points));
        Ok(self.snapshot())
    }

    pub fn submit<M>(
        &self,
        model: &M,
        registry: &ExampleRegistry,
        settings: &InferenceSettings,
    ) -> Result<SegmentationOutput>
    where
        M: PromptSegmentationModel + ?Sized,
    {
        inference::infer(model, registry, settings, &self.image, &self.points)
    }
}

#[derive(Debug)]
struct Entry {
    session: Arc<Mutex<Session>>,
    last_seen: parking_lot::Mutex<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::new())),
            last_seen: parking_lot::Mutex::new(Instant::now()),
        }
    }
}

/// Session map. Each session sits behind its own async mutex so actions of
/// one user run one at a time while other users proceed.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        self.sessions.write().insert(id, Entry::new());
        log::info!("session {id} created");
        id
    }

    /// Looks the session up and marks it as used now.
    pub fn get(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read();
        let entry = sessions.get(&id).ok_or(SamDemoError::UnknownSession(id))?;
        *entry.last_seen.lock() = Instant::now();
        Ok(Arc::clone(&entry.session))
    }

    pub fn remove(&self, id: SessionId) -> Result<()> {
        self.sessions
            .write()
            .remove(&id)
            .map(|_| log::info!("session {id} closed"))
            .ok_or(SamDemoError::UnknownSession(id))
    }

    /// Drops sessions unused for at least `max_idle`. A session whose lock is
    /// held by a running action is kept. Returns how many were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let idle = entry.last_seen.lock().elapsed() >= max_idle;
            let busy = entry.session.try_lock().is_err();
            if idle && !busy {
                log::info!("session {id} expired");
            }
            !idle || busy
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingModel;
    use crate::point::{BACKGROUND_SELECTOR, FOREGROUND_SELECTOR};
    use image::Rgb;
    use tempfile::TempDir;

    fn image_a() -> TaggedImage {
        TaggedImage::rgb(RgbImage::from_fn(64, 64, |x, y| {
            Rgb([x as u8 * 2, y as u8 * 3, 77])
        }))
    }

    #[test]
    fn test_upload_click_click_undo() -> Result<()> {
        let registry = ExampleRegistry::default();
        let mut session = Session::new();

        session.upload(image_a());
        session.click([10, 10], FOREGROUND_SELECTOR)?;
        session.click([20, 20], BACKGROUND_SELECTOR)?;
        let snapshot = session.undo(&registry)?;

        assert_eq!(
            snapshot.points.as_slice(),
            &[Point::new(10, 10, PointLabel::Foreground)]
        );
        Ok(())
    }

    #[test]
    fn test_unknown_selector_records_foreground() -> Result<()> {
        let mut session = Session::new();
        session.upload(image_a());
        let snapshot = session.click([5, 5], "something_else")?;
        assert_eq!(
            snapshot.points.last().map(|p| p.label),
            Some(PointLabel::Foreground)
        );
        Ok(())
    }

    #[test]
    fn test_click_then_undo_restores_clean_display() -> Result<()> {
        let registry = ExampleRegistry::default();
        let mut session = Session::new();
        let clean = session.upload(image_a()).display;

        let clicked = session.click([30, 30], BACKGROUND_SELECTOR)?;
        assert_ne!(clicked.display, clean);

        let undone = session.undo(&registry)?;
        assert_eq!(undone.display, clean);
        assert!(undone.points.is_empty());
        Ok(())
    }

    #[test]
    fn test_undo_redraws_from_clean_image() -> Result<()> {
        let registry = ExampleRegistry::default();
        let mut session = Session::new();
        session.upload(image_a());
        session.click([10, 10], FOREGROUND_SELECTOR)?;
        session.click([40, 40], BACKGROUND_SELECTOR)?;
        let undone = session.undo(&registry)?;

        let mut expected = PointStore::new();
        expected.add([10, 10], PointLabel::Foreground);
        assert_eq!(undone.display, Some(annotate::render(&image_a(), &expected)));
        Ok(())
    }

    #[test]
    fn test_undo_on_empty_store_is_noop() -> Result<()> {
        let registry = ExampleRegistry::default();
        let mut session = Session::new();
        let uploaded = session.upload(image_a());

        let first = session.undo(&registry)?;
        let second = session.undo(&registry)?;
        assert_eq!(first, uploaded);
        assert_eq!(second, uploaded);

        let mut empty = Session::new();
        let snapshot = empty.undo(&registry)?;
        assert!(snapshot.display.is_none());
        assert!(snapshot.points.is_empty());
        Ok(())
    }

    #[test]
    fn test_click_without_image() {
        let mut session = Session::new();
        assert!(matches!(
            session.click([1, 1], FOREGROUND_SELECTOR),
            Err(SamDemoError::NoImage)
        ));
        assert!(session.points().is_empty());
    }

    #[test]
    fn test_click_outside_image_is_rejected() -> Result<()> {
        let mut session = Session::new();
        let uploaded = session.upload(image_a());

        for coordinate in [[i32::MIN, 0], [0, i32::MAX], [64, 10], [-1, -1]] {
            assert!(matches!(
                session.click(coordinate, FOREGROUND_SELECTOR),
                Err(SamDemoError::Validation { .. })
            ));
        }
        assert_eq!(session.snapshot(), uploaded);

        // 端のピクセルは有効
        session.click([63, 0], BACKGROUND_SELECTOR)?;
        assert_eq!(session.points().len(), 1);
        Ok(())
    }

    #[test]
    fn test_new_upload_clears_points() -> Result<()> {
        let mut session = Session::new();
        session.upload(image_a());
        session.click([1, 1], FOREGROUND_SELECTOR)?;
        session.click([2, 2], FOREGROUND_SELECTOR)?;

        let snapshot = session.upload(image_a());
        assert!(snapshot.points.is_empty());
        Ok(())
    }

    #[test]
    fn test_select_example_resets_and_resolves() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("groceries.png");
        RgbImage::from_pixel(16, 12, Rgb([9, 8, 7])).save(&path)?;
        let registry = ExampleRegistry::load([path.clone()])?;

        let mut session = Session::new();
        session.upload(image_a());
        session.click([3, 3], FOREGROUND_SELECTOR)?;

        let snapshot = session.select_example(ExampleId(0), &registry)?;
        assert!(snapshot.points.is_empty());
        assert_eq!(session.image().example_id(), Some(ExampleId(0)));
        assert_eq!(registry.get(ExampleId(0)).map(|e| &e.path), Some(&path));
        assert_eq!(snapshot.display.map(|d| d.dimensions()), Some((16, 12)));
        Ok(())
    }

    #[test]
    fn test_undo_on_example_redecodes_registered_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("truck.png");
        RgbImage::from_fn(40, 30, |x, y| Rgb([x as u8 * 5, 60, y as u8 * 7])).save(&path)?;
        let registry = ExampleRegistry::load([path.clone()])?;
        let decoded = image::open(&path)?.into_rgb8();

        let mut session = Session::new();
        session.select_example(ExampleId(0), &registry)?;
        let clicked = session.click([20, 15], FOREGROUND_SELECTOR)?;
        assert_ne!(clicked.display.as_ref(), Some(&decoded));

        let undone = session.undo(&registry)?;
        assert_eq!(undone.display, Some(decoded));
        assert!(undone.points.is_empty());
        assert_eq!(session.image().example_id(), Some(ExampleId(0)));
        Ok(())
    }

    #[test]
    fn test_select_unknown_example_keeps_state() -> Result<()> {
        let registry = ExampleRegistry::default();
        let mut session = Session::new();
        session.upload(image_a());
        session.click([3, 3], FOREGROUND_SELECTOR)?;

        let result = session.select_example(ExampleId(7), &registry);
        assert!(matches!(result, Err(SamDemoError::UnknownExample(_))));
        assert_eq!(session.points().len(), 1);
        assert!(session.image().example_id().is_none());
        Ok(())
    }

    #[test]
    fn test_submit_uses_clean_image() -> Result<()> {
        let model = RecordingModel::default();
        let registry = ExampleRegistry::default();
        let mut session = Session::new();
        session.upload(image_a());
        session.click([10, 10], FOREGROUND_SELECTOR)?;

        session.submit(&model, &registry, &InferenceSettings::default())?;

        let request = model.last_request().ok_or(SamDemoError::NoImage)?;
        assert_eq!(request.image, image_a().to_display());
        assert_eq!(request.point_coords, vec![[10, 10]]);
        assert_eq!(request.point_labels, vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_lifecycle() -> Result<()> {
        let store = SessionStore::new();
        let id = store.create();
        assert_eq!(store.len(), 1);

        {
            let session = store.get(id)?;
            let mut guard = session.lock().await;
            guard.upload(image_a());
        }
        assert!(store.get(id)?.lock().await.image().is_loaded());

        store.remove(id)?;
        assert!(store.is_empty());
        assert!(matches!(store.get(id), Err(SamDemoError::UnknownSession(_))));
        assert!(store.remove(id).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_recent_and_busy_sessions() -> Result<()> {
        let store = SessionStore::new();
        let idle = store.create();
        let busy = store.create();

        assert_eq!(store.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(store.len(), 2);

        let session = store.get(busy)?;
        let _guard = session.lock().await;
        assert_eq!(store.evict_idle(Duration::ZERO), 1);
        assert!(matches!(store.get(idle), Err(SamDemoError::UnknownSession(_))));
        assert!(store.get(busy).is_ok());
        Ok(())
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().ok(), Some(id));
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
