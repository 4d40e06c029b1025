use std::fmt;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SamDemoError};

/// Channel order of a pixel buffer, fixed when the image is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    #[default]
    Rgb,
    Bgr,
}

/// An RGB8 buffer together with the order its channels are stored in.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedImage {
    buffer: RgbImage,
    order: ColorOrder,
}

impl TaggedImage {
    pub const fn new(buffer: RgbImage, order: ColorOrder) -> Self {
        Self { buffer, order }
    }

    pub const fn rgb(buffer: RgbImage) -> Self {
        Self::new(buffer, ColorOrder::Rgb)
    }

    pub const fn bgr(buffer: RgbImage) -> Self {
        Self::new(buffer, ColorOrder::Bgr)
    }

    /// エンコード済み画像をデコードする（image クレートは常に RGB 順で返す）
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes).map_err(|e| SamDemoError::ImageProcessing {
            path: "upload".to_string(),
            operation: "画像デコード".to_string(),
            source: Box::new(e),
        })?;
        Ok(Self::rgb(img.into_rgb8()))
    }

    /// Reads an image the server owns, so a failure here is not the client's fault.
    pub fn open(path: &Path) -> Result<Self> {
        let img = image::open(path)
            .map_err(|e| SamDemoError::rendering(format!("画像読み込み: {}", path.display()), e))?;
        Ok(Self::rgb(img.into_rgb8()))
    }

    pub const fn order(&self) -> ColorOrder {
        self.order
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.buffer.dimensions()
    }

    pub const fn raw(&self) -> &RgbImage {
        &self.buffer
    }

    /// Copy of the buffer in display (RGB) order. The stored buffer is never
    /// touched.
    pub fn to_display(&self) -> RgbImage {
        match self.order {
            ColorOrder::Rgb => self.buffer.clone(),
            ColorOrder::Bgr => swap_red_blue(&self.buffer),
        }
    }
}

pub fn swap_red_blue(image: &RgbImage) -> RgbImage {
    let mut out = image.clone();
    for Rgb([r, _, b]) in out.pixels_mut() {
        std::mem::swap(r, b);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExampleId(pub usize);

impl fmt::Display for ExampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Example {
    pub id: ExampleId,
    pub path: PathBuf,
}

/// Fixed list of example images registered at startup. Ids are positions.
#[derive(Debug, Clone, Default)]
pub struct ExampleRegistry {
    examples: Vec<Example>,
}

impl ExampleRegistry {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let examples = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| Example {
                id: ExampleId(i),
                path: path.into(),
            })
            .collect();
        Self { examples }
    }

    /// Builds the registry and checks that every path exists.
    pub fn load<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let registry = Self::new(paths);
        for example in &registry.examples {
            if !example.path.is_file() {
                return Err(SamDemoError::FileSystem {
                    path: example.path.clone(),
                    operation: "サンプル画像の存在確認".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "サンプル画像が存在しません",
                    ),
                });
            }
        }
        log::info!("registered {} example image(s)", registry.len());
        Ok(registry)
    }

    /// Registers the paths that exist and skips the rest with a warning.
    /// Ids are assigned after skipping, so they stay dense: with the first
    /// path missing, the second one becomes id 0.
    pub fn load_existing<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let present: Vec<PathBuf> = paths
            .into_iter()
            .map(Into::into)
            .filter(|path: &PathBuf| {
                let exists = path.is_file();
                if !exists {
                    log::warn!("example image not found, skipped: {}", path.display());
                }
                exists
            })
            .collect();
        let registry = Self::new(present);
        log::info!("registered {} example image(s)", registry.len());
        registry
    }

    pub fn get(&self, id: ExampleId) -> Option<&Example> {
        self.examples.get(id.0)
    }

    pub fn contains(&self, id: ExampleId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Example> {
        self.examples.iter()
    }

    /// Decodes the registered file for `id`.
    pub fn resolve(&self, id: ExampleId) -> Result<TaggedImage> {
        let example = self.get(id).ok_or(SamDemoError::UnknownExample(id))?;
        TaggedImage::open(&example.path)
    }
}

/// Where the clean baseline image comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Decoded(TaggedImage),
    Example(ExampleId),
}

impl ImageSource {
    /// Clean baseline in display order, decoding examples on demand.
    pub fn clean_image(&self, registry: &ExampleRegistry) -> Result<RgbImage> {
        match self {
            Self::Decoded(image) => Ok(image.to_display()),
            Self::Example(id) => registry.resolve(*id).map(|img| img.to_display()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ImageState {
    #[default]
    Empty,
    Loaded(ImageSource),
}

impl ImageState {
    pub const fn source(&self) -> Option<&ImageSource> {
        match self {
            Self::Empty => None,
            Self::Loaded(source) => Some(source),
        }
    }

    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub const fn example_id(&self) -> Option<ExampleId> {
        match self {
            Self::Loaded(ImageSource::Example(id)) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 200]))
    }

    #[test]
    fn test_rgb_tag_never_swaps() {
        // 左上が R == B でも RGB タグなら入れ替えない
        let buffer = RgbImage::from_pixel(4, 4, Rgb([7, 100, 7]));
        let tagged = TaggedImage::rgb(buffer.clone());
        assert_eq!(tagged.to_display(), buffer);
    }

    #[test]
    fn test_bgr_tag_swaps_once() {
        let tagged = TaggedImage::bgr(RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));
        let display = tagged.to_display();
        assert_eq!(display.get_pixel(1, 1), &Rgb([30, 20, 10]));
        // 元のバッファは変更されない
        assert_eq!(tagged.raw().get_pixel(1, 1), &Rgb([10, 20, 30]));
        assert_eq!(tagged.to_display(), display);
    }

    #[test]
    fn test_registry_resolves_by_position() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let first = temp_dir.path().join("groceries.png");
        let second = temp_dir.path().join("truck.png");
        gradient(8, 6).save(&first)?;
        gradient(5, 9).save(&second)?;

        let registry = ExampleRegistry::load([first.clone(), second.clone()])?;
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(ExampleId(0)).map(|e| e.path.clone()), Some(first));
        assert_eq!(registry.resolve(ExampleId(1))?.dimensions(), (5, 9));
        assert_eq!(registry.resolve(ExampleId(1))?.order(), ColorOrder::Rgb);
        Ok(())
    }

    #[test]
    fn test_load_existing_assigns_ids_after_skipping() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let missing = temp_dir.path().join("groceries.jpg");
        let truck = temp_dir.path().join("truck.png");
        gradient(4, 4).save(&truck)?;

        let registry = ExampleRegistry::load_existing([missing, truck.clone()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(ExampleId(0)).map(|e| e.path.clone()), Some(truck));
        assert!(!registry.contains(ExampleId(1)));
        Ok(())
    }

    #[test]
    fn test_registry_unknown_id() {
        let registry = ExampleRegistry::new(["a.jpg"]);
        assert!(matches!(
            registry.resolve(ExampleId(4)),
            Err(SamDemoError::UnknownExample(ExampleId(4)))
        ));
    }

    #[test]
    fn test_registry_load_rejects_missing_file() {
        let result = ExampleRegistry::load(["/definitely/not/here.jpg"]);
        assert!(matches!(result, Err(SamDemoError::FileSystem { .. })));
    }

    #[test]
    fn test_broken_example_is_a_server_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("broken.png");
        std::fs::write(&path, b"not a png")?;

        let registry = ExampleRegistry::load([path])?;
        let err = registry.resolve(ExampleId(0)).err();
        assert!(matches!(err, Some(SamDemoError::Rendering { .. })));
        assert!(!err.is_some_and(|e| e.is_client_error()));
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            TaggedImage::decode(b"not an image"),
            Err(SamDemoError::ImageProcessing { .. })
        ));
    }
}
