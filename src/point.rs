use serde::{Deserialize, Serialize};

/// 前景点を選ぶセレクタ値
pub const FOREGROUND_SELECTOR: &str = "foreground_point";
/// 背景点を選ぶセレクタ値
pub const BACKGROUND_SELECTOR: &str = "background_point";

/// Binary prompt label. The numeric values are what the decoder expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointLabel {
    Background,
    Foreground,
}

impl PointLabel {
    /// Resolves a UI selector value. Anything unrecognized falls back to
    /// foreground.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            FOREGROUND_SELECTOR => Self::Foreground,
            BACKGROUND_SELECTOR => Self::Background,
            other => {
                log::debug!("unrecognized point selector {other:?}, using foreground");
                Self::Foreground
            }
        }
    }

    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Background => 0,
            Self::Foreground => 1,
        }
    }
}

/// ユーザーがクリックした1点（ピクセル座標とラベル）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
    pub label: PointLabel,
}

impl Point {
    pub const fn new(x: i32, y: i32, label: PointLabel) -> Self {
        Self { x, y, label }
    }

    pub const fn coordinate(&self) -> [i32; 2] {
        [self.x, self.y]
    }
}

/// Ordered prompt points for the current image.
///
/// Insertion order is both drawing order and undo order: the last point
/// added is the first one removed. Duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PointStore {
    points: Vec<Point>,
}

impl PointStore {
    pub const fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn add(&mut self, coordinate: [i32; 2], label: PointLabel) -> Point {
        let point = Point::new(coordinate[0], coordinate[1], label);
        self.points.push(point);
        point
    }

    /// Removes the most recent point. Empty store is left as is.
    pub fn undo(&mut self) -> Option<Point> {
        self.points.pop()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&Point> {
        self.points.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    pub fn as_slice(&self) -> &[Point] {
        &self.points
    }

    /// 座標リストとラベルリストに分割（保存順を維持）
    pub fn split(&self) -> (Vec<[i32; 2]>, Vec<i32>) {
        self.points
            .iter()
            .map(|p| (p.coordinate(), p.label.as_i32()))
            .unzip()
    }
}

impl<'a> IntoIterator for &'a PointStore {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}
