use crate::models::common::{Point3, Pose, distance, math_utils};
use std::fmt;

/// 経路上でサンプリングされた姿勢
///
/// ルート計画時に一度だけ生成され、以後変更されません。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub pose: Pose,
}

impl Waypoint {
    pub fn new(position: Point3, yaw_deg: f64) -> Self {
        Self { pose: Pose::new(position, yaw_deg) }
    }

    pub fn position(&self) -> Point3 {
        self.pose.position
    }
}

/// 経路構築エラー
#[derive(Debug, Clone, PartialEq)]
pub enum PathError {
    /// ウェイポイントが1つもない
    Empty,
    /// 有限でない座標を含む
    NonFinite(usize),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Empty => write!(f, "経路が空です（ウェイポイントが1つ以上必要）"),
            PathError::NonFinite(index) => {
                write!(f, "ウェイポイント {} の座標が有限値ではありません", index)
            }
        }
    }
}

impl std::error::Error for PathError {}

/// 車両が追従すべきウェイポイントの順序付き列
///
/// 走行開始前に一度だけ構築され、以後は読み取り専用です。
/// 要素を変更するAPIは持たないため、走行中に経路が変わることはありません。
#[derive(Debug, Clone)]
pub struct Path {
    waypoints: Vec<Waypoint>,
}

impl Path {
    /// ウェイポイント列から経路を作成
    ///
    /// # 戻り値
    ///
    /// 空の場合は `PathError::Empty`
    pub fn new(waypoints: Vec<Waypoint>) -> Result<Self, PathError> {
        if waypoints.is_empty() {
            return Err(PathError::Empty);
        }
        if let Some(index) = waypoints.iter().position(|w| !w.position().is_finite()) {
            return Err(PathError::NonFinite(index));
        }
        Ok(Self { waypoints })
    }

    /// 直線経路を生成
    pub fn straight(start: Point3, heading_deg: f64, spacing: f64, count: usize) -> Result<Self, PathError> {
        Self::arc(start, heading_deg, spacing, count, 0.0)
    }

    /// 一定曲率の経路を生成
    ///
    /// 曲率が0の場合は直線になります。正の曲率ではヨー角が増える方向に曲がります。
    pub fn arc(
        start: Point3,
        heading_deg: f64,
        spacing: f64,
        count: usize,
        curvature_per_m: f64,
    ) -> Result<Self, PathError> {
        let first = Waypoint::new(start, heading_deg);
        let distance = spacing * count as f64;
        let waypoints = plan_route(first, spacing, distance, |last, step| {
            Some(advance_along_arc(last, step, curvature_per_m))
        });
        Self::new(waypoints)
    }

    /// 指定位置に最も近いウェイポイントを返す
    ///
    /// 全ウェイポイントの線形走査で、距離が等しい場合は経路順で先のものを返します。
    /// 経路長は数十〜数百点、ティック周期は100ms以上なので走査で十分です。
    pub fn nearest(&self, position: Point3) -> &Waypoint {
        &self.waypoints[self.nearest_index(position)]
    }

    /// 最近傍ウェイポイントのインデックス
    pub fn nearest_index(&self, position: Point3) -> usize {
        let mut best_index = 0;
        let mut best_distance = f64::INFINITY;

        for (index, waypoint) in self.waypoints.iter().enumerate() {
            let d = distance(waypoint.position(), position);
            // 厳密な比較で同距離なら先勝ち
            if d < best_distance {
                best_distance = d;
                best_index = index;
            }
        }

        best_index
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn first(&self) -> &Waypoint {
        &self.waypoints[0]
    }

    pub fn last(&self) -> &Waypoint {
        &self.waypoints[self.waypoints.len() - 1]
    }

    /// 折れ線としての全長（m）
    pub fn total_length(&self) -> f64 {
        self.waypoints
            .windows(2)
            .map(|pair| distance(pair[0].position(), pair[1].position()))
            .sum()
    }

    /// 始点から経路に沿って `s` m 進んだ位置の姿勢
    ///
    /// 区間内は線形補間し、ヨー角は区間の向きを使います。
    /// 範囲外の `s` は始点・終点に丸めます。
    pub fn pose_at_distance(&self, s: f64) -> Pose {
        if s <= 0.0 || self.waypoints.len() == 1 {
            return self.first().pose;
        }

        let mut remaining = s;
        for pair in self.waypoints.windows(2) {
            let a = pair[0].position();
            let b = pair[1].position();
            let segment = distance(a, b);
            if segment <= 0.0 {
                continue;
            }
            if remaining <= segment {
                let t = remaining / segment;
                let position = a + (b - a) * t;
                let yaw = math_utils::rad_to_deg((b.y - a.y).atan2(b.x - a.x));
                return Pose::new(position, yaw);
            }
            remaining -= segment;
        }

        self.last().pose
    }
}

/// 後続ウェイポイントを辿ってルートを計画
///
/// `start` から始め、`successor` が返す次点を `spacing` 間隔で追加していきます。
/// `len * spacing < distance` の間続け、後続がなければ（行き止まり）そこで終了します。
pub fn plan_route<F>(start: Waypoint, spacing: f64, distance: f64, mut successor: F) -> Vec<Waypoint>
where
    F: FnMut(&Waypoint, f64) -> Option<Waypoint>,
{
    let mut route = vec![start];
    while (route.len() as f64) * spacing < distance {
        let last = route[route.len() - 1];
        match successor(&last, spacing) {
            Some(next) => route.push(next),
            None => break,
        }
    }
    route
}

/// 一定曲率で `step` m 進んだウェイポイント
fn advance_along_arc(from: &Waypoint, step: f64, curvature_per_m: f64) -> Waypoint {
    let yaw = math_utils::deg_to_rad(from.pose.yaw_deg);
    let position = from.position();

    if curvature_per_m.abs() < 1e-9 {
        let next = Point3::new(position.x + step * yaw.cos(), position.y + step * yaw.sin(), position.z);
        return Waypoint::new(next, from.pose.yaw_deg);
    }

    let dyaw = step * curvature_per_m;
    let radius = 1.0 / curvature_per_m;
    let next = Point3::new(
        position.x + radius * ((yaw + dyaw).sin() - yaw.sin()),
        position.y - radius * ((yaw + dyaw).cos() - yaw.cos()),
        position.z,
    );
    Waypoint::new(next, math_utils::normalize_angle(math_utils::rad_to_deg(yaw + dyaw)))
}
