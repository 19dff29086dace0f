use std::f64::consts::PI;
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// 3次元位置を表す構造体
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f64, // m
    pub y: f64, // m
    pub z: f64, // m
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// XY平面での2次元距離を計算
    pub fn distance_xy(&self, other: &Point3) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// 3次元距離を計算
    pub fn distance_3d(&self, other: &Point3) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    /// ベクトルの長さ（原点からの距離）
    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Point3 {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Point3 {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Point3 {
    type Output = Self;

    fn mul(self, scalar: f64) -> Self::Output {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

/// 位置と水平面内のヨー角からなる姿勢
///
/// ヨー角はシミュレータ側の慣習に合わせて度で保持します。
/// 前方単位ベクトルは `(cos(yaw), sin(yaw))` です。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Point3,
    /// ヨー角（度）
    pub yaw_deg: f64,
}

impl Pose {
    pub fn new(position: Point3, yaw_deg: f64) -> Self {
        Self { position, yaw_deg }
    }

    /// XY平面での前方単位ベクトル
    pub fn forward_xy(&self) -> (f64, f64) {
        let yaw = math_utils::deg_to_rad(self.yaw_deg);
        (yaw.cos(), yaw.sin())
    }
}

/// 外部ワールド上のアクターを指す不透明なハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(pub u32);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// 1ティック分のアクチュエーション指令
///
/// throttle, brake は [0, 1]、steer は [-1, 1] の正規化値です。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlCommand {
    pub throttle: f64,
    pub brake: f64,
    pub steer: f64,
}

impl ControlCommand {
    /// 各値を有効範囲に丸めて作成
    pub fn new(throttle: f64, brake: f64, steer: f64) -> Self {
        Self {
            throttle: throttle.clamp(0.0, 1.0),
            brake: brake.clamp(0.0, 1.0),
            steer: steer.clamp(-1.0, 1.0),
        }
    }

    /// 停止指令（スロットル0、フルブレーキ、直進）
    pub fn stop() -> Self {
        Self::new(0.0, 1.0, 0.0)
    }
}

/// 2点間のユークリッド距離
pub fn distance(a: Point3, b: Point3) -> f64 {
    (a - b).magnitude()
}

/// 車両の進行方向と目標点方向のなす符号付き角度（ラジアン）
///
/// z成分は無視し、地面平面上で `atan2(cross, dot)` を計算します。
/// `cross = v.x*w.y - v.y*w.x` なので、ヨー角が増える側（反時計回りの
/// x-y座標系では左側）にある目標は正になります。
/// 戻り値は (-π, π] に収まります。
pub fn steering_angle(vehicle_pose: &Pose, target: Point3) -> f64 {
    let (vx, vy) = vehicle_pose.forward_xy();
    let wx = target.x - vehicle_pose.position.x;
    let wy = target.y - vehicle_pose.position.y;

    let dot = vx * wx + vy * wy;
    let cross = vx * wy - vy * wx;
    let angle = cross.atan2(dot);

    // atan2は-0.0の場合に-πを返すので+πに寄せる
    if angle <= -PI { PI } else { angle }
}

/// 速度ベクトル（m/s）から km/h の速さを計算
pub fn speed_kmh(vx: f64, vy: f64, vz: f64) -> f64 {
    3.6 * (vx.powi(2) + vy.powi(2) + vz.powi(2)).sqrt()
}

/// 数学ユーティリティ関数
pub mod math_utils {
    /// 度をラジアンに変換
    pub fn deg_to_rad(degrees: f64) -> f64 {
        degrees * std::f64::consts::PI / 180.0
    }

    /// ラジアンを度に変換
    pub fn rad_to_deg(radians: f64) -> f64 {
        radians * 180.0 / std::f64::consts::PI
    }

    /// 角度を-180度〜180度の範囲に正規化
    pub fn normalize_angle(angle_deg: f64) -> f64 {
        let mut normalized = angle_deg % 360.0;
        if normalized > 180.0 {
            normalized -= 360.0;
        } else if normalized <= -180.0 {
            normalized += 360.0;
        }
        normalized
    }

    /// km/h を m/s に変換
    pub fn kmh_to_mps(kmh: f64) -> f64 {
        kmh / 3.6
    }
}
