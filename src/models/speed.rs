use serde::{Deserialize, Serialize};

/// 加速時のスロットル既定値
pub const T_ACCEL: f64 = 0.5;
/// 減速時のブレーキ既定値
pub const T_BRAKE: f64 = 0.3;

/// 速度制御方式
///
/// 既定は閾値方式（現在速度が目標未満ならスロットル、それ以外はブレーキ）です。
/// 平滑化はしないため、目標付近ではスロットルとブレーキが交互に出ます。
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpeedPolicy {
    /// 2状態の閾値制御
    Threshold { throttle: f64, brake: f64 },
    /// 速度誤差に比例した制御（上限付き）
    Proportional { gain: f64, max_throttle: f64, max_brake: f64 },
}

impl Default for SpeedPolicy {
    fn default() -> Self {
        SpeedPolicy::Threshold { throttle: T_ACCEL, brake: T_BRAKE }
    }
}

/// 速度コントローラ
///
/// 現在速度と目標速度から (throttle, brake) を計算する純粋関数の集まりです。
/// スロットルとブレーキが同時に正になることはありません。
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedController {
    pub policy: SpeedPolicy,
}

impl SpeedController {
    pub fn new(policy: SpeedPolicy) -> Self {
        Self { policy }
    }

    /// (throttle, brake) を計算
    pub fn command(&self, current_speed: f64, target_speed: f64) -> (f64, f64) {
        match self.policy {
            SpeedPolicy::Threshold { throttle, brake } => {
                if current_speed < target_speed {
                    (throttle, 0.0)
                } else {
                    (0.0, brake)
                }
            }
            SpeedPolicy::Proportional { gain, max_throttle, max_brake } => {
                let error = target_speed - current_speed;
                if error > 0.0 {
                    ((gain * error).min(max_throttle), 0.0)
                } else {
                    (0.0, (gain * -error).min(max_brake))
                }
            }
        }
    }
}

/// 既定の閾値方式による (throttle, brake)
pub fn speed_command(current_speed: f64, target_speed: f64) -> (f64, f64) {
    SpeedController::default().command(current_speed, target_speed)
}
