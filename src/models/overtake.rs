//! # 追い越し状態機械
//!
//! 低速の先行車（障害車両）に接近したとき、一定時間の操舵オーバーライドで
//! 追い越しを行い、その後経路追従に戻ります。
//!
//! 状態遷移は時間駆動です（開始条件のみ距離で判定）：
//!
//! `Following → SteeringLeft → Straightening → SteeringRight → Following`
//!
//! 操作はオープンループであり、実際の横方向クリアランスは確認しません。
//! 固定の時間と操舵量による単純化で、汎用的な道路形状での妥当性は保証されません。

use crate::models::common::{Point3, distance};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// 追い越しパラメータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OvertakeConfig {
    /// 通常時の目標速度（km/h）
    pub cruise_speed: f64,
    /// 追い越し中の目標速度（km/h）
    pub overtake_speed: f64,
    /// 追い越し開始距離（m）
    pub trigger_distance: f64,
    /// 左への操舵量（負が左）
    pub steer_left: f64,
    /// 右への操舵量
    pub steer_right: f64,
    /// 左操舵の継続時間（秒）
    pub steer_left_s: f64,
    /// 直進の継続時間（秒）
    pub straight_s: f64,
    /// 右操舵の継続時間（秒）
    pub steer_right_s: f64,
}

impl Default for OvertakeConfig {
    fn default() -> Self {
        Self {
            cruise_speed: 30.0,
            overtake_speed: 50.0,
            trigger_distance: 10.0,
            steer_left: -0.3,
            steer_right: 0.3,
            steer_left_s: 1.0,
            straight_s: 2.0,
            steer_right_s: 1.0,
        }
    }
}

impl OvertakeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.cruise_speed.is_finite() || !self.overtake_speed.is_finite() {
            return Err("cruise_speed and overtake_speed must be finite".to_string());
        }
        if !(self.trigger_distance > 0.0) {
            return Err("trigger_distance must be positive".to_string());
        }
        if !(-1.0..=1.0).contains(&self.steer_left) || !(-1.0..=1.0).contains(&self.steer_right) {
            return Err("steer values must be within [-1, 1]".to_string());
        }
        self.phase_durations().map(|_| ())
    }

    /// 各フェーズの継続時間（左操舵、直進、右操舵）
    pub fn phase_durations(&self) -> Result<PhaseDurations, String> {
        let convert = |name: &str, seconds: f64| {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(format!("{} must be non-negative", name));
            }
            Duration::try_from_secs_f64(seconds).map_err(|e| format!("{}: {}", name, e))
        };

        Ok(PhaseDurations {
            steer_left: convert("steer_left_s", self.steer_left_s)?,
            straight: convert("straight_s", self.straight_s)?,
            steer_right: convert("steer_right_s", self.steer_right_s)?,
        })
    }
}

/// 検証済みのフェーズ継続時間
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    pub steer_left: Duration,
    pub straight: Duration,
    pub steer_right: Duration,
}

/// 追い越し状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvertakeState {
    /// 経路追従（初期状態）
    Following,
    /// 左へ操舵中
    SteeringLeft { elapsed: Duration },
    /// 直進中
    Straightening { elapsed: Duration },
    /// 右へ操舵中
    SteeringRight { elapsed: Duration },
}

impl OvertakeState {
    pub fn name(&self) -> &'static str {
        match self {
            OvertakeState::Following => "Following",
            OvertakeState::SteeringLeft { .. } => "SteeringLeft",
            OvertakeState::Straightening { .. } => "Straightening",
            OvertakeState::SteeringRight { .. } => "SteeringRight",
        }
    }

    pub fn is_overtaking(&self) -> bool {
        !matches!(self, OvertakeState::Following)
    }
}

/// 1ティック分の判断結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceDecision {
    /// 有効な目標速度（km/h）
    pub target_speed: f64,
    /// 経路追従の操舵を置き換える値（Noneなら経路追従）
    pub steer_override: Option<f64>,
}

/// 追い越し状態機械
#[derive(Debug, Clone)]
pub struct OvertakeMachine {
    config: OvertakeConfig,
    durations: PhaseDurations,
    state: OvertakeState,
    completed: u32,
}

impl OvertakeMachine {
    /// 設定を検証して状態機械を作成
    pub fn new(config: OvertakeConfig) -> Result<Self, String> {
        config.validate()?;
        let durations = config.phase_durations()?;

        Ok(Self {
            config,
            durations,
            state: OvertakeState::Following,
            completed: 0,
        })
    }

    pub fn state(&self) -> OvertakeState {
        self.state
    }

    pub fn config(&self) -> &OvertakeConfig {
        &self.config
    }

    /// 完了した追い越しの回数
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// 状態を `dt` だけ進め、今ティックの目標速度と操舵オーバーライドを返す
    ///
    /// 開始条件は `Following` のときだけ評価されます。開始したティックでは
    /// 既に `SteeringLeft` の出力を返し、そのティックの `dt` は継続時間に含めません。
    ///
    /// # 引数
    ///
    /// * `dt` - 前ティックからの経過時間
    /// * `vehicle_position` - 自車位置
    /// * `obstacle_position` - 障害車両位置（存在しない場合はNone）
    pub fn update(
        &mut self,
        dt: Duration,
        vehicle_position: Point3,
        obstacle_position: Option<Point3>,
    ) -> GuidanceDecision {
        match self.state {
            OvertakeState::Following => {
                if let Some(obstacle) = obstacle_position {
                    let gap = distance(vehicle_position, obstacle);
                    if gap < self.config.trigger_distance {
                        self.state = OvertakeState::SteeringLeft { elapsed: Duration::ZERO };
                        info!(
                            obstacle_distance = gap,
                            trigger_distance = self.config.trigger_distance,
                            target_speed = self.config.overtake_speed,
                            "OVERTAKE_START: 障害車両に接近したため追い越しを開始します"
                        );
                    }
                }
            }
            _ => self.advance(dt),
        }

        self.decision()
    }

    /// 現在状態に対応する判断
    pub fn decision(&self) -> GuidanceDecision {
        match self.state {
            OvertakeState::Following => GuidanceDecision {
                target_speed: self.config.cruise_speed,
                steer_override: None,
            },
            OvertakeState::SteeringLeft { .. } => GuidanceDecision {
                target_speed: self.config.overtake_speed,
                steer_override: Some(self.config.steer_left),
            },
            OvertakeState::Straightening { .. } => GuidanceDecision {
                target_speed: self.config.overtake_speed,
                steer_override: Some(0.0),
            },
            OvertakeState::SteeringRight { .. } => GuidanceDecision {
                target_speed: self.config.overtake_speed,
                steer_override: Some(self.config.steer_right),
            },
        }
    }

    /// 経過時間を加算し、継続時間を超えた分は次の状態に持ち越す
    fn advance(&mut self, dt: Duration) {
        let mut carry = dt;

        loop {
            let (elapsed, limit) = match self.state {
                OvertakeState::Following => return,
                OvertakeState::SteeringLeft { elapsed } => (elapsed, self.durations.steer_left),
                OvertakeState::Straightening { elapsed } => (elapsed, self.durations.straight),
                OvertakeState::SteeringRight { elapsed } => (elapsed, self.durations.steer_right),
            };
            let total = elapsed + carry;

            if total < limit {
                self.set_elapsed(total);
                return;
            }

            carry = total - limit;
            let previous = self.state;
            self.state = match previous {
                OvertakeState::SteeringLeft { .. } => OvertakeState::Straightening { elapsed: Duration::ZERO },
                OvertakeState::Straightening { .. } => OvertakeState::SteeringRight { elapsed: Duration::ZERO },
                _ => OvertakeState::Following,
            };

            debug!(
                previous_state = previous.name(),
                current_state = self.state.name(),
                "OVERTAKE_PHASE_TRANSITION: 追い越しフェーズが切り替わりました"
            );

            if self.state == OvertakeState::Following {
                self.completed += 1;
                info!(
                    completed = self.completed,
                    target_speed = self.config.cruise_speed,
                    "OVERTAKE_COMPLETE: 追い越しを完了し経路追従に戻ります"
                );
                return;
            }
        }
    }

    fn set_elapsed(&mut self, total: Duration) {
        self.state = match self.state {
            OvertakeState::SteeringLeft { .. } => OvertakeState::SteeringLeft { elapsed: total },
            OvertakeState::Straightening { .. } => OvertakeState::Straightening { elapsed: total },
            OvertakeState::SteeringRight { .. } => OvertakeState::SteeringRight { elapsed: total },
            OvertakeState::Following => OvertakeState::Following,
        };
    }
}
