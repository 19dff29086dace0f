// 基本的なデータ型と幾何ユーティリティ
pub mod common;

// 外部インターフェース（trait）定義
pub mod traits;

// 誘導ロジックの各要素
pub mod path;
pub mod speed;
pub mod overtake;
pub mod signal;

// 便利な re-export
pub use common::*;
pub use traits::*;
pub use path::{Path, PathError, Waypoint, plan_route};
pub use speed::{SpeedController, SpeedPolicy, speed_command, T_ACCEL, T_BRAKE};
pub use overtake::{GuidanceDecision, OvertakeConfig, OvertakeMachine, OvertakeState, PhaseDurations};
pub use signal::{TrafficLightState, signal_override};
