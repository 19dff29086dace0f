use crate::models::common::{ActorId, ControlCommand, Pose};
use crate::models::signal::TrafficLightState;
use std::fmt;
use std::time::Duration;

/// 外部ワールドへの問い合わせエラー
#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    /// アクターが存在しない（致命的）
    ActorNotFound(ActorId),
    /// 一時的に利用できない（再試行可能）
    Unavailable(String),
}

impl QueryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Unavailable(_))
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::ActorNotFound(id) => write!(f, "アクターが存在しません: {}", id),
            QueryError::Unavailable(msg) => write!(f, "ワールドに一時的に接続できません: {}", msg),
        }
    }
}

impl std::error::Error for QueryError {}

/// ワールド／車両状態の問い合わせインターフェース
///
/// 各呼び出しは最新のスナップショットを返す必要があります。
// 制御ループは単一タスク上でジェネリクス経由で使うため、Send境界は要求しない
#[allow(async_fn_in_trait)]
pub trait IWorldQuery {
    /// 車両の姿勢を取得
    async fn get_vehicle_pose(&self, id: ActorId) -> Result<Pose, QueryError>;

    /// 車両の速さを取得（km/h）
    async fn get_vehicle_speed(&self, id: ActorId) -> Result<f64, QueryError>;

    /// 障害車両の姿勢を取得（存在しない場合はNone）
    async fn get_obstacle_pose(&self, id: ActorId) -> Result<Option<Pose>, QueryError>;

    /// 車両前方の信号状態を取得
    async fn get_traffic_light_state(&self, _id: ActorId) -> Result<Option<TrafficLightState>, QueryError> {
        Ok(None)
    }
}

/// 車両アクチュエータのインターフェース
///
/// 送りっぱなしで、応答は待ちません。
pub trait IActuator {
    fn apply_control(&mut self, id: ActorId, command: ControlCommand);
}

/// ティック時計のインターフェース
///
/// 実時間でもステップ実行の時間でもよく、次のティック境界まで待って
/// 前ティックからの経過時間を返します。
#[allow(async_fn_in_trait)]
pub trait ITickClock {
    async fn next_tick(&mut self) -> Duration;
}
