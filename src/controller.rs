//! # Controller モジュール
//!
//! 経路追従と追い越しを行う閉ループ制御の中核です。
//!
//! 固定周期のティックごとに外部ワールドから車両・障害車両の状態を取得し、
//! 操舵・速度を計算して1つのアクチュエーション指令を送ります。
//!
//! ## ティック処理順序
//!
//! 1. **状態取得**: 車両姿勢・速さ・障害車両姿勢（タイムアウト付き、再試行あり）
//! 2. **最近傍探索**: 経路上の最も近いウェイポイント
//! 3. **操舵角計算**: 車両の向きとウェイポイント方向のなす角
//! 4. **追い越し判断**: 状態機械を経過時間だけ進める
//! 5. **操舵決定**: オーバーライドがあれば置き換え
//! 6. **速度制御**: スロットル／ブレーキ（信号オーバーライドは任意）
//! 7. **指令送信**: 1ティックにつき1回だけ
//!
//! ティックは厳密に逐次処理され、前ティックの指令送信前に次のティックは始まりません。
//! キャンセルはティック間で受け付け、終了後は指令を送りません。最後の指令を
//! 解除するのは呼び出し側（停止指令の送信）の責務です。

use crate::models::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// 制御ループ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// ティック周期（ミリ秒）
    pub tick_period_ms: u64,
    /// 問い合わせ1回あたりのタイムアウト（ミリ秒）
    pub query_timeout_ms: u64,
    /// 1ティック内での問い合わせ試行回数
    pub query_attempts: u32,
    /// 経路追従時の操舵角（ラジアン）から操舵入力への倍率
    pub steer_gain: f64,
    /// 操舵目標を最近傍から何点先にずらすか（0なら最近傍そのもの）
    pub lookahead_waypoints: usize,
    /// 速度制御方式
    pub speed_policy: SpeedPolicy,
    /// 信号に従って制動するか
    pub obey_traffic_lights: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            query_timeout_ms: 500,
            query_attempts: 3,
            steer_gain: 1.0,
            lookahead_waypoints: 0,
            speed_policy: SpeedPolicy::default(),
            obey_traffic_lights: false,
        }
    }
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tick_period_ms == 0 {
            return Err("tick_period_ms must be positive".to_string());
        }
        if self.query_timeout_ms == 0 {
            return Err("query_timeout_ms must be positive".to_string());
        }
        if self.query_attempts == 0 {
            return Err("query_attempts must be at least 1".to_string());
        }
        if !self.steer_gain.is_finite() {
            return Err("steer_gain must be finite".to_string());
        }
        Ok(())
    }
}

/// 制御ループのエラー
#[derive(Debug, Clone, PartialEq)]
pub enum ControlError {
    /// 設定不正（ループ開始前）
    InvalidConfig(String),
    /// 開始時に車両を問い合わせできない
    InvalidActor(ActorId, String),
    /// 走行中にアクターが消失した
    ActorLost(ActorId),
    /// ワールドが有限でない状態を返した
    InvalidState(ActorId, String),
    /// 再試行しても問い合わせに失敗した
    QueryFailed { what: &'static str, attempts: u32, last: QueryError },
    /// 再試行しても問い合わせがタイムアウトした
    QueryTimeout { what: &'static str, attempts: u32 },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidConfig(msg) => write!(f, "制御設定エラー: {}", msg),
            ControlError::InvalidActor(id, reason) => {
                write!(f, "車両 {} を取得できません: {}", id, reason)
            }
            ControlError::ActorLost(id) => write!(f, "アクター {} が消失しました", id),
            ControlError::InvalidState(id, what) => {
                write!(f, "アクター {} の状態が不正です: {}", id, what)
            }
            ControlError::QueryFailed { what, attempts, last } => {
                write!(f, "{} の取得に {} 回失敗しました: {}", what, attempts, last)
            }
            ControlError::QueryTimeout { what, attempts } => {
                write!(f, "{} の取得が {} 回タイムアウトしました", what, attempts)
            }
        }
    }
}

impl std::error::Error for ControlError {}

/// ループ実行結果の統計
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStats {
    pub ticks: u64,
    pub overtakes_completed: u32,
    pub last_command: Option<ControlCommand>,
    pub cancelled: bool,
}

/// 経路追従・追い越し制御ループ
///
/// 問い合わせとアクチュエータはコンストラクタで注入されます。
/// ループが所有し変更する状態は追い越し状態機械と統計だけです。
pub struct ControlLoop<W, A> {
    config: ControlConfig,
    path: Path,
    world: W,
    actuator: A,
    vehicle_id: ActorId,
    obstacle_id: Option<ActorId>,
    machine: OvertakeMachine,
    speed: SpeedController,
    tick_count: u64,
    last_command: Option<ControlCommand>,
}

impl<W: IWorldQuery, A: IActuator> ControlLoop<W, A> {
    /// 新しい制御ループを作成
    ///
    /// # 引数
    ///
    /// * `config` - ループ設定
    /// * `overtake` - 追い越しパラメータ
    /// * `path` - 事前に構築された経路
    /// * `world` - 状態問い合わせ
    /// * `actuator` - 指令送信先
    /// * `vehicle_id` - 制御対象の車両
    /// * `obstacle_id` - 追い越し対象（なければNone）
    pub fn new(
        config: ControlConfig,
        overtake: OvertakeConfig,
        path: Path,
        world: W,
        actuator: A,
        vehicle_id: ActorId,
        obstacle_id: Option<ActorId>,
    ) -> Result<Self, ControlError> {
        config.validate().map_err(ControlError::InvalidConfig)?;
        let machine = OvertakeMachine::new(overtake).map_err(ControlError::InvalidConfig)?;

        if obstacle_id == Some(vehicle_id) {
            return Err(ControlError::InvalidConfig(format!(
                "障害車両と制御対象が同じアクターです: {}",
                vehicle_id
            )));
        }

        let speed = SpeedController::new(config.speed_policy);

        Ok(Self {
            config,
            path,
            world,
            actuator,
            vehicle_id,
            obstacle_id,
            machine,
            speed,
            tick_count: 0,
            last_command: None,
        })
    }

    pub fn state(&self) -> OvertakeState {
        self.machine.state()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn last_command(&self) -> Option<ControlCommand> {
        self.last_command
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self, cancelled: bool) -> LoopStats {
        LoopStats {
            ticks: self.tick_count,
            overtakes_completed: self.machine.completed(),
            last_command: self.last_command,
            cancelled,
        }
    }

    /// 開始前に制御対象の車両を問い合わせられることを確認
    pub async fn verify_actors(&self) -> Result<(), ControlError> {
        let id = self.vehicle_id;
        let world = &self.world;
        self.query("vehicle_pose", move || world.get_vehicle_pose(id))
            .await
            .map(|_| ())
            .map_err(|e| ControlError::InvalidActor(id, e.to_string()))
    }

    /// 1ティック分の処理を行い、送信した指令を返す
    ///
    /// # 引数
    ///
    /// * `dt` - 前ティックからの経過時間
    pub async fn tick(&mut self, dt: Duration) -> Result<ControlCommand, ControlError> {
        // 1. 状態取得
        let id = self.vehicle_id;
        let world = &self.world;
        let pose = self.query("vehicle_pose", move || world.get_vehicle_pose(id)).await?;
        let speed = self.query("vehicle_speed", move || world.get_vehicle_speed(id)).await?;
        let obstacle = match self.obstacle_id {
            Some(obstacle_id) => {
                self.query("obstacle_pose", move || world.get_obstacle_pose(obstacle_id)).await?
            }
            None => None,
        };
        let light = if self.config.obey_traffic_lights {
            self.query("traffic_light", move || world.get_traffic_light_state(id)).await?
        } else {
            None
        };

        // 不正な状態からは指令を作らない
        if !pose.position.is_finite() || !pose.yaw_deg.is_finite() {
            return Err(ControlError::InvalidState(id, format!("姿勢が有限値ではありません: {:?}", pose)));
        }
        if !speed.is_finite() {
            return Err(ControlError::InvalidState(id, format!("速さが有限値ではありません: {}", speed)));
        }
        if let (Some(obstacle_id), Some(obstacle_pose)) = (self.obstacle_id, obstacle) {
            if !obstacle_pose.position.is_finite() {
                return Err(ControlError::InvalidState(
                    obstacle_id,
                    format!("障害車両の位置が有限値ではありません: {:?}", obstacle_pose.position),
                ));
            }
        }

        // 2. 最近傍ウェイポイント
        let nearest_index = self.path.nearest_index(pose.position);
        let target_index = (nearest_index + self.config.lookahead_waypoints).min(self.path.len() - 1);
        let target = self.path.waypoints()[target_index];

        // 3. 経路追従の操舵角
        let base_angle = steering_angle(&pose, target.position());

        // 4. 追い越し判断
        let decision = self.machine.update(dt, pose.position, obstacle.map(|o| o.position));

        // 5. 操舵決定
        let steer = decision
            .steer_override
            .unwrap_or(base_angle * self.config.steer_gain);

        // 6. 速度制御
        let (mut throttle, mut brake) = self.speed.command(speed, decision.target_speed);
        if let Some((signal_throttle, signal_brake)) = signal_override(light) {
            if (throttle, brake) != (signal_throttle, signal_brake) {
                debug!(
                    vehicle_id = %self.vehicle_id,
                    light = ?light,
                    "TRAFFIC_LIGHT_OVERRIDE: 信号により制動します"
                );
            }
            throttle = signal_throttle;
            brake = signal_brake;
        }

        // 7. 指令送信
        let command = ControlCommand::new(throttle, brake, steer);
        self.actuator.apply_control(self.vehicle_id, command);

        self.tick_count += 1;
        self.last_command = Some(command);

        trace!(
            tick = self.tick_count,
            vehicle_id = %self.vehicle_id,
            position_x = pose.position.x,
            position_y = pose.position.y,
            yaw_deg = pose.yaw_deg,
            speed_kmh = speed,
            nearest_index = nearest_index,
            target_index = target_index,
            base_angle_deg = math_utils::rad_to_deg(base_angle),
            state = self.machine.state().name(),
            target_speed = decision.target_speed,
            throttle = command.throttle,
            brake = command.brake,
            steer = command.steer,
            "CONTROL_TICK: 指令を送信しました"
        );

        Ok(command)
    }

    /// キャンセルされるまで（または `max_ticks` に達するまで）ループを実行
    ///
    /// 開始前に車両の存在を確認し、失敗した場合は1ティックも実行しません。
    /// キャンセルはティック境界の待ちと競合させ、処理中のティックは完了させます。
    pub async fn run<C: ITickClock>(
        &mut self,
        clock: &mut C,
        mut cancel: watch::Receiver<bool>,
        max_ticks: Option<u64>,
    ) -> Result<LoopStats, ControlError> {
        self.verify_actors().await?;

        info!(
            vehicle_id = %self.vehicle_id,
            obstacle_id = ?self.obstacle_id,
            waypoints = self.path.len(),
            tick_period_ms = self.config.tick_period_ms,
            "CONTROL_LOOP_START: 制御ループを開始します"
        );

        let mut cancel_open = true;
        let mut cancelled = false;

        loop {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }
            if max_ticks.is_some_and(|max| self.tick_count >= max) {
                break;
            }

            let dt = tokio::select! {
                biased;
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                    continue;
                }
                dt = clock.next_tick() => dt,
            };

            if let Err(e) = self.tick(dt).await {
                error!(
                    vehicle_id = %self.vehicle_id,
                    tick = self.tick_count,
                    error = %e,
                    "CONTROL_LOOP_ABORT: 制御ループを中断しました"
                );
                return Err(e);
            }
        }

        info!(
            vehicle_id = %self.vehicle_id,
            ticks = self.tick_count,
            overtakes_completed = self.machine.completed(),
            cancelled = cancelled,
            "CONTROL_LOOP_STOP: 制御ループを終了しました"
        );

        Ok(self.stats(cancelled))
    }

    /// タイムアウトと再試行付きの問い合わせ
    ///
    /// 一時的な失敗とタイムアウトは `query_attempts` 回まで再試行し、
    /// アクター消失は即座に致命的エラーにします。
    async fn query<T, F, Fut>(&self, what: &'static str, mut call: F) -> Result<T, ControlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let attempts = self.config.query_attempts.max(1);
        let timeout = self.config.query_timeout();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(QueryError::ActorNotFound(actor))) => {
                    return Err(ControlError::ActorLost(actor));
                }
                Ok(Err(e)) => {
                    warn!(
                        query = what,
                        attempt = attempt,
                        attempts = attempts,
                        error = %e,
                        "QUERY_RETRY: 問い合わせに失敗したため再試行します"
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        query = what,
                        attempt = attempt,
                        attempts = attempts,
                        timeout_ms = self.config.query_timeout_ms,
                        "QUERY_RETRY: 問い合わせがタイムアウトしたため再試行します"
                    );
                    last_error = None;
                }
            }
        }

        Err(match last_error {
            Some(last) => ControlError::QueryFailed { what, attempts, last },
            None => ControlError::QueryTimeout { what, attempts },
        })
    }
}

/// 実時間の固定周期ティック時計
///
/// tokioランタイム内で作成してください。最初のティックは即座に返り、
/// 経過時間として周期を返します。
pub struct IntervalClock {
    interval: Interval,
    period: Duration,
    last: Option<Instant>,
}

impl IntervalClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period, last: None }
    }
}

impl ITickClock for IntervalClock {
    async fn next_tick(&mut self) -> Duration {
        let now = self.interval.tick().await;
        let dt = match self.last {
            Some(previous) => now - previous,
            None => self.period,
        };
        self.last = Some(now);
        dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    const VEHICLE: ActorId = ActorId(1);
    const OBSTACLE: ActorId = ActorId(2);
    const TICK: Duration = Duration::from_millis(100);

    /// 台本どおりの状態を返すテスト用ワールド
    #[derive(Default)]
    struct ScriptedWorld {
        poses: RefCell<VecDeque<Pose>>,
        last_pose: Cell<Option<Pose>>,
        speed: f64,
        obstacle: Option<Pose>,
        light: Option<TrafficLightState>,
        speed_failures: Cell<u32>,
        hang_speed: bool,
        vanish_when_exhausted: bool,
    }

    impl ScriptedWorld {
        fn holding(pose: Pose, speed: f64) -> Self {
            Self {
                last_pose: Cell::new(Some(pose)),
                speed,
                ..Self::default()
            }
        }
    }

    impl IWorldQuery for ScriptedWorld {
        async fn get_vehicle_pose(&self, id: ActorId) -> Result<Pose, QueryError> {
            if let Some(pose) = self.poses.borrow_mut().pop_front() {
                self.last_pose.set(Some(pose));
                return Ok(pose);
            }
            if self.vanish_when_exhausted {
                return Err(QueryError::ActorNotFound(id));
            }
            self.last_pose.get().ok_or(QueryError::ActorNotFound(id))
        }

        async fn get_vehicle_speed(&self, _id: ActorId) -> Result<f64, QueryError> {
            if self.hang_speed {
                std::future::pending::<()>().await;
            }
            let remaining = self.speed_failures.get();
            if remaining > 0 {
                self.speed_failures.set(remaining - 1);
                return Err(QueryError::Unavailable("rpc busy".to_string()));
            }
            Ok(self.speed)
        }

        async fn get_obstacle_pose(&self, _id: ActorId) -> Result<Option<Pose>, QueryError> {
            Ok(self.obstacle)
        }

        async fn get_traffic_light_state(&self, _id: ActorId) -> Result<Option<TrafficLightState>, QueryError> {
            Ok(self.light)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingActuator {
        commands: Rc<RefCell<Vec<ControlCommand>>>,
    }

    impl IActuator for RecordingActuator {
        fn apply_control(&mut self, id: ActorId, command: ControlCommand) {
            assert_eq!(id, VEHICLE);
            self.commands.borrow_mut().push(command);
        }
    }

    /// 固定dtを即座に返すティック時計
    struct StepClock {
        dt: Duration,
        calls: u32,
        cancel_on: Option<(u32, watch::Sender<bool>)>,
    }

    impl StepClock {
        fn new(dt: Duration) -> Self {
            Self { dt, calls: 0, cancel_on: None }
        }
    }

    impl ITickClock for StepClock {
        async fn next_tick(&mut self) -> Duration {
            tokio::task::yield_now().await;
            self.calls += 1;
            if let Some((at, sender)) = &self.cancel_on {
                if self.calls == *at {
                    let _ = sender.send(true);
                }
            }
            self.dt
        }
    }

    fn x_axis_path() -> Path {
        Path::straight(Point3::new(0.0, 0.0, 0.0), 0.0, 2.0, 5).unwrap()
    }

    fn pose(x: f64, y: f64, yaw_deg: f64) -> Pose {
        Pose::new(Point3::new(x, y, 0.0), yaw_deg)
    }

    fn build(
        world: ScriptedWorld,
        config: ControlConfig,
        obstacle: Option<ActorId>,
    ) -> (ControlLoop<ScriptedWorld, RecordingActuator>, Rc<RefCell<Vec<ControlCommand>>>) {
        let actuator = RecordingActuator::default();
        let commands = actuator.commands.clone();
        let control = ControlLoop::new(
            config,
            OvertakeConfig::default(),
            x_axis_path(),
            world,
            actuator,
            VEHICLE,
            obstacle,
        )
        .unwrap();
        (control, commands)
    }

    #[tokio::test]
    async fn test_follows_path_and_accelerates() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        let (mut control, commands) = build(world, ControlConfig::default(), None);

        let command = control.tick(TICK).await.unwrap();
        assert!(command.steer.abs() < 1e-9);
        assert_eq!(command.throttle, 0.5);
        assert_eq!(command.brake, 0.0);
        assert_eq!(commands.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_lookahead_avoids_waypoint_behind() {
        // 最近傍(0,0,0)は後方なので操舵が飽和する
        let world = ScriptedWorld::holding(pose(1.0, 0.0, 0.0), 10.0);
        let (mut control, _) = build(world, ControlConfig::default(), None);
        assert_eq!(control.tick(TICK).await.unwrap().steer, 1.0);

        let world = ScriptedWorld::holding(pose(1.0, 0.0, 0.0), 10.0);
        let config = ControlConfig { lookahead_waypoints: 1, ..ControlConfig::default() };
        let (mut control, _) = build(world, config, None);
        assert!(control.tick(TICK).await.unwrap().steer.abs() < 1e-9);

        // 経路終端を越えるずらしは最後の点に丸める
        let world = ScriptedWorld::holding(pose(7.0, 0.0, 0.0), 10.0);
        let config = ControlConfig { lookahead_waypoints: 10, ..ControlConfig::default() };
        let (mut control, _) = build(world, config, None);
        assert!(control.tick(TICK).await.unwrap().steer.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_brakes_above_cruise() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 40.0);
        let (mut control, _) = build(world, ControlConfig::default(), None);

        let command = control.tick(TICK).await.unwrap();
        assert_eq!((command.throttle, command.brake), (0.0, 0.3));
    }

    #[tokio::test]
    async fn test_steers_toward_offset_path() {
        // 経路の右側(-y)にいて+x向きなら、経路に戻るため正の操舵
        let world = ScriptedWorld::holding(pose(4.0, -1.0, 0.0), 10.0);
        let (mut control, _) = build(world, ControlConfig::default(), None);
        let command = control.tick(TICK).await.unwrap();
        assert!(command.steer > 0.0);
        assert!(command.steer <= 1.0);
    }

    #[tokio::test]
    async fn test_overtake_scenario() {
        let mut world = ScriptedWorld::holding(pose(1.0, 0.0, 0.0), 40.0);
        world.obstacle = Some(pose(6.0, 0.0, 0.0));
        let (mut control, _) = build(world, ControlConfig::default(), Some(OBSTACLE));

        let command = control.tick(TICK).await.unwrap();
        assert!(matches!(control.state(), OvertakeState::SteeringLeft { .. }));
        assert_eq!(command.steer, -0.3);
        // 目標50km/hに対し40km/hなので加速
        assert_eq!((command.throttle, command.brake), (0.5, 0.0));

        for _ in 0..10 {
            control.tick(TICK).await.unwrap();
        }
        assert!(matches!(control.state(), OvertakeState::Straightening { .. }));
        assert_eq!(control.last_command().unwrap().steer, 0.0);

        for _ in 0..20 {
            control.tick(TICK).await.unwrap();
        }
        assert!(matches!(control.state(), OvertakeState::SteeringRight { .. }));
        assert_eq!(control.last_command().unwrap().steer, 0.3);

        for _ in 0..9 {
            control.tick(TICK).await.unwrap();
        }
        assert!(matches!(control.state(), OvertakeState::SteeringRight { .. }));
        let command = control.tick(TICK).await.unwrap();
        // 経路追従に戻った直後は再判定されないので、まだFollowing
        assert_eq!(control.state(), OvertakeState::Following);
        assert_eq!((command.throttle, command.brake), (0.0, 0.3));
        assert_eq!(control.stats(false).overtakes_completed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_at_max_ticks() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let (_tx, rx) = watch::channel(false);
        let mut clock = StepClock::new(TICK);

        let stats = control.run(&mut clock, rx, Some(5)).await.unwrap();
        assert_eq!(stats.ticks, 5);
        assert!(!stats.cancelled);
        assert_eq!(commands.borrow().len(), 5);
    }

    #[tokio::test]
    async fn test_run_cancellation_between_ticks() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let (tx, rx) = watch::channel(false);
        let mut clock = StepClock::new(TICK);
        clock.cancel_on = Some((3, tx));

        let stats = control.run(&mut clock, rx, None).await.unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.ticks, 3);
        assert_eq!(commands.borrow().len(), 3);
    }

    #[tokio::test]
    async fn test_run_cancelled_before_start_issues_nothing() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let mut clock = StepClock::new(TICK);

        let stats = control.run(&mut clock, rx, None).await.unwrap();
        assert!(stats.cancelled);
        assert!(commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        world.speed_failures.set(2);
        let (mut control, commands) = build(world, ControlConfig::default(), None);

        assert!(control.tick(TICK).await.is_ok());
        assert_eq!(commands.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_stops_loop() {
        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        world.speed_failures.set(10);
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let (_tx, rx) = watch::channel(false);
        let mut clock = StepClock::new(TICK);

        let err = control.run(&mut clock, rx, None).await.unwrap_err();
        assert!(matches!(err, ControlError::QueryFailed { what: "vehicle_speed", attempts: 3, .. }));
        assert!(commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_hanging_query_times_out() {
        let mut world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        world.hang_speed = true;
        let config = ControlConfig {
            query_timeout_ms: 10,
            query_attempts: 2,
            ..ControlConfig::default()
        };
        let (mut control, commands) = build(world, config, None);

        let err = control.tick(TICK).await.unwrap_err();
        assert_eq!(err, ControlError::QueryTimeout { what: "vehicle_speed", attempts: 2 });
        assert!(commands.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_actor_is_fatal() {
        let world = ScriptedWorld {
            poses: RefCell::new(VecDeque::from(vec![
                pose(0.5, 0.0, 0.0),
                pose(1.0, 0.0, 0.0),
                pose(1.5, 0.0, 0.0),
            ])),
            speed: 10.0,
            vanish_when_exhausted: true,
            ..ScriptedWorld::default()
        };
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let (_tx, rx) = watch::channel(false);
        let mut clock = StepClock::new(TICK);

        // 1つ目の姿勢は開始前の確認で消費される
        let err = control.run(&mut clock, rx, None).await.unwrap_err();
        assert_eq!(err, ControlError::ActorLost(VEHICLE));
        assert_eq!(commands.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_vehicle_rejected_before_start() {
        let world = ScriptedWorld::default();
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let (_tx, rx) = watch::channel(false);
        let mut clock = StepClock::new(TICK);

        let err = control.run(&mut clock, rx, None).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidActor(VEHICLE, _)));
        assert!(commands.borrow().is_empty());
        assert_eq!(clock.calls, 0);
    }

    #[tokio::test]
    async fn test_non_finite_state_is_rejected() {
        let world = ScriptedWorld::holding(pose(f64::NAN, 0.0, 0.0), 10.0);
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        let err = control.tick(TICK).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidState(VEHICLE, _)));
        assert!(commands.borrow().is_empty());

        let world = ScriptedWorld::holding(pose(1.5, 0.0, f64::INFINITY), 10.0);
        let (mut control, _) = build(world, ControlConfig::default(), None);
        assert!(matches!(control.tick(TICK).await, Err(ControlError::InvalidState(VEHICLE, _))));

        let world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), f64::NAN);
        let (mut control, commands) = build(world, ControlConfig::default(), None);
        assert!(matches!(control.tick(TICK).await, Err(ControlError::InvalidState(VEHICLE, _))));
        assert!(commands.borrow().is_empty());

        let mut world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        world.obstacle = Some(pose(f64::NAN, 0.0, 0.0));
        let (mut control, commands) = build(world, ControlConfig::default(), Some(OBSTACLE));
        let err = control.tick(TICK).await.unwrap_err();
        assert!(matches!(err, ControlError::InvalidState(OBSTACLE, _)));
        assert!(commands.borrow().is_empty());
        assert_eq!(control.tick_count(), 0);
    }

    #[tokio::test]
    async fn test_red_light_overrides_throttle() {
        let mut world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        world.light = Some(TrafficLightState::Red);
        let config = ControlConfig { obey_traffic_lights: true, ..ControlConfig::default() };
        let (mut control, _) = build(world, config, None);

        let command = control.tick(TICK).await.unwrap();
        assert_eq!((command.throttle, command.brake), (0.0, 1.0));
    }

    #[tokio::test]
    async fn test_lights_ignored_by_default() {
        let mut world = ScriptedWorld::holding(pose(1.5, 0.0, 0.0), 10.0);
        world.light = Some(TrafficLightState::Red);
        let (mut control, _) = build(world, ControlConfig::default(), None);

        let command = control.tick(TICK).await.unwrap();
        assert_eq!((command.throttle, command.brake), (0.5, 0.0));
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let result = ControlLoop::new(
            ControlConfig::default(),
            OvertakeConfig::default(),
            x_axis_path(),
            ScriptedWorld::default(),
            RecordingActuator::default(),
            VEHICLE,
            Some(VEHICLE),
        );
        assert!(matches!(result, Err(ControlError::InvalidConfig(_))));

        let result = ControlLoop::new(
            ControlConfig { tick_period_ms: 0, ..ControlConfig::default() },
            OvertakeConfig::default(),
            x_axis_path(),
            ScriptedWorld::default(),
            RecordingActuator::default(),
            VEHICLE,
            None,
        );
        assert!(matches!(result, Err(ControlError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_interval_clock_reports_period() {
        let mut clock = IntervalClock::new(Duration::from_millis(5));
        assert_eq!(clock.next_tick().await, Duration::from_millis(5));
        assert!(clock.next_tick().await >= Duration::from_millis(4));
    }
}
