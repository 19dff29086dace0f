//! # Sim World モジュール
//!
//! 外部シミュレータの代わりに使う、簡易な運動学モデルのワールドです。
//! 問い合わせ・アクチュエータ両方のインターフェースを実装するので、
//! シナリオファイルだけで制御ループを動かせます。
//!
//! 車両はキネマティック自転車モデルで動きます（タイヤ力や荷重移動は扱いません）。
//! 障害車両は経路に沿って一定速度で走行します。
//! ワールドはステップ実行で、`SimulatedClock` がティックごとに `dt` だけ進めます。
//! 自車前方の信号は時刻つきの切り替え表に従って変化します。

use crate::controller::IntervalClock;
use crate::models::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// 自車の運動パラメータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VehicleDynamics {
    /// フルスロットル時の加速度（m/s²）
    pub max_accel_mps2: f64,
    /// フルブレーキ時の減速度（m/s²）
    pub max_decel_mps2: f64,
    /// 操舵入力1.0に対応する前輪舵角（度）
    pub max_steer_deg: f64,
    /// ホイールベース（m）
    pub wheelbase_m: f64,
    /// 速度に比例する抵抗係数（1/s）
    pub drag_per_s: f64,
}

impl Default for VehicleDynamics {
    fn default() -> Self {
        Self {
            max_accel_mps2: 4.0,
            max_decel_mps2: 8.0,
            max_steer_deg: 35.0,
            wheelbase_m: 2.8,
            drag_per_s: 0.05,
        }
    }
}

impl VehicleDynamics {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.wheelbase_m > 0.0) {
            return Err("wheelbase_m must be positive".to_string());
        }
        if self.max_accel_mps2 < 0.0 || self.max_decel_mps2 < 0.0 || self.drag_per_s < 0.0 {
            return Err("dynamics coefficients must be non-negative".to_string());
        }
        if !(0.0..90.0).contains(&self.max_steer_deg) {
            return Err("max_steer_deg must be within [0, 90)".to_string());
        }
        Ok(())
    }
}

/// 信号の切り替えイベント
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct LightEvent {
    /// 切り替え時刻（シミュレーション開始からの秒）
    pub at_s: f64,
    pub state: TrafficLightState,
}

impl LightEvent {
    pub fn validate(&self) -> Result<(), String> {
        if !self.at_s.is_finite() || self.at_s < 0.0 {
            return Err(format!("light event time must be non-negative: {}", self.at_s));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct EgoVehicle {
    id: ActorId,
    pose: Pose,
    speed_mps: f64,
    command: ControlCommand,
}

#[derive(Debug, Clone)]
struct ObstacleVehicle {
    id: ActorId,
    route: Path,
    distance_m: f64,
    speed_mps: f64,
}

impl ObstacleVehicle {
    fn pose(&self) -> Pose {
        self.route.pose_at_distance(self.distance_m)
    }
}

#[derive(Debug)]
struct WorldState {
    time_s: f64,
    dynamics: VehicleDynamics,
    ego: EgoVehicle,
    obstacle: Option<ObstacleVehicle>,
    light: Option<TrafficLightState>,
    light_schedule: Vec<LightEvent>,
}

impl WorldState {
    /// 現在時刻までに到来した最後のイベントを信号に反映
    fn apply_light_schedule(&mut self) {
        let time_s = self.time_s;
        if let Some(event) = self.light_schedule.iter().rev().find(|e| e.at_s <= time_s) {
            if self.light != Some(event.state) {
                debug!(
                    time_s = time_s,
                    light = ?event.state,
                    "TRAFFIC_LIGHT_CHANGE: 信号が切り替わりました"
                );
            }
            self.light = Some(event.state);
        }
    }
}

/// 運動学モデルのワールド
///
/// クローンは同じ状態を共有するハンドルです。
#[derive(Debug, Clone)]
pub struct KinematicWorld {
    state: Arc<Mutex<WorldState>>,
}

/// 外部から観測できる自車の状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EgoSnapshot {
    pub pose: Pose,
    pub speed_kmh: f64,
    pub command: ControlCommand,
    pub time_s: f64,
}

impl KinematicWorld {
    /// 自車を配置してワールドを作成
    pub fn new(ego_id: ActorId, ego_pose: Pose, ego_speed_kmh: f64, dynamics: VehicleDynamics) -> Self {
        let ego = EgoVehicle {
            id: ego_id,
            pose: ego_pose,
            speed_mps: math_utils::kmh_to_mps(ego_speed_kmh).max(0.0),
            command: ControlCommand::new(0.0, 0.0, 0.0),
        };

        Self {
            state: Arc::new(Mutex::new(WorldState {
                time_s: 0.0,
                dynamics,
                ego,
                obstacle: None,
                light: None,
                light_schedule: Vec::new(),
            })),
        }
    }

    /// 経路上を一定速度で走る障害車両を追加
    pub fn add_obstacle(&self, id: ActorId, route: Path, start_distance_m: f64, speed_kmh: f64) {
        let mut state = self.lock();
        state.obstacle = Some(ObstacleVehicle {
            id,
            route,
            distance_m: start_distance_m.max(0.0),
            speed_mps: math_utils::kmh_to_mps(speed_kmh).max(0.0),
        });
    }

    /// 障害車両を取り除く
    pub fn remove_obstacle(&self) {
        self.lock().obstacle = None;
    }

    /// 自車前方の信号状態を設定
    pub fn set_traffic_light(&self, light: Option<TrafficLightState>) {
        self.lock().light = light;
    }

    /// 信号の切り替え表を設定し、現在時刻までの分を即座に反映
    pub fn set_light_schedule(&self, mut events: Vec<LightEvent>) {
        events.sort_by(|a, b| a.at_s.total_cmp(&b.at_s));
        let mut state = self.lock();
        state.light_schedule = events;
        state.apply_light_schedule();
    }

    pub fn traffic_light(&self) -> Option<TrafficLightState> {
        self.lock().light
    }

    pub fn ego_snapshot(&self) -> EgoSnapshot {
        let state = self.lock();
        EgoSnapshot {
            pose: state.ego.pose,
            speed_kmh: state.ego.speed_mps * 3.6,
            command: state.ego.command,
            time_s: state.time_s,
        }
    }

    pub fn obstacle_pose(&self) -> Option<Pose> {
        self.lock().obstacle.as_ref().map(|o| o.pose())
    }

    /// 最後に受け取った指令を保ったまま `dt` だけ時間を進める
    pub fn step(&self, dt: Duration) {
        let dt_s = dt.as_secs_f64();
        let mut state = self.lock();
        let dynamics = state.dynamics.clone();
        let ego = &mut state.ego;

        // 縦方向
        let accel = ego.command.throttle * dynamics.max_accel_mps2
            - ego.command.brake * dynamics.max_decel_mps2
            - dynamics.drag_per_s * ego.speed_mps;
        ego.speed_mps = (ego.speed_mps + accel * dt_s).max(0.0);

        // 横方向（キネマティック自転車モデル）
        let steer_angle = math_utils::deg_to_rad(ego.command.steer * dynamics.max_steer_deg);
        let yaw_rate = ego.speed_mps / dynamics.wheelbase_m * steer_angle.tan();
        let yaw_deg = math_utils::normalize_angle(ego.pose.yaw_deg + math_utils::rad_to_deg(yaw_rate * dt_s));
        ego.pose.yaw_deg = yaw_deg;

        let (fx, fy) = ego.pose.forward_xy();
        ego.pose.position = ego.pose.position + Point3::new(fx, fy, 0.0) * (ego.speed_mps * dt_s);

        if let Some(obstacle) = state.obstacle.as_mut() {
            obstacle.distance_m += obstacle.speed_mps * dt_s;
        }
        state.time_s += dt_s;
        state.apply_light_schedule();

        trace!(
            time_s = state.time_s,
            ego_x = state.ego.pose.position.x,
            ego_y = state.ego.pose.position.y,
            ego_yaw_deg = state.ego.pose.yaw_deg,
            ego_speed_mps = state.ego.speed_mps,
            "WORLD_STEP: ワールドを進めました"
        );
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        // 保持中にパニックしても状態は整合しているので、そのまま使う
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IWorldQuery for KinematicWorld {
    async fn get_vehicle_pose(&self, id: ActorId) -> Result<Pose, QueryError> {
        let state = self.lock();
        if state.ego.id != id {
            return Err(QueryError::ActorNotFound(id));
        }
        Ok(state.ego.pose)
    }

    async fn get_vehicle_speed(&self, id: ActorId) -> Result<f64, QueryError> {
        let state = self.lock();
        if state.ego.id != id {
            return Err(QueryError::ActorNotFound(id));
        }
        // 運動はXY平面のみなので速度ベクトルはヨー方向
        let (fx, fy) = state.ego.pose.forward_xy();
        Ok(speed_kmh(fx * state.ego.speed_mps, fy * state.ego.speed_mps, 0.0))
    }

    async fn get_obstacle_pose(&self, id: ActorId) -> Result<Option<Pose>, QueryError> {
        let state = self.lock();
        Ok(state.obstacle.as_ref().filter(|o| o.id == id).map(|o| o.pose()))
    }

    async fn get_traffic_light_state(&self, id: ActorId) -> Result<Option<TrafficLightState>, QueryError> {
        let state = self.lock();
        if state.ego.id != id {
            return Err(QueryError::ActorNotFound(id));
        }
        Ok(state.light)
    }
}

impl IActuator for KinematicWorld {
    fn apply_control(&mut self, id: ActorId, command: ControlCommand) {
        let mut state = self.lock();
        if state.ego.id == id {
            state.ego.command = command;
        }
    }
}

/// ワールドをステップ実行するティック時計
///
/// ティックごとにワールドを `dt` 進めます。`realtime` が有効なら
/// [`IntervalClock`] で実時間の周期にも合わせます。ワールドを進めるのは待ちの後なので、
/// キャンセルされた待ちでワールドが進むことはありません。
pub struct SimulatedClock {
    world: KinematicWorld,
    dt: Duration,
    pacer: Option<IntervalClock>,
    realtime: bool,
    started: bool,
}

impl SimulatedClock {
    pub fn new(world: KinematicWorld, dt: Duration, realtime: bool) -> Self {
        Self { world, dt, pacer: None, realtime, started: false }
    }
}

impl ITickClock for SimulatedClock {
    async fn next_tick(&mut self) -> Duration {
        if self.realtime {
            // intervalはランタイム内でしか作れないので最初の待ちで作る
            let dt = self.dt;
            let pacer = self.pacer.get_or_insert_with(|| IntervalClock::new(dt));
            pacer.next_tick().await;
        } else {
            tokio::task::yield_now().await;
        }

        // 最初のティックは初期状態をそのまま観測させる
        if self.started {
            self.world.step(self.dt);
        }
        self.started = true;
        self.dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EGO: ActorId = ActorId(7);
    const TICK: Duration = Duration::from_millis(100);

    fn world_at_origin(speed_kmh: f64) -> KinematicWorld {
        KinematicWorld::new(EGO, Pose::new(Point3::new(0.0, 0.0, 0.0), 0.0), speed_kmh, VehicleDynamics::default())
    }

    #[test]
    fn test_throttle_accelerates_straight() {
        let mut world = world_at_origin(0.0);
        world.apply_control(EGO, ControlCommand::new(1.0, 0.0, 0.0));
        for _ in 0..10 {
            world.step(TICK);
        }
        let ego = world.ego_snapshot();
        assert!(ego.speed_kmh > 10.0);
        assert!(ego.pose.position.x > 0.0);
        assert!(ego.pose.position.y.abs() < 1e-9);
        assert!((ego.time_s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_brake_never_reverses() {
        let mut world = world_at_origin(10.0);
        world.apply_control(EGO, ControlCommand::stop());
        for _ in 0..50 {
            world.step(TICK);
        }
        assert_eq!(world.ego_snapshot().speed_kmh, 0.0);
    }

    #[test]
    fn test_positive_steer_increases_yaw() {
        let mut world = world_at_origin(30.0);
        world.apply_control(EGO, ControlCommand::new(0.0, 0.0, 0.3));
        world.step(TICK);
        assert!(world.ego_snapshot().pose.yaw_deg > 0.0);

        world.apply_control(EGO, ControlCommand::new(0.0, 0.0, -1.0));
        for _ in 0..5 {
            world.step(TICK);
        }
        assert!(world.ego_snapshot().pose.yaw_deg < 0.0);
    }

    #[test]
    fn test_obstacle_moves_along_route() {
        let world = world_at_origin(0.0);
        let route = Path::straight(Point3::new(0.0, 0.0, 0.0), 0.0, 2.0, 50).unwrap();
        world.add_obstacle(ActorId(8), route, 20.0, 36.0);
        world.step(Duration::from_secs(1));

        let pose = world.obstacle_pose().unwrap();
        assert!((pose.position.x - 30.0).abs() < 1e-9);

        world.remove_obstacle();
        assert!(world.obstacle_pose().is_none());
    }

    #[tokio::test]
    async fn test_queries() {
        let world = world_at_origin(36.0);
        let route = Path::straight(Point3::new(0.0, 0.0, 0.0), 0.0, 2.0, 50).unwrap();
        world.add_obstacle(ActorId(8), route, 10.0, 10.0);
        world.set_traffic_light(Some(TrafficLightState::Green));

        assert!((world.get_vehicle_speed(EGO).await.unwrap() - 36.0).abs() < 1e-9);
        assert!(world.get_vehicle_pose(EGO).await.is_ok());
        assert_eq!(
            world.get_vehicle_pose(ActorId(99)).await,
            Err(QueryError::ActorNotFound(ActorId(99)))
        );
        assert!(world.get_obstacle_pose(ActorId(8)).await.unwrap().is_some());
        assert!(world.get_obstacle_pose(ActorId(9)).await.unwrap().is_none());
        assert_eq!(
            world.get_traffic_light_state(EGO).await.unwrap(),
            Some(TrafficLightState::Green)
        );
    }

    #[test]
    fn test_light_schedule_follows_time() {
        let world = world_at_origin(0.0);
        world.set_light_schedule(vec![
            LightEvent { at_s: 1.0, state: TrafficLightState::Red },
            LightEvent { at_s: 0.0, state: TrafficLightState::Green },
            LightEvent { at_s: 2.0, state: TrafficLightState::Green },
        ]);
        assert_eq!(world.traffic_light(), Some(TrafficLightState::Green));

        for _ in 0..10 {
            world.step(TICK);
        }
        assert_eq!(world.traffic_light(), Some(TrafficLightState::Red));

        for _ in 0..10 {
            world.step(TICK);
        }
        assert_eq!(world.traffic_light(), Some(TrafficLightState::Green));

        assert!(LightEvent { at_s: -1.0, state: TrafficLightState::Red }.validate().is_err());
    }

    #[tokio::test]
    async fn test_realtime_clock_paces_and_steps() {
        let world = world_at_origin(36.0);
        let dt = Duration::from_millis(5);
        let mut clock = SimulatedClock::new(world.clone(), dt, true);

        let started = std::time::Instant::now();
        assert_eq!(clock.next_tick().await, dt);
        assert_eq!(clock.next_tick().await, dt);
        assert!(started.elapsed() >= Duration::from_millis(4));
        assert!((world.ego_snapshot().time_s - 0.005).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_simulated_clock_steps_world() {
        let mut world = world_at_origin(36.0);
        world.apply_control(EGO, ControlCommand::new(0.0, 0.0, 0.0));
        let mut clock = SimulatedClock::new(world.clone(), TICK, false);

        assert_eq!(clock.next_tick().await, TICK);
        assert_eq!(world.ego_snapshot().time_s, 0.0);

        clock.next_tick().await;
        let ego = world.ego_snapshot();
        assert!((ego.time_s - 0.1).abs() < 1e-9);
        assert!(ego.pose.position.x > 0.9);
    }
}
