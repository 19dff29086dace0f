//! # Simulation モジュール
//!
//! シナリオ設定から経路・ワールド・制御ループを組み立てて実行する
//! オーケストレーション層です。
//!
//! 制御ループ自体は外部インターフェースにしか依存しないため、ここでは
//! 運動学モデルのワールド（`sim_world`）を外部シミュレータの代わりに注入します。
//! ループが終了した後は、成功・失敗・中断のいずれでも停止指令を送ります。
//!
//! ## 実行手順
//!
//! 1. **経路生成**: シナリオの経路設定からウェイポイント列を作成
//! 2. **ワールド構築**: 自車と障害車両を経路上に配置
//! 3. **制御ループ実行**: 最大時間・Ctrl-C・致命的エラーのいずれかまで
//! 4. **停止処理**: 停止指令の送信と結果のログ出力
//!
//! ## 使用例
//!
//! ```no_run
//! use pathguide::simulation::SimulationEngine;
//! use pathguide::scenario::ScenarioConfig;
//!
//! let config = ScenarioConfig::from_file("scenarios/overtake_straight.yaml")?;
//! let mut engine = SimulationEngine::new(config, 1);
//! engine.initialize()?;
//! let report = engine.run()?;
//! println!("{} ticks", report.ticks);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::controller::{ControlLoop, LoopStats};
use crate::models::*;
use crate::scenario::ScenarioConfig;
use crate::sim_world::{KinematicWorld, SimulatedClock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// シミュレーション結果
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub ticks: u64,
    pub overtakes_completed: u32,
    pub cancelled: bool,
    pub elapsed_s: f64,
    pub final_pose: Pose,
    pub final_speed_kmh: f64,
    /// 終了時点の経路からの距離（m）
    pub final_path_offset_m: f64,
    pub final_command: ControlCommand,
}

pub struct SimulationEngine {
    pub scenario_config: ScenarioConfig,
    pub verbose_level: u8,

    path: Option<Path>,
    world: Option<KinematicWorld>,
}

impl SimulationEngine {
    pub fn new(scenario: ScenarioConfig, verbose_level: u8) -> Self {
        Self {
            scenario_config: scenario,
            verbose_level,
            path: None,
            world: None,
        }
    }

    pub fn ego_id(&self) -> ActorId {
        ActorId(self.scenario_config.ego.id)
    }

    pub fn obstacle_id(&self) -> Option<ActorId> {
        self.scenario_config.obstacle.as_ref().map(|o| ActorId(o.id))
    }

    pub fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.verbose_level > 0 {
            info!("シミュレーションを初期化中...");
        }

        let path = self.initialize_route()?;
        let world = self.initialize_world(&path);

        if self.verbose_level > 0 {
            info!("初期化完了:");
            info!("  ウェイポイント: {}点 (全長 {:.1}m)", path.len(), path.total_length());
            info!("  障害車両: {}", if self.obstacle_id().is_some() { "あり" } else { "なし" });
        }

        self.path = Some(path);
        self.world = Some(world);
        Ok(())
    }

    fn initialize_route(&self) -> Result<Path, Box<dyn std::error::Error>> {
        let path = self.scenario_config.route.build_path()?;

        if self.verbose_level > 1 {
            let first = path.first().position();
            let last = path.last().position();
            debug!(
                "経路生成: ({:.1}, {:.1}) → ({:.1}, {:.1})",
                first.x, first.y, last.x, last.y
            );
        }

        Ok(path)
    }

    fn initialize_world(&self, path: &Path) -> KinematicWorld {
        let ego = &self.scenario_config.ego;
        let ego_pose = path.pose_at_distance(ego.start_offset_m);
        let world = KinematicWorld::new(
            self.ego_id(),
            ego_pose,
            ego.initial_speed_kmh,
            self.scenario_config.dynamics.clone(),
        );

        if !self.scenario_config.lights.is_empty() {
            world.set_light_schedule(self.scenario_config.lights.clone());
            if !self.scenario_config.control.obey_traffic_lights {
                warn!("信号の切り替え表がありますが control.obey_traffic_lights が無効です");
            }
        }

        if let Some(obstacle) = &self.scenario_config.obstacle {
            world.add_obstacle(ActorId(obstacle.id), path.clone(), obstacle.start_offset_m, obstacle.speed_kmh);

            if self.verbose_level > 1 {
                debug!(
                    "障害車両配置: actor#{} (始点から {:.1}m, {:.1}km/h)",
                    obstacle.id, obstacle.start_offset_m, obstacle.speed_kmh
                );
            }
        }

        world
    }

    /// シミュレーションを実行
    ///
    /// tokioランタイムを作成し、制御ループが終了するまでブロックします。
    pub fn run(&mut self) -> Result<SimulationReport, Box<dyn std::error::Error>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        runtime.block_on(self.run_async())
    }

    /// 非同期コンテキスト内でシミュレーションを実行
    pub async fn run_async(&mut self) -> Result<SimulationReport, Box<dyn std::error::Error>> {
        let (path, world) = match (&self.path, &self.world) {
            (Some(path), Some(world)) => (path.clone(), world.clone()),
            _ => return Err("initialize() が呼ばれていません".into()),
        };

        info!("=== シミュレーション実行開始 ===");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("ユーザー中断を受け付けました。制御ループを停止します");
                let _ = cancel_tx.send(true);
            }
        });

        let result = self.drive(path.clone(), world.clone(), cancel_rx).await;
        signal_task.abort();

        // 終了理由にかかわらず停止指令を送る
        let mut actuator = world.clone();
        actuator.apply_control(self.ego_id(), ControlCommand::stop());
        info!(vehicle_id = %self.ego_id(), "VEHICLE_STOP: 停止指令を送信しました");

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                error!("シミュレーションが異常終了しました: {}", e);
                return Err(e);
            }
        };

        let report = self.build_report(&path, &world, stats);

        info!("=== シミュレーション完了 ===");
        info!("実行時間: {:.1}秒", report.elapsed_s);
        info!("総ティック数: {}", report.ticks);
        info!("追い越し完了回数: {}", report.overtakes_completed);
        info!(
            "最終位置: ({:.1}, {:.1}) 速度 {:.1}km/h 経路からの距離 {:.2}m",
            report.final_pose.position.x,
            report.final_pose.position.y,
            report.final_speed_kmh,
            report.final_path_offset_m
        );

        Ok(report)
    }

    async fn drive(
        &self,
        path: Path,
        world: KinematicWorld,
        cancel: watch::Receiver<bool>,
    ) -> Result<LoopStats, Box<dyn std::error::Error>> {
        let scenario = &self.scenario_config;
        let mut control = ControlLoop::new(
            scenario.control.clone(),
            scenario.guidance.clone(),
            path,
            world.clone(),
            world.clone(),
            self.ego_id(),
            self.obstacle_id(),
        )?;

        let mut clock = SimulatedClock::new(world, scenario.control.tick_period(), scenario.sim.realtime);
        let stats = control.run(&mut clock, cancel, Some(scenario.max_ticks())).await?;
        Ok(stats)
    }

    fn build_report(&self, path: &Path, world: &KinematicWorld, stats: LoopStats) -> SimulationReport {
        let ego = world.ego_snapshot();
        let nearest = path.nearest(ego.pose.position).position();

        SimulationReport {
            ticks: stats.ticks,
            overtakes_completed: stats.overtakes_completed,
            cancelled: stats.cancelled,
            elapsed_s: ego.time_s,
            final_pose: ego.pose,
            final_speed_kmh: ego.speed_kmh,
            final_path_offset_m: distance(ego.pose.position, nearest),
            final_command: ego.command,
        }
    }
}
