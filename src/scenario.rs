use crate::controller::ControlConfig;
use crate::models::{OvertakeConfig, Path, PathError, Point3};
use crate::sim_world::{LightEvent, VehicleDynamics};
use serde::{Deserialize, Serialize};
use std::fs;

/// シナリオメタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    pub description: String,
}

/// シミュレーション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    pub t_max_s: f64,
    /// 実時間に合わせてティックを待つか
    #[serde(default)]
    pub realtime: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Position3D {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
}

impl Position3D {
    pub fn to_point(&self) -> Point3 {
        Point3::new(self.x_m, self.y_m, self.z_m)
    }
}

/// 経路設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub start: Position3D,
    pub heading_deg: f64,
    pub spacing_m: f64,
    pub length_m: f64,
    /// 曲率（1/m）、0なら直線
    #[serde(default)]
    pub curvature_per_m: f64,
}

impl RouteConfig {
    pub fn waypoint_count(&self) -> usize {
        (self.length_m / self.spacing_m).ceil().max(1.0) as usize
    }

    /// 経路を生成
    pub fn build_path(&self) -> Result<Path, PathError> {
        Path::arc(
            self.start.to_point(),
            self.heading_deg,
            self.spacing_m,
            self.waypoint_count(),
            self.curvature_per_m,
        )
    }
}

/// 自車設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EgoConfig {
    pub id: u32,
    /// 経路始点からの配置位置（m）
    pub start_offset_m: f64,
    pub initial_speed_kmh: f64,
}

/// 障害車両（追い越し対象）設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObstacleConfig {
    pub id: u32,
    pub start_offset_m: f64,
    pub speed_kmh: f64,
}

/// 完全なシナリオ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub sim: SimulationConfig,
    pub route: RouteConfig,
    pub ego: EgoConfig,
    #[serde(default)]
    pub obstacle: Option<ObstacleConfig>,
    #[serde(default)]
    pub guidance: OvertakeConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub dynamics: VehicleDynamics,
    /// 自車前方の信号の切り替え表
    #[serde(default)]
    pub lights: Vec<LightEvent>,
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        // ファイル存在チェック
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        // ファイル読み込み
        let contents = fs::read_to_string(path)
            .map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        // YAML解析
        let config: ScenarioConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;

        // 基本的な検証
        config.validate()?;

        Ok(config)
    }

    /// 組み込みのデモシナリオ
    ///
    /// 直線200mの経路上、前方30mに10km/hで走る障害車両を追い越します。
    pub fn default_demo() -> Self {
        Self {
            meta: ScenarioMeta {
                version: "1.0".to_string(),
                name: "built-in overtake demo".to_string(),
                description: "直線路で低速の先行車を追い越す".to_string(),
            },
            sim: SimulationConfig { t_max_s: 30.0, realtime: false },
            route: RouteConfig {
                start: Position3D { x_m: 0.0, y_m: 0.0, z_m: 0.0 },
                heading_deg: 0.0,
                spacing_m: 2.0,
                length_m: 200.0,
                curvature_per_m: 0.0,
            },
            ego: EgoConfig { id: 1, start_offset_m: 0.0, initial_speed_kmh: 0.0 },
            obstacle: Some(ObstacleConfig { id: 2, start_offset_m: 30.0, speed_kmh: 10.0 }),
            guidance: OvertakeConfig::default(),
            control: ControlConfig { lookahead_waypoints: 2, ..ControlConfig::default() },
            dynamics: VehicleDynamics::default(),
            lights: Vec::new(),
        }
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        // 時間設定の検証
        if !(self.sim.t_max_s > 0.0) {
            return Err(ScenarioError::ValidationError("t_max_s must be positive".to_string()));
        }

        // 経路設定の検証
        if !(self.route.spacing_m > 0.0) {
            return Err(ScenarioError::ValidationError("route.spacing_m must be positive".to_string()));
        }
        if !(self.route.length_m > 0.0) {
            return Err(ScenarioError::ValidationError("route.length_m must be positive".to_string()));
        }
        if self.ego.start_offset_m < 0.0 || self.ego.start_offset_m > self.route.length_m {
            return Err(ScenarioError::ValidationError("ego.start_offset_m outside route".to_string()));
        }

        // 障害車両の検証
        if let Some(obstacle) = &self.obstacle {
            if obstacle.id == self.ego.id {
                return Err(ScenarioError::ValidationError(format!(
                    "obstacle id {} must differ from ego id",
                    obstacle.id
                )));
            }
            if obstacle.start_offset_m < 0.0 || obstacle.start_offset_m > self.route.length_m {
                return Err(ScenarioError::ValidationError("obstacle.start_offset_m outside route".to_string()));
            }
            if obstacle.speed_kmh < 0.0 {
                return Err(ScenarioError::ValidationError("obstacle.speed_kmh must be non-negative".to_string()));
            }
        }

        self.guidance.validate().map_err(ScenarioError::ValidationError)?;
        self.control.validate().map_err(ScenarioError::ValidationError)?;
        self.dynamics.validate().map_err(ScenarioError::ValidationError)?;
        for event in &self.lights {
            event.validate().map_err(ScenarioError::ValidationError)?;
        }

        Ok(())
    }

    /// 最大ティック数
    pub fn max_ticks(&self) -> u64 {
        (self.sim.t_max_s * 1000.0 / self.control.tick_period_ms as f64).ceil() as u64
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("ティック周期: {}ミリ秒", self.control.tick_period_ms);
        println!("最大時間: {:.1}秒 ({}ティック)", self.sim.t_max_s, self.max_ticks());
        println!("実時間同期: {}", if self.sim.realtime { "有効" } else { "無効" });
        println!();

        println!("=== 経路 ===");
        println!("長さ: {:.1}m (間隔 {:.1}m, {}点)", self.route.length_m, self.route.spacing_m, self.route.waypoint_count());
        println!("曲率: {:.4} 1/m", self.route.curvature_per_m);
        println!();

        println!("=== 誘導設定 ===");
        println!("巡航速度: {:.1}km/h", self.guidance.cruise_speed);
        println!("追い越し速度: {:.1}km/h", self.guidance.overtake_speed);
        println!("追い越し開始距離: {:.1}m", self.guidance.trigger_distance);
        println!(
            "操舵: 左 {:+.2} ({:.1}秒) → 直進 ({:.1}秒) → 右 {:+.2} ({:.1}秒)",
            self.guidance.steer_left,
            self.guidance.steer_left_s,
            self.guidance.straight_s,
            self.guidance.steer_right,
            self.guidance.steer_right_s
        );
        println!();

        match &self.obstacle {
            Some(obstacle) => println!(
                "障害車両: actor#{} (始点から {:.1}m, {:.1}km/h)",
                obstacle.id, obstacle.start_offset_m, obstacle.speed_kmh
            ),
            None => println!("障害車両: なし"),
        }

        if !self.lights.is_empty() {
            println!();
            println!(
                "=== 信号 ({}) ===",
                if self.control.obey_traffic_lights { "従う" } else { "無視" }
            );
            for event in &self.lights {
                println!("  {:.1}秒: {:?}", event.at_s, event.state);
            }
        }
    }
}

/// シナリオ読み込みエラー
#[derive(Debug)]
pub enum ScenarioError {
    FileNotFound(std::path::PathBuf),
    IoError(std::path::PathBuf, std::io::Error),
    ParseError(std::path::PathBuf, serde_yaml::Error),
    ValidationError(String),
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::FileNotFound(path) => {
                write!(f, "シナリオファイルが見つかりません: {}", path.display())
            }
            ScenarioError::IoError(path, err) => {
                write!(f, "ファイル読み込みエラー {}: {}", path.display(), err)
            }
            ScenarioError::ParseError(path, err) => {
                write!(f, "YAML解析エラー {}: {}", path.display(), err)
            }
            ScenarioError::ValidationError(msg) => {
                write!(f, "設定検証エラー: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScenarioError {}
