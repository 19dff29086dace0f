//! # pathguide
//!
//! 経路追従と時間制御による追い越しを行う車両誘導ライブラリです。
//!
//! - [`models`]: 幾何ユーティリティ、経路、速度制御、追い越し状態機械、外部インターフェース
//! - [`controller`]: ティック駆動の閉ループ制御
//! - [`sim_world`]: 外部シミュレータの代わりに注入できる運動学モデルのワールド
//! - [`scenario`] / [`simulation`]: YAMLシナリオの読み込みと実行
//! - [`logging`]: tracingによるログ出力の初期化

pub mod controller;
pub mod logging;
pub mod models;
pub mod scenario;
pub mod sim_world;
pub mod simulation;
