use clap::{Arg, Command};
use pathguide::logging::{LogConfig, LogOutput, init_logging, level_for_verbosity};
use pathguide::scenario::ScenarioConfig;
use pathguide::simulation::{SimulationEngine, SimulationReport};
use std::str::FromStr;

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("pathguide")
        .version("0.1.0")
        .about("経路追従・追い越し誘導 (Path Guide)")
        .long_about("ティック駆動の閉ループ車両誘導システム\n\
                     経路上の最近傍ウェイポイントへの操舵と、時間制御の追い越し操作を行います。")
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .long_help("実行するシナリオファイル(.yaml)のパスを指定します。\n\
                           指定しない場合、利用可能なシナリオの一覧を表示します。")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
                .conflicts_with("test")
        )
        .arg(
            Arg::new("test")
                .short('t')
                .long("test")
                .action(clap::ArgAction::SetTrue)
                .help("組み込みのデモシナリオを実行")
                .conflicts_with("info")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: 基本, -vv: 詳細, -vvv: ティックごとのトレース)")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("ログレベル (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("OUTPUT")
                .default_value("console")
                .help("ログ出力先 (console, file, both)")
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .default_value("logs")
                .help("ログファイルの出力ディレクトリ")
        )
        .get_matches();

    println!("経路追従・追い越し誘導 (Path Guide) - pathguide v0.1.0");
    println!();

    // 詳細レベルの設定
    let verbose_level = matches.get_count("verbose");

    // ログの初期化
    let log_output = match matches.get_one::<String>("log-output").map(|s| LogOutput::from_str(s)) {
        Some(Ok(output)) => output,
        Some(Err(e)) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
        None => LogOutput::Console,
    };
    let log_config = LogConfig {
        level: level_for_verbosity(verbose_level, matches.get_one::<String>("log-level").map(String::as_str)),
        output: log_output,
        log_dir: matches
            .get_one::<String>("log-dir")
            .cloned()
            .unwrap_or_else(|| "logs".to_string()),
        ..LogConfig::default()
    };
    let log_guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("エラー: ログの初期化に失敗しました: {}", e);
            std::process::exit(1);
        }
    };

    if verbose_level > 0 {
        println!("詳細出力レベル: {}", verbose_level);
    }

    let result = if matches.get_flag("test") {
        println!("=== デモシナリオ実行モード ===");
        execute_scenario(ScenarioConfig::default_demo(), verbose_level)
    } else if let Some(scenario_path) = matches.get_one::<String>("scenario") {
        run_scenario(scenario_path, matches.get_flag("info"), verbose_level)
    } else {
        // デフォルト動作: 利用可能なシナリオ一覧を表示
        show_default_help();
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("エラー: {}", e);
        // プロセス終了前にファイルログを書き出す
        drop(log_guard);
        std::process::exit(1);
    }

    if verbose_level > 0 {
        println!("シナリオ実行が正常に完了しました。");
    }
}

/// シナリオファイルを読み込んで実行
fn run_scenario(scenario_path: &str, info_only: bool, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    // シナリオファイルの読み込み
    let scenario = ScenarioConfig::from_file(scenario_path)?;

    if verbose_level > 0 {
        println!("シナリオファイル読み込み完了: {}", scenario_path);
    }

    // 情報表示のみの場合
    if info_only {
        scenario.print_summary();
        return Ok(());
    }

    execute_scenario(scenario, verbose_level)
}

/// シナリオの実行
fn execute_scenario(scenario: ScenarioConfig, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    // 基本情報表示
    scenario.print_summary();
    println!();

    if verbose_level > 0 {
        println!("制御設定:");
        println!("  問い合わせタイムアウト: {}ミリ秒 (最大{}回)", scenario.control.query_timeout_ms, scenario.control.query_attempts);
        println!("  操舵ゲイン: {:.2}", scenario.control.steer_gain);
        println!("  信号に従う: {}", if scenario.control.obey_traffic_lights { "はい" } else { "いいえ" });
        println!();
    }

    // シミュレーションエンジンの作成と初期化
    let mut simulation = SimulationEngine::new(scenario, verbose_level);
    simulation.initialize()?;

    // シミュレーション実行
    let report = simulation.run()?;
    print_report(&report);

    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!();
    println!("=== 実行結果 ===");
    println!("ティック数: {}{}", report.ticks, if report.cancelled { " (中断)" } else { "" });
    println!("経過時間: {:.1}秒", report.elapsed_s);
    println!("追い越し完了: {}回", report.overtakes_completed);
    println!(
        "最終位置: ({:.1}, {:.1}) 方位 {:.1}度",
        report.final_pose.position.x, report.final_pose.position.y, report.final_pose.yaw_deg
    );
    println!("最終速度: {:.1}km/h", report.final_speed_kmh);
    println!("経路からの距離: {:.2}m", report.final_path_offset_m);
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  pathguide [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>     シナリオファイルを指定して実行");
    println!("  -i, --info                シナリオ情報のみ表示");
    println!("  -t, --test                組み込みのデモシナリオを実行");
    println!("  -v, --verbose             詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-level <LEVEL>   ログレベルを指定");
    println!("      --log-output <OUTPUT> ログ出力先 (console, file, both)");
    println!("      --log-dir <DIR>       ログファイルの出力ディレクトリ");
    println!("  -h, --help                このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/overtake_straight.yaml  - 直線路での追い越し");
    println!("  scenarios/curve_follow.yaml       - 曲線路の追従");
    println!("  scenarios/red_light_stop.yaml     - 赤信号での停止");
    println!();
    println!("例:");
    println!("  pathguide -s scenarios/overtake_straight.yaml");
    println!("  pathguide -s scenarios/curve_follow.yaml -vv");
    println!("  pathguide -s scenarios/overtake_straight.yaml -i");
    println!("  pathguide --test --log-output both");
}
