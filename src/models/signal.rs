use serde::{Deserialize, Serialize};

/// 車両前方の信号状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficLightState {
    Red,
    Yellow,
    Green,
    Off,
}

/// 信号による縦方向のオーバーライド
///
/// 赤は全制動、黄は軽い制動で停止に備えます。青・消灯・信号なしでは
/// 速度コントローラの出力をそのまま使います。スロットルとブレーキは
/// ここでも同時に正にしません。
pub fn signal_override(state: Option<TrafficLightState>) -> Option<(f64, f64)> {
    match state {
        Some(TrafficLightState::Red) => Some((0.0, 1.0)),
        Some(TrafficLightState::Yellow) => Some((0.0, 0.3)),
        Some(TrafficLightState::Green) | Some(TrafficLightState::Off) | None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_override() {
        assert_eq!(signal_override(Some(TrafficLightState::Red)), Some((0.0, 1.0)));
        assert_eq!(signal_override(Some(TrafficLightState::Yellow)), Some((0.0, 0.3)));
        assert_eq!(signal_override(Some(TrafficLightState::Green)), None);
        assert_eq!(signal_override(None), None);
    }
}
