//! Blinker LED indication
//!
//! While the drive is exported, the blinker LEDs are driven as a visual
//! indicator through the LED service's fade queue. Continuous on is
//! distinguishable from the normal parked state.

use tracing::warn;

use crate::bus::BusClient;

/// Queue consumed by the LED service
pub const LED_FADE_QUEUE: &str = "scooter:led:fade";

/// Fade curve indices (from /usr/share/led-curves/fades/)
const FADE_SMOOTH_ON: u8 = 0;
const FADE_SMOOTH_OFF: u8 = 1;

/// Blinker channels used as UMS indicators
const BLINKER_CHANNELS: [u8; 4] = [3, 4, 6, 7];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedPattern {
    /// Drive exported, host may be connected
    UmsActive,
    /// First disconnect in ums-by-dbc mode, waiting for the host PC
    WaitingForHost,
    /// Back to normal
    Off,
}

impl LedPattern {
    fn lit(self) -> &'static [u8] {
        match self {
            LedPattern::UmsActive => &[3, 4, 6, 7],
            LedPattern::WaitingForHost => &[3, 4],
            LedPattern::Off => &[],
        }
    }
}

fn fade_for(pattern: LedPattern, channel: u8) -> u8 {
    if pattern.lit().contains(&channel) {
        FADE_SMOOTH_ON
    } else {
        FADE_SMOOTH_OFF
    }
}

fn fade_message(channel: u8, fade: u8) -> String {
    format!("{channel}:{fade}")
}

/// Push the fade for every blinker channel. Errors are logged only; LED
/// indication never blocks a mode transition.
pub async fn apply(bus: &BusClient, pattern: LedPattern) {
    for channel in BLINKER_CHANNELS {
        let message = fade_message(channel, fade_for(pattern, channel));
        if let Err(e) = bus.push(LED_FADE_QUEUE, &message).await {
            warn!("failed to set LED channel {channel}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ums_active_lights_all_blinkers() {
        for channel in BLINKER_CHANNELS {
            assert_eq!(fade_for(LedPattern::UmsActive, channel), FADE_SMOOTH_ON);
        }
    }

    #[test]
    fn test_waiting_pattern_lights_front_pair() {
        assert_eq!(fade_for(LedPattern::WaitingForHost, 3), FADE_SMOOTH_ON);
        assert_eq!(fade_for(LedPattern::WaitingForHost, 4), FADE_SMOOTH_ON);
        assert_eq!(fade_for(LedPattern::WaitingForHost, 6), FADE_SMOOTH_OFF);
        assert_eq!(fade_for(LedPattern::WaitingForHost, 7), FADE_SMOOTH_OFF);
    }

    #[test]
    fn test_off_pattern() {
        for channel in BLINKER_CHANNELS {
            assert_eq!(fade_for(LedPattern::Off, channel), FADE_SMOOTH_OFF);
        }
    }

    #[test]
    fn test_fade_message_format() {
        assert_eq!(fade_message(3, 0), "3:0");
        assert_eq!(fade_message(7, 1), "7:1");
    }
}
