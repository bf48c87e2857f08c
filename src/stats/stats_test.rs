use std::time::{Duration, Instant};

use super::*;

#[test]
fn test_stats_rolling_bytes() {
    let now = Instant::now();
    let mut info = StatsInfo::default();

    info.add_packet(100, now);
    info.add_packet(200, now + Duration::from_millis(500));
    assert_eq!(info.packets, 2);
    assert_eq!(info.bytes, 300);
    assert_eq!(info.bytes_lastsec, 100);

    // Second boundary: the accumulated temp rolls over.
    info.add_packet(50, now + Duration::from_millis(1100));
    assert_eq!(info.bytes_lastsec, 250);
    assert_eq!(info.bytes, 350);
}

#[test]
fn test_direction_stats_layers() {
    let now = Instant::now();
    let mut stats = DirectionStats::default();
    stats.info_mut(false, 0).add_packet(10, now);
    stats.info_mut(true, 1).add_packet(20, now);
    stats.info_mut(true, 7).add_packet(30, now); // clamped to the top layer
    stats.data.add_packet(5, now);

    assert_eq!(stats.audio.bytes, 10);
    assert_eq!(stats.video[1].bytes, 20);
    assert_eq!(stats.video[2].bytes, 30);
    assert_eq!(stats.total_bytes(), 65);
    assert!(stats.last_activity().is_some());
}

#[test]
fn test_slow_link_fires_once_per_interval() {
    let tunables = SlowLinkTunables {
        nack_threshold: 20,
        window: Duration::from_secs(2),
        min_interval: Duration::from_secs(60),
    };
    let now = Instant::now();
    let mut sl = SlowLinkState::default();

    // 21 NACKs inside a 2 second window: exactly one notification.
    let mut fired = 0;
    for i in 0..21 {
        if sl.register_nacks(1, now + Duration::from_millis(i * 90), &tunables) {
            fired += 1;
        }
    }
    assert_eq!(fired, 1);

    // Another burst right after stays latched by the minimum interval.
    for i in 0..40 {
        assert!(!sl.register_nacks(1, now + Duration::from_millis(2000 + i * 10), &tunables));
    }

    // After the interval expires a new burst may fire again.
    let later = now + Duration::from_secs(63);
    let mut fired = 0;
    for i in 0..25 {
        if sl.register_nacks(1, later + Duration::from_millis(i * 10), &tunables) {
            fired += 1;
        }
    }
    assert_eq!(fired, 1);
}

#[test]
fn test_slow_link_window_expires() {
    let tunables = SlowLinkTunables {
        nack_threshold: 10,
        window: Duration::from_secs(2),
        min_interval: Duration::from_secs(60),
    };
    let now = Instant::now();
    let mut sl = SlowLinkState::default();

    // NACKs spread too thin never cross the threshold.
    for i in 0..30 {
        assert!(!sl.register_nacks(1, now + Duration::from_secs(i * 3), &tunables));
    }
}
