//! End-to-end acquisition against the simulated tuner
//!
//! Drives the plugin through the host call sequence: init, stream, stop,
//! join, cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use rtlsdr_plugin::{
    AdapterConfig, Error, MockConfig, MockDriver, Normalization, RtlSdrPlugin, RunState,
    StatusCode,
};

fn fast_config() -> AdapterConfig {
    AdapterConfig {
        settle_delay: Duration::ZERO,
        ..Default::default()
    }
}

#[test]
fn test_init_stream_stop_cleanup() {
    let driver = MockDriver::new(MockConfig::default());
    let plugin = RtlSdrPlugin::new(driver.clone(), fast_config());

    plugin.init("--rate=2048000 --index=0").expect("init failed");
    assert_eq!(plugin.state(), RunState::Configured);
    assert_eq!(plugin.sample_rate().unwrap(), 2_048_000);

    let (tx, rx) = bounded::<usize>(64);
    let started = Instant::now();
    let handle = plugin
        .start(move |samples: &[f32], _dropped: u64| {
            let _ = tx.try_send(samples.len());
        })
        .expect("start failed");
    assert_eq!(plugin.state(), RunState::Streaming);

    let len = rx
        .recv_timeout(Duration::from_secs(1))
        .expect("no buffer within 1 second");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(len, handle.buffer_len());
    assert_eq!(len, 245_760);

    plugin.stop().expect("stop failed");
    assert_eq!(plugin.state(), RunState::Stopped);
    assert!(handle.wait(Duration::from_secs(1)), "loop did not exit");
    handle.join().expect("join failed");

    plugin.cleanup();
    assert_eq!(plugin.state(), RunState::Closed);
    assert!(!driver.is_open(0));
}

#[test]
fn test_init_waits_for_settle_delay() {
    let plugin = RtlSdrPlugin::new(
        MockDriver::new(MockConfig::default()),
        AdapterConfig {
            settle_delay: Duration::from_millis(50),
            ..Default::default()
        },
    );
    let started = Instant::now();
    plugin.init("--rate=2048000").unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(plugin.state(), RunState::Configured);
}

#[test]
fn test_read_async_blocks_until_stop_from_other_thread() {
    let plugin = Arc::new(RtlSdrPlugin::new(
        MockDriver::new(MockConfig::default()),
        AdapterConfig {
            callback_interval: Duration::from_millis(10),
            ..fast_config()
        },
    ));
    plugin.init("--rate 1024000").unwrap();

    let delivered = Arc::new(AtomicU64::new(0));
    let reader = {
        let plugin = plugin.clone();
        let delivered = delivered.clone();
        thread::spawn(move || {
            plugin.read_async(move |samples: &[f32], _: u64| {
                assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        })
    };

    let deadline = Instant::now() + Duration::from_secs(1);
    while delivered.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "no buffers delivered");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!reader.is_finished());

    plugin.stop().unwrap();
    assert!(plugin.wait_stopped(Duration::from_secs(1)));
    reader.join().unwrap().unwrap();
    plugin.cleanup();
}

#[test]
fn test_stop_immediately_after_start() {
    let plugin = RtlSdrPlugin::new(MockDriver::new(MockConfig::default()), fast_config());
    plugin.init("--rate=2048000").unwrap();

    for _ in 0..3 {
        let handle = plugin.start(|_: &[f32], _: u64| {}).unwrap();
        plugin.stop().unwrap();
        // 60 ms buffers: a handful of intervals is plenty
        assert!(handle.wait(Duration::from_millis(500)));
    }
    plugin.cleanup();
    plugin.cleanup();
}

#[test]
fn test_dropped_samples_counted_not_fatal() {
    let plugin = RtlSdrPlugin::new(
        MockDriver::new(MockConfig {
            realtime: false,
            drop_every: Some(2),
            fail_read_after: Some(6),
            ..Default::default()
        }),
        fast_config(),
    );
    plugin.init("--rate=1024000").unwrap();

    let flagged = Arc::new(AtomicU64::new(0));
    let flagged_cb = flagged.clone();
    let result = plugin.read_async(move |_: &[f32], dropped: u64| {
        if dropped > 0 {
            flagged_cb.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert!(matches!(result, Err(Error::Driver(_))));

    let stats = plugin.stats().unwrap();
    assert_eq!(stats.buffers_delivered, 6);
    assert_eq!(stats.dropped_buffers, 3);
    assert_eq!(flagged.load(Ordering::SeqCst), 3);
}

#[test]
fn test_drop_tolerance_suppresses_counting() {
    let plugin = RtlSdrPlugin::new(
        MockDriver::new(MockConfig {
            realtime: false,
            drop_every: Some(1),
            fail_read_after: Some(4),
            ..Default::default()
        }),
        AdapterConfig {
            drop_tolerance: 0.9,
            ..fast_config()
        },
    );
    plugin.init("").unwrap();
    let _ = plugin.read_async(|_: &[f32], _: u64| {});
    let stats = plugin.stats().unwrap();
    assert_eq!(stats.buffers_delivered, 4);
    assert_eq!(stats.dropped_buffers, 0);
}

#[test]
fn test_legacy_scaling_mode() {
    let plugin = RtlSdrPlugin::new(
        MockDriver::new(MockConfig {
            realtime: false,
            fail_read_after: Some(1),
            ..Default::default()
        }),
        AdapterConfig {
            normalization: Normalization::Legacy,
            ..fast_config()
        },
    );
    plugin.init("--rate=1024000").unwrap();
    let _ = plugin.read_async(|samples: &[f32], _: u64| {
        assert!(samples.iter().all(|s| (-127.0..=-124.9).contains(s)));
    });
}

#[test]
fn test_status_codes_for_host() {
    let plugin = RtlSdrPlugin::new(MockDriver::new(MockConfig::default()), fast_config());
    let result = plugin.init("--rate=2048000 --unknown=1");
    assert_eq!(
        StatusCode::from_result(&result),
        StatusCode::PluginParametersWrong
    );

    let result = plugin.init("--index=5");
    assert_eq!(StatusCode::from_result(&result), StatusCode::CannotOpenDevice);

    let result = plugin.init("--rate=2048000");
    assert_eq!(StatusCode::from_result(&result), StatusCode::Ok);
}
