//! Monitor behavior over real time and real processes: grace-period
//! gating, dead-process detection, and recovery relaunch.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use cascade::health::{HealthCheck, HealthMonitor, RecoveryAction, ServiceState};
use cascade::process::ProcessRegistry;

use crate::helpers::sh;

const FAST_TICK: Duration = Duration::from_millis(20);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

fn fast_monitor() -> HealthMonitor {
    HealthMonitor::with_intervals(FAST_TICK, PROBE_TIMEOUT)
}

fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn grace_period_defers_checks_after_ready_confirmation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let check: HealthCheck = {
        let calls = calls.clone();
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        })
    };

    let mut monitor = fast_monitor();
    monitor
        .register_service("backend", check, None, None, Some(Duration::from_millis(400)))
        .unwrap();
    // Readiness confirmed immediately, but the grace period still runs.
    monitor.mark_service_ready("backend", None, &[]);
    monitor.enable_monitoring();
    monitor.start();

    thread::sleep(Duration::from_millis(200));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.service_state("backend"), Some(ServiceState::Ready));

    assert!(wait_for(Duration::from_secs(2), || {
        calls.load(Ordering::SeqCst) > 0
    }));
    monitor.stop();
    assert_eq!(
        monitor.service_state("backend"),
        Some(ServiceState::Monitoring)
    );
}

#[test]
#[serial]
fn dead_process_is_reported_unhealthy() {
    let registry = Arc::new(ProcessRegistry::new());
    registry
        .launch("svc", &sh("sleep 30"), &[], Path::new("."), &[])
        .unwrap();
    let pid = registry.pid("svc");

    let check: HealthCheck = {
        let registry = Arc::clone(&registry);
        Arc::new(move || registry.is_alive("svc"))
    };

    let mut monitor = fast_monitor();
    monitor
        .register_service("svc", check, None, Some(100), Some(Duration::ZERO))
        .unwrap();
    monitor.mark_service_ready("svc", pid, &[]);
    monitor.enable_monitoring();
    monitor.start();

    assert!(wait_for(Duration::from_secs(2), || {
        monitor.service_state("svc") == Some(ServiceState::Monitoring)
    }));
    assert!(monitor.is_healthy("svc"));

    registry.terminate("svc").unwrap();

    assert!(wait_for(Duration::from_secs(2), || !monitor
        .is_healthy("svc")));
    monitor.stop();
    assert!(monitor.was_ever_unhealthy());
    assert!(!monitor.all_healthy());
}

#[test]
#[serial]
fn recovery_action_can_relaunch_the_process() {
    let registry = Arc::new(ProcessRegistry::new());
    registry
        .launch("svc", &sh("sleep 30"), &[], Path::new("."), &[])
        .unwrap();

    let check: HealthCheck = {
        let registry = Arc::clone(&registry);
        Arc::new(move || registry.is_alive("svc"))
    };
    let recoveries = Arc::new(AtomicUsize::new(0));
    let recovery: RecoveryAction = {
        let registry = Arc::clone(&registry);
        let recoveries = recoveries.clone();
        Arc::new(move || {
            recoveries.fetch_add(1, Ordering::SeqCst);
            registry
                .launch("svc", &sh("sleep 30"), &[], Path::new("."), &[])
                .unwrap();
        })
    };

    let mut monitor = fast_monitor();
    monitor
        .register_service("svc", check, Some(recovery), Some(2), Some(Duration::ZERO))
        .unwrap();
    monitor.mark_service_ready("svc", None, &[]);
    monitor.enable_monitoring();
    monitor.start();

    assert!(wait_for(Duration::from_secs(2), || {
        monitor.service_state("svc") == Some(ServiceState::Monitoring)
    }));

    // Kill the process out from under the monitor; two failed checks
    // later the recovery action brings it back.
    registry.terminate("svc").unwrap();
    assert!(wait_for(Duration::from_secs(3), || {
        recoveries.load(Ordering::SeqCst) >= 1 && monitor.is_healthy("svc")
    }));
    monitor.stop();

    assert!(registry.is_alive("svc"));
    assert!(monitor.was_ever_unhealthy());
    registry.terminate_all();
}
