//! Startup sequencing against real child processes and real HTTP
//! endpoints, end to end through the public API.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use cascade::discovery::DiscoveryStore;
use cascade::error::{SequencerError, StageError, StageErrorKind};
use cascade::health::HealthMonitor;
use cascade::process::ProcessRegistry;
use cascade::sequencer::{ReadinessProbe, StageSpec, StartupSequencer};

use crate::helpers::{free_port, sh, spawn_health_endpoint};

fn harness() -> (TempDir, Arc<ProcessRegistry>, HealthMonitor, DiscoveryStore) {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let monitor = HealthMonitor::new();
    let discovery = DiscoveryStore::new(dir.path().join("discovery")).unwrap();
    (dir, registry, monitor, discovery)
}

fn stage(name: &str, probe: ReadinessProbe) -> StageSpec {
    let mut spec = StageSpec::new(name, sh("sleep 30"), free_port());
    spec.readiness = probe;
    spec.readiness_timeout = Duration::from_secs(10);
    spec.grace_period = Duration::ZERO;
    spec
}

#[test]
#[serial]
fn http_probes_gate_each_stage() {
    let (_dir, registry, monitor, discovery) = harness();
    let mut sequencer =
        StartupSequencer::new(Arc::clone(&registry), &monitor, discovery.clone(), false);

    let auth = stage(
        "auth",
        ReadinessProbe::Http {
            url: spawn_health_endpoint(0),
            secondary_url: Some(spawn_health_endpoint(0)),
        },
    );
    // Backend answers 503 twice before turning healthy, like a server
    // still wiring up routes; the poll loop must ride that out.
    let backend = stage(
        "backend",
        ReadinessProbe::Http {
            url: spawn_health_endpoint(2),
            secondary_url: None,
        },
    );
    let frontend = stage("frontend", ReadinessProbe::ProcessAlive);

    sequencer.run(auth, backend, frontend).unwrap();
    assert!(monitor.monitoring_enabled());

    for name in ["auth", "backend", "frontend"] {
        let record = discovery.read(name).unwrap().expect("record written");
        assert!(record.pid.is_some());
        assert!(registry.is_alive(name));
    }

    registry.terminate_all();
    for name in ["auth", "backend", "frontend"] {
        assert!(!registry.is_alive(name));
    }
}

#[test]
#[serial]
fn unreachable_endpoint_times_out_and_unwinds() {
    let (_dir, registry, monitor, discovery) = harness();
    let mut sequencer =
        StartupSequencer::new(Arc::clone(&registry), &monitor, discovery.clone(), false);

    // A port with nothing listening: connection refused on every poll.
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let auth = stage(
        "auth",
        ReadinessProbe::Http {
            url: spawn_health_endpoint(0),
            secondary_url: None,
        },
    );
    let mut backend = stage(
        "backend",
        ReadinessProbe::Http {
            url: format!("http://127.0.0.1:{closed}/health"),
            secondary_url: None,
        },
    );
    backend.readiness_timeout = Duration::from_secs(1);
    let frontend = stage("frontend", ReadinessProbe::ProcessAlive);

    let err = sequencer.run(auth, backend, frontend).unwrap_err();
    match err {
        SequencerError::Stage(StageError {
            kind: StageErrorKind::ReadinessTimeout { .. },
            ..
        }) => {}
        other => panic!("expected ReadinessTimeout, got {other:?}"),
    }

    // Auth was unwound, the frontend never launched, and nothing is
    // left in discovery for a later `down` to trip over.
    assert_eq!(sequencer.torn_down(), ["backend", "auth"]);
    assert!(!registry.is_alive("auth"));
    assert_eq!(registry.pid("frontend"), None);
    assert!(discovery.all().unwrap().is_empty());
    assert!(!monitor.monitoring_enabled());
}
