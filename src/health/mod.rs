//! Health subsystem: per-service readiness gates and the periodic monitor
//! that drives health checks once gates open.

pub mod gate;
pub mod monitor;

pub use gate::{
    default_grace_period, ReadinessGate, ServiceState, BACKEND_GRACE_PERIOD,
    DEFAULT_GRACE_PERIOD, FRONTEND_GRACE_PERIOD,
};
pub use monitor::{
    HealthCheck, HealthMonitor, RecoveryAction, DEFAULT_CHECK_INTERVAL,
    DEFAULT_MAX_CONSECUTIVE_FAILURES,
};
