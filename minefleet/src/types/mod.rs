//! Domain types shared by the control loop components.

mod debounced_alarm;
mod device;
mod event;
mod telemetry;

pub use debounced_alarm::{AlarmStatus, DebouncedAlarm};
pub use device::{Device, DeviceId, DeviceStatus, DeviceType, Mode};
pub use event::{Event, EventCategory, Severity};
pub use telemetry::{Metric, TelemetryReading, TelemetrySample};
