/*!
# FleetWatch DevKit - test doubles for the kernel

Runs the supervision core without a broker or real devices:
- MQTT mock implementing the kernel's publishing seam
- Scripted probe and recording resetter / switcher / notifier / sink
- In-memory config source
- `TestHarness` wiring a complete kernel from these fakes
*/

pub mod fakes;
pub mod mqtt_stub;
pub mod test_utils;

pub use fakes::{
    InMemoryConfig, RecordingCommands, RecordingNotifier, RecordingResetter, RecordingSink,
    RecordingSwitcher, ProbeStep, ScriptedProbe, SlowScene,
};
pub use mqtt_stub::MockMqttClient;
pub use test_utils::TestHarness;
