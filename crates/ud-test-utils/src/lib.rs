// ud-test-utils: Shared test utilities for the drone control suite.
//
// Provides a scripted in-process drone speaking the real wire protocol over
// real multicast UDP, for integration testing of the controller engine
// without hardware on the bench.

pub mod mock_drone;

pub use mock_drone::{Behavior, DroneScript, MockDrone};
