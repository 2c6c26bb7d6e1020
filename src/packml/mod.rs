//! PackML (ISA-TR88) lifecycle machinery: the closed state set shared by
//! the orchestrator and every station, the orchestrator's own controller
//! (§4.1), and the station-side wire contract it talks to (§4.6).
//!
//! ```text
//! packml/
//! ├── state.rs      - the closed PackMLState enum and its string mapping
//! ├── controller.rs - the orchestrator's control loop
//! └── station.rs     - the station-side queue/state machine
//! ```

pub mod controller;
pub mod state;
pub mod station;

pub use controller::Controller;
pub use state::PackMlState;
