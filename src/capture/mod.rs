pub mod controller;
pub mod frame;
pub mod sim_bus;
pub mod snapshot;
pub mod strategy;
pub mod transport;

pub use controller::{CaptureController, CaptureState, IrqLine};
pub use frame::{Frame, FrameMetadata, FrameRef, PixelFormat};
pub use sim_bus::{FrameSource, SimBus, SimBusHandle, SimFault, TestPattern};
pub use snapshot::CaptureEngine;
pub use strategy::{CaptureSession, TransferKind};
pub use transport::{BusSetup, DmaTarget, TransferMode, Transport};
