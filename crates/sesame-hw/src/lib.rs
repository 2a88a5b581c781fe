//! sesame-hw — hardware abstraction for the access-control agent.
//!
//! GPIO character-device line access (lock output, override input) and
//! V4L2 camera capture. The daemon depends only on the trait seams
//! ([`gpio::OutputLine`], [`gpio::InputLine`], [`camera::FrameSource`]).

pub mod camera;
pub mod frame;
pub mod gpio;

pub use camera::{CameraError, FrameSource, PixelFormat, UsbCamera};
pub use frame::Frame;
pub use gpio::{
    GpioError, GpioInputLine, GpioOutputLine, InputLine, Level, LogOnlyOutputLine, OutputLine,
};
