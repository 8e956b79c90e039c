pub mod pcm;
pub mod resample;

#[cfg(feature = "device")]
pub mod device;

#[cfg(feature = "device")]
pub use device::{CpalDevices, CpalInput, CpalOutput};
