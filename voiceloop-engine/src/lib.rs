pub mod confirm;
pub mod dispatch;
pub mod engine;
pub mod frames;
pub mod playback;
pub mod session;
pub mod supervisor;
pub mod tools;
pub mod traits;
pub mod transcript;
pub mod vad;
