pub mod live;
pub mod protocol;
