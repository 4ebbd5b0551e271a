pub mod export;
pub mod sink;
pub mod view;

pub use sink::ResultSink;
pub use view::Axis;
