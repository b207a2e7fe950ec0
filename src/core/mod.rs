//! Routing core: quota tracking, throttling, dispatch

pub mod dispatch;
pub mod quota;
pub mod throttle;

pub use dispatch::CompletionRouter;
pub use quota::QuotaTracker;
pub use throttle::ThrottleController;
