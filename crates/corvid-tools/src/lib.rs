//! Tools exposed to the LLM.
//!
//! The registry holds `Tool` implementations keyed by name and enforces a
//! per-call timeout. Robot tools translate LLM arguments onto the gRPC
//! hardware client; they are only registered when a robot is attached, so
//! browser-only sessions never advertise hardware schemas.

mod expression;
mod registry;
mod robot;
mod vision;

pub use expression::{ExpressionRateLimiter, RateLimiterConfig};
pub use registry::{Tool, ToolError, ToolRegistry};
pub use robot::{register_robot_tools, EyeStateSync};
pub use vision::AnalyseSceneTool;
