//! Robot hardware tools.
//!
//! Thin translators from LLM tool arguments onto the gRPC client. Failures
//! come back as tool errors so the LLM can acknowledge them in conversation;
//! they never end the session.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;

use corvid_robot::RobotClient;

use crate::expression::{
    gesture_movements, resolve, ExpressionRateLimiter, RateLimiterConfig, VALID_EMOTIONS,
    VALID_INTENSITIES,
};
use crate::registry::{Tool, ToolError, ToolRegistry};

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const CAPTURE_QUALITY: u32 = 80;

/// Register the hardware tool set. Call only when a robot is attached;
/// browser-only sessions must not advertise these schemas.
pub fn register_robot_tools(registry: &mut ToolRegistry, robot: Arc<RobotClient>) {
    let limiter = Arc::new(ExpressionRateLimiter::new(RateLimiterConfig::default()));
    registry.register(ExecuteMovementTool { robot: robot.clone() });
    registry.register(ExpressTool {
        robot: robot.clone(),
        limiter,
    });
    registry.register(SetEmotionTool { robot: robot.clone() });
    registry.register(SetEyeStateTool { robot: robot.clone() });
    registry.register(CaptureCameraTool { robot: robot.clone() });
    registry.register(GetRobotStatusTool { robot });
}

/// Drives idle/listening/thinking/speaking eyes from pipeline state.
/// Best-effort: a miss is logged, never propagated.
#[derive(Clone)]
pub struct EyeStateSync {
    robot: Arc<RobotClient>,
}

impl EyeStateSync {
    pub fn new(robot: Arc<RobotClient>) -> Self {
        Self { robot }
    }

    pub async fn set(&self, state: &str) {
        if let Err(e) = self.robot.set_eye_state(state).await {
            tracing::debug!(state = %state, error = %e, "eye state sync failed");
        }
    }
}

struct ExecuteMovementTool {
    robot: Arc<RobotClient>,
}

#[async_trait]
impl Tool for ExecuteMovementTool {
    fn name(&self) -> &str {
        "execute_movement"
    }

    fn description(&self) -> &str {
        "Execute DISPLACEMENT movements on the robot. Use ONLY when the user explicitly asks \
         to move the robot's position. Available: step_forward, walk_forward, step_backward, \
         walk_backward, turn_left, turn_right, turn_left_slow, turn_right_slow. Example: \
         'turn around' -> [\"turn_left\", \"turn_left\"]. Do NOT use for expressions."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "gestures": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": "Movements to execute in sequence"
                }
            },
            "required": ["gestures"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let gestures: Vec<String> = arguments
            .get("gestures")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| ToolError::InvalidArguments("gestures[] required".into()))?;

        if gestures.is_empty() {
            return Err(ToolError::InvalidArguments("no movements specified".into()));
        }

        let duration = self
            .robot
            .execute_movement(&gestures)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        tracing::info!(movements = ?gestures, "movements executed");
        Ok(json!(format!(
            "Executed {} (took {:.2}s)",
            gestures.join(", "),
            duration.as_secs_f64()
        )))
    }
}

struct ExpressTool {
    robot: Arc<RobotClient>,
    limiter: Arc<ExpressionRateLimiter>,
}

#[async_trait]
impl Tool for ExpressTool {
    fn name(&self) -> &str {
        "express"
    }

    fn description(&self) -> &str {
        "Convey an emotional response. Intensity controls hardware channels: low = eyes only \
         (default), medium = eyes + subtle gesture, high = eyes + expressive gesture (rare). \
         Valid emotions: neutral, happy, sad, angry, excited, afraid, sleepy, greeting, \
         farewell, celebration, apologetic. Default to low; do not express on every message."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "emotion": {
                    "type": "string",
                    "enum": VALID_EMOTIONS,
                    "description": "The emotion to express"
                },
                "intensity": {
                    "type": "string",
                    "enum": VALID_INTENSITIES,
                    "default": "low",
                    "description": "low (eyes only), medium (subtle gesture), high (expressive gesture)"
                }
            },
            "required": ["emotion"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let emotion = arguments
            .get("emotion")
            .and_then(Value::as_str)
            .unwrap_or("neutral");
        let mut intensity = arguments
            .get("intensity")
            .and_then(Value::as_str)
            .unwrap_or("low");

        let emotion = if VALID_EMOTIONS.contains(&emotion) {
            emotion
        } else {
            tracing::warn!(emotion = %emotion, "invalid emotion, using neutral");
            "neutral"
        };
        if !VALID_INTENSITIES.contains(&intensity) {
            intensity = "low";
        }

        if let Err(reason) = self.limiter.check(intensity) {
            tracing::warn!(reason = %reason, "expression downgraded to low");
            intensity = "low";
        }

        let expression = resolve(emotion, intensity);
        self.robot
            .set_emotion(expression.eyes)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let mut had_gesture = false;
        if let Some(gesture) = expression.gesture {
            if intensity != "low" {
                self.robot
                    .execute_movement(&gesture_movements(gesture))
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                had_gesture = true;
            }
        }

        self.limiter.record(intensity, had_gesture);
        tracing::info!(emotion, intensity, eyes = expression.eyes, "expressed");
        Ok(json!(format!("Expressed {} at {} intensity", emotion, intensity)))
    }
}

struct SetEmotionTool {
    robot: Arc<RobotClient>,
}

#[async_trait]
impl Tool for SetEmotionTool {
    fn name(&self) -> &str {
        "set_emotion"
    }

    fn description(&self) -> &str {
        "Set the robot's facial emotion directly: neutral, happy, sad, angry, excited, afraid, sleepy."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Emotion name" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("name required".into()))?;

        self.robot
            .set_emotion(name)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(json!("ok"))
    }
}

struct SetEyeStateTool {
    robot: Arc<RobotClient>,
}

#[async_trait]
impl Tool for SetEyeStateTool {
    fn name(&self) -> &str {
        "set_eye_state"
    }

    fn description(&self) -> &str {
        "Set the robot's eye animation state: idle, listening, thinking, speaking."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Eye state name" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("name required".into()))?;

        self.robot
            .set_eye_state(name)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(json!("ok"))
    }
}

struct CaptureCameraTool {
    robot: Arc<RobotClient>,
}

#[async_trait]
impl Tool for CaptureCameraTool {
    fn name(&self) -> &str {
        "capture_camera_view"
    }

    fn description(&self) -> &str {
        "Capture a still image from the robot's camera. Returns a base64 JPEG."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        let jpeg = self
            .robot
            .capture_camera(CAPTURE_WIDTH, CAPTURE_HEIGHT, CAPTURE_QUALITY)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        tracing::info!(bytes = jpeg.len(), "captured camera frame");
        Ok(json!({
            "status": "ok",
            "image": base64::engine::general_purpose::STANDARD.encode(&jpeg),
            "width": CAPTURE_WIDTH,
            "height": CAPTURE_HEIGHT,
            "format": "jpeg",
        }))
    }
}

struct GetRobotStatusTool {
    robot: Arc<RobotClient>,
}

#[async_trait]
impl Tool for GetRobotStatusTool {
    fn name(&self) -> &str {
        "get_robot_status"
    }

    fn description(&self) -> &str {
        "Get the robot's current status: battery, emotion, eye state, movement."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        let status = self
            .robot
            .get_status()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(json!({
            "connected": status.connected,
            "battery_percent": status.battery_percent,
            "charging": status.charging,
            "emotion": status.emotion,
            "eye_state": status.eye_state,
            "moving": status.moving,
            "current_movement": status.current_movement,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_robot::RobotClientConfig;

    fn registry_with_robot() -> ToolRegistry {
        let robot = Arc::new(RobotClient::connect_lazy(RobotClientConfig::default()).unwrap());
        let mut registry = ToolRegistry::new();
        register_robot_tools(&mut registry, robot);
        registry
    }

    #[tokio::test]
    async fn test_all_hardware_tools_registered() {
        let registry = registry_with_robot();
        for name in [
            "execute_movement",
            "express",
            "set_emotion",
            "set_eye_state",
            "capture_camera_view",
            "get_robot_status",
        ] {
            assert!(registry.has(name), "missing tool {}", name);
        }
    }

    #[tokio::test]
    async fn test_schemas_are_objects() {
        let registry = registry_with_robot();
        for def in registry.definitions() {
            assert_eq!(def.parameters["type"], "object", "{}", def.name);
        }
    }

    #[tokio::test]
    async fn test_execute_movement_rejects_missing_gestures() {
        let registry = registry_with_robot();
        let err = registry
            .execute("execute_movement", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
