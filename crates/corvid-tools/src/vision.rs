//! Scene analysis tool.
//!
//! Captures a frame from the robot camera and runs it through the vision
//! provider. Video is decoded lazily: nothing touches the camera until the
//! LLM actually asks about the scene.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use corvid_core::VisionAnalyzer;
use corvid_robot::RobotClient;

use crate::registry::{Tool, ToolError};

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const CAPTURE_QUALITY: u32 = 80;

pub struct AnalyseSceneTool {
    robot: Arc<RobotClient>,
    vision: Arc<dyn VisionAnalyzer>,
}

impl AnalyseSceneTool {
    pub fn new(robot: Arc<RobotClient>, vision: Arc<dyn VisionAnalyzer>) -> Self {
        Self { robot, vision }
    }
}

#[async_trait]
impl Tool for AnalyseSceneTool {
    fn name(&self) -> &str {
        "analyse_scene"
    }

    fn description(&self) -> &str {
        "Describe what the robot's camera currently sees. Use when the user asks what is in \
         front of the robot or wants something in view identified."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "What the user wants to know about the scene"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let question = arguments
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("question required".into()))?;

        let jpeg = self
            .robot
            .capture_camera(CAPTURE_WIDTH, CAPTURE_HEIGHT, CAPTURE_QUALITY)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let answer = self
            .vision
            .analyse(&jpeg, question)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(json!(answer))
    }
}
