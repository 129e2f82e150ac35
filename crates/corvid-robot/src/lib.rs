//! gRPC client for the robot hardware daemon.
//!
//! The client is shared across sessions; mutating calls (movement, emotion,
//! eye state) are serialised so concurrent sessions cannot interleave servo
//! commands. Every call carries a strict deadline and a failure is isolated
//! to a tool error, never a session failure.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

pub mod proto {
    #![allow(unreachable_pub)]
    tonic::include_proto!("robot");
}

use proto::robot_control_client::RobotControlClient;
use proto::{
    CaptureRequest, EmotionRequest, EyeStateRequest, HealthRequest, MovementRequest,
    StatusRequest, StatusResponse,
};

#[derive(Error, Debug)]
pub enum RobotError {
    #[error("robot unreachable: {0}")]
    Unreachable(String),

    #[error("robot command deadline exceeded")]
    Deadline,

    #[error("robot command failed: {0}")]
    Command(String),
}

impl From<tonic::Status> for RobotError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::DeadlineExceeded => RobotError::Deadline,
            tonic::Code::Unavailable => RobotError::Unreachable(status.message().to_string()),
            _ => RobotError::Command(status.message().to_string()),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct RobotClientConfig {
    /// Daemon address, e.g. `http://100.64.0.2:50051`.
    pub address: String,
    pub command_timeout: Duration,
    pub capture_timeout: Duration,
}

impl Default for RobotClientConfig {
    fn default() -> Self {
        use corvid_config::constants::robot;
        Self {
            address: "http://127.0.0.1:50051".to_string(),
            command_timeout: Duration::from_millis(robot::COMMAND_TIMEOUT_MS),
            capture_timeout: Duration::from_millis(robot::CAPTURE_TIMEOUT_MS),
        }
    }
}

/// Shared robot client.
#[derive(Clone)]
pub struct RobotClient {
    config: RobotClientConfig,
    client: RobotControlClient<Channel>,
    /// Serialises mutating calls per device.
    command_lock: Arc<Mutex<()>>,
}

impl RobotClient {
    /// Connect lazily; the first RPC establishes the channel.
    pub fn connect_lazy(config: RobotClientConfig) -> Result<Self, RobotError> {
        let endpoint = Endpoint::from_shared(config.address.clone())
            .map_err(|e| RobotError::Unreachable(e.to_string()))?
            .connect_timeout(config.command_timeout)
            .timeout(config.capture_timeout.max(config.command_timeout));

        let channel = endpoint.connect_lazy();
        Ok(Self {
            config,
            client: RobotControlClient::new(channel),
            command_lock: Arc::new(Mutex::new(())),
        })
    }

    fn request<T>(&self, message: T, timeout: Duration) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(timeout);
        request
    }

    pub async fn health(&self) -> Result<bool, RobotError> {
        let mut client = self.client.clone();
        let response = client
            .health(self.request(HealthRequest {}, self.config.command_timeout))
            .await?;
        Ok(response.into_inner().healthy)
    }

    /// Execute a movement sequence. Returns the execution duration.
    pub async fn execute_movement(&self, movements: &[String]) -> Result<Duration, RobotError> {
        let _guard = self.command_lock.lock().await;
        let mut client = self.client.clone();
        let response = client
            .execute_movement(self.request(
                MovementRequest {
                    movements: movements.to_vec(),
                },
                self.config.command_timeout,
            ))
            .await?
            .into_inner();

        if !response.success {
            return Err(RobotError::Command(response.error));
        }
        Ok(Duration::from_secs_f64(response.duration_secs))
    }

    /// Capture a JPEG frame from the robot camera.
    pub async fn capture_camera(
        &self,
        width: u32,
        height: u32,
        jpeg_quality: u32,
    ) -> Result<Vec<u8>, RobotError> {
        let mut client = self.client.clone();
        let response = client
            .capture_camera(self.request(
                CaptureRequest {
                    width,
                    height,
                    jpeg_quality,
                },
                self.config.capture_timeout,
            ))
            .await?
            .into_inner();

        if response.jpeg.is_empty() {
            return Err(RobotError::Command("empty capture".into()));
        }
        Ok(response.jpeg)
    }

    pub async fn set_emotion(&self, emotion: &str) -> Result<(), RobotError> {
        let _guard = self.command_lock.lock().await;
        let mut client = self.client.clone();
        let ack = client
            .set_emotion(self.request(
                EmotionRequest {
                    emotion: emotion.to_string(),
                },
                self.config.command_timeout,
            ))
            .await?
            .into_inner();

        if !ack.success {
            return Err(RobotError::Command(ack.error));
        }
        Ok(())
    }

    pub async fn set_eye_state(&self, state: &str) -> Result<(), RobotError> {
        let _guard = self.command_lock.lock().await;
        let mut client = self.client.clone();
        let ack = client
            .set_eye_state(self.request(
                EyeStateRequest {
                    state: state.to_string(),
                },
                self.config.command_timeout,
            ))
            .await?
            .into_inner();

        if !ack.success {
            return Err(RobotError::Command(ack.error));
        }
        Ok(())
    }

    pub async fn get_status(&self) -> Result<StatusResponse, RobotError> {
        let mut client = self.client.clone();
        let response = client
            .get_status(self.request(StatusRequest {}, self.config.command_timeout))
            .await?;
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_lazy_accepts_valid_address() {
        let client = RobotClient::connect_lazy(RobotClientConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_connect_lazy_rejects_bad_address() {
        let config = RobotClientConfig {
            address: "not a uri\u{7f}".into(),
            ..Default::default()
        };
        assert!(RobotClient::connect_lazy(config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_daemon_surfaces_as_error() {
        // Nothing listens here; the RPC must fail within the deadline, not hang.
        let config = RobotClientConfig {
            address: "http://127.0.0.1:1".into(),
            command_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let client = RobotClient::connect_lazy(config).unwrap();
        let result = client.health().await;
        assert!(result.is_err());
    }

    #[test]
    fn test_status_code_mapping() {
        let deadline = tonic::Status::new(tonic::Code::DeadlineExceeded, "late");
        assert!(matches!(RobotError::from(deadline), RobotError::Deadline));

        let unavailable = tonic::Status::new(tonic::Code::Unavailable, "down");
        assert!(matches!(
            RobotError::from(unavailable),
            RobotError::Unreachable(_)
        ));
    }
}
