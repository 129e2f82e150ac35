//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use corvid_config::Settings;
use corvid_robot::{RobotClient, RobotClientConfig};

use crate::session::SessionManager;
use crate::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    /// Shared across sessions; mutating calls are serialised inside.
    pub robot: Option<Arc<RobotClient>>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self, ServerError> {
        let robot = if settings.robot.enabled {
            let client = RobotClient::connect_lazy(RobotClientConfig {
                address: settings.robot.address.clone(),
                command_timeout: Duration::from_millis(settings.robot.command_timeout_ms),
                capture_timeout: Duration::from_millis(settings.robot.capture_timeout_ms),
            })
            .map_err(|e| ServerError::Init(format!("robot: {}", e)))?;
            tracing::info!(address = %settings.robot.address, "robot client attached");
            Some(Arc::new(client))
        } else {
            None
        };

        Ok(Self {
            sessions: Arc::new(SessionManager::new(settings.server.max_sessions)),
            settings: Arc::new(settings),
            robot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_without_robot() {
        let state = AppState::new(Settings::default()).unwrap();
        assert!(state.robot.is_none());
        assert_eq!(state.sessions.count(), 0);
    }

    #[tokio::test]
    async fn test_state_with_robot() {
        let mut settings = Settings::default();
        settings.robot.enabled = true;
        settings.robot.address = "http://127.0.0.1:50051".into();
        let state = AppState::new(settings).unwrap();
        assert!(state.robot.is_some());
    }
}
