pub mod auth;
pub mod commands;
pub mod error;
pub mod mentions;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod pipeline;
pub mod reactions;
pub mod router;
pub mod ws;

use std::sync::Arc;

use huddle_db::Database;
use huddle_gateway::{Hub, SessionConfig, SessionContext};

use crate::auth::JwtAuthenticator;
use crate::pipeline::MessagePipeline;

pub use error::{ApiError, ApiResult};
pub use router::router;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub pipeline: Arc<MessagePipeline>,
    pub auth: Arc<JwtAuthenticator>,
    pub session: SessionContext,
}

impl AppStateInner {
    /// Wire the pipeline, the authenticator and the live-session context
    /// around one hub.
    pub fn new(db: Arc<Database>, hub: Hub, jwt_secret: &str, session: SessionConfig) -> AppState {
        let pipeline = Arc::new(MessagePipeline::new(db, hub.clone()));
        let auth = Arc::new(JwtAuthenticator::new(jwt_secret));

        Arc::new(Self {
            session: SessionContext {
                hub,
                authenticator: auth.clone(),
                access: pipeline.clone(),
                config: session,
            },
            pipeline,
            auth,
        })
    }
}
