use std::{path::PathBuf, sync::Arc};

use joda_session::SessionSync;

/// Shared application state.
pub struct AppState {
    /// The one session this server fronts.
    pub session: Arc<SessionSync>,
    /// Directory containing built UI static files.
    pub ui_dir: PathBuf,
    /// Page URL referral links point at.
    pub site_url: String,
}
