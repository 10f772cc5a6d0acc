use std::sync::Arc;

use crate::monitor::Monitor;
use crate::storage::TriggerLog;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub trigger_log: Option<Arc<TriggerLog>>,
}
