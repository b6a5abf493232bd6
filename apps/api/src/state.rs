use std::sync::Arc;

use allocation_engine::{AllocationEngine, EngineBackgroundTasks};

pub struct AppState {
    pub engine: Arc<AllocationEngine>,
    pub background: Arc<EngineBackgroundTasks>,
}
