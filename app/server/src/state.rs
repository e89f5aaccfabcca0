use std::sync::Arc;

use careline::{
    ChatEngine, ContactService, DrugService, KnowledgeManager, MemoryService, Store,
    UploadPipeline,
};

/// Shared handles for every route. All fields are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub chat: Arc<ChatEngine>,
    pub memory: Arc<MemoryService>,
    pub knowledge: KnowledgeManager,
    pub contacts: ContactService,
    pub drugs: DrugService,
    pub uploads: UploadPipeline,
}
