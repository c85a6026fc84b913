use super::{ChatMemory, ChatMessage, SharedMemory};
use async_trait::async_trait;
use loomcore::{NodeContext, NodeError, SupplyDataNode, SupplyResponse};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps the last `window` messages of a conversation.
#[derive(Debug)]
pub struct BufferMemory {
    window: usize,
    messages: Mutex<Vec<ChatMessage>>,
}

impl BufferMemory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            messages: Mutex::new(Vec::new()),
        }
    }

    pub async fn clear(&self) -> usize {
        let mut messages = self.messages.lock().await;
        let count = messages.len();
        messages.clear();
        count
    }
}

#[async_trait]
impl ChatMemory for BufferMemory {
    async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    async fn append(&self, message: ChatMessage) {
        let mut messages = self.messages.lock().await;
        messages.push(message);
        if messages.len() > self.window {
            let excess = messages.len() - self.window;
            messages.drain(..excess);
        }
    }
}

pub struct BufferMemoryNode;

#[async_trait]
impl SupplyDataNode for BufferMemoryNode {
    async fn supply_data(&self, ctx: &NodeContext, _output_index: usize) -> Result<SupplyResponse, NodeError> {
        let window = ctx.get_parameter("window", 0, 10i64).as_f64().unwrap_or(10.0);
        if window < 1.0 {
            return Err(NodeError::Configuration(format!("window must be at least 1, got {}", window)));
        }

        let buffer = Arc::new(BufferMemory::new(window as usize));
        let closing = Arc::clone(&buffer);
        let node_id = ctx.node_id();
        let memory: SharedMemory = buffer;

        Ok(SupplyResponse::single(memory).with_close(move || {
            Box::pin(async move {
                let dropped = closing.clear().await;
                tracing::debug!(node_id = %node_id, dropped, "Memory buffer released");
            })
        }))
    }
}
