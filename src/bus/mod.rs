//! 消息总线：消息信封与发布/订阅传输

mod broker;
mod message;

pub use broker::{
    channel_for, BusError, InMemoryBus, MessageBus, Subscription, AGENT_CHANNEL_PREFIX,
    STATUS_CHANNEL,
};
pub use message::{AgentId, Message, Payload, TaskStatus};
